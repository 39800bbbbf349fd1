// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Exercises the portable `poll(2)` path directly, bypassing backend
//! auto-detection, so these scenarios run the same on every target.

use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::rc::Rc;
use std::time::Duration;

use fibra::config::BackendKind;
use fibra::{Runtime, RuntimeConfig};

fn readiness_runtime() -> Runtime {
    Runtime::with_config(RuntimeConfig::new().backend(BackendKind::Readiness)).unwrap()
}

#[test]
fn backend_kind_is_readiness() {
    let rt = readiness_runtime();
    assert_eq!(rt.kind(), BackendKind::Readiness);
}

#[test]
fn accept_and_echo_one_connection() {
    let rt = readiness_runtime();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listener_fd = listener.as_raw_fd();

    std::thread::spawn(move || {
        use std::io::{Read, Write};
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    });

    rt.spawn(move |io| {
        let fd = io.accept(listener_fd).unwrap();
        let request = io.read(fd, 4).unwrap();
        assert_eq!(&request, b"ping");
        io.write(fd, b"pong").unwrap();
        unsafe {
            libc::close(fd);
        }
    });

    rt.run().unwrap();
}

#[test]
fn sleep_blocks_only_the_calling_fiber() {
    let rt = readiness_runtime();
    let order = Rc::new(std::cell::RefCell::new(Vec::new()));

    let order_a = order.clone();
    rt.spawn(move |io| {
        io.sleep(Duration::from_millis(30)).unwrap();
        order_a.borrow_mut().push('a');
    });

    let order_b = order.clone();
    rt.spawn(move |io| {
        io.sleep(Duration::from_millis(5)).unwrap();
        order_b.borrow_mut().push('b');
    });

    rt.run().unwrap();
    assert_eq!(&*order.borrow(), &['b', 'a']);
}

#[test]
fn wait_io_unblocks_on_readiness() {
    let rt = readiness_runtime();
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    let [read_fd, write_fd] = fds;
    unsafe {
        let flags = libc::fcntl(read_fd, libc::F_GETFL);
        libc::fcntl(read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }

    rt.spawn(move |io| {
        io.wait_io(read_fd, "r").unwrap();
        let data = io.read(read_fd, 16).unwrap();
        assert_eq!(&data, b"hello");
    });

    std::thread::spawn(move || {
        use std::io::Write;
        std::thread::sleep(Duration::from_millis(10));
        let mut f = unsafe { std::fs::File::from_raw_fd(write_fd) };
        f.write_all(b"hello").unwrap();
    });

    rt.run().unwrap();
}
