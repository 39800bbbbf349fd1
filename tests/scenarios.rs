// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fibra::Runtime;

fn make_pipe() -> (i32, i32) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    unsafe {
        let flags = libc::fcntl(fds[0], libc::F_GETFL);
        libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK);
        let flags = libc::fcntl(fds[1], libc::F_GETFL);
        libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
    (fds[0], fds[1])
}

#[test]
fn read_loop_delivers_every_chunk() {
    let rt = Runtime::new().unwrap();
    let (read_fd, write_fd) = make_pipe();

    rt.spawn(move |io| {
        for word in ["alpha", "beta", "gamma"] {
            io.write(write_fd, word.as_bytes()).unwrap();
        }
        unsafe {
            libc::close(write_fd);
        }
    });

    let received: Rc<std::cell::RefCell<Vec<u8>>> = Rc::new(std::cell::RefCell::new(Vec::new()));
    let received_w = received.clone();
    rt.spawn(move |io| {
        io.read_loop(read_fd, 4096, |chunk| {
            received_w.borrow_mut().extend_from_slice(chunk);
        })
        .unwrap();
        unsafe {
            libc::close(read_fd);
        }
    });

    rt.run().unwrap();
    assert_eq!(&*received.borrow(), b"alphabetagamma");
}

#[test]
fn timeout_fires_before_long_sleep() {
    let rt = Runtime::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_w = fired.clone();

    rt.spawn(move |io| {
        let result = io.timeout(
            Duration::from_millis(20),
            |io| -> fibra::Result<()> {
                io.sleep(Duration::from_secs(5))?;
                Ok(())
            },
            || { fired_w.fetch_add(1, Ordering::SeqCst); },
        );
        assert!(result.is_ok());
    });

    rt.run().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

#[test]
fn timeout_does_not_fire_on_fast_body() {
    let rt = Runtime::new().unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired_w = fired.clone();

    rt.spawn(move |io| {
        let result = io.timeout(
            Duration::from_millis(200),
            |io| -> fibra::Result<i32> {
                io.sleep(Duration::from_millis(5))?;
                Ok(42)
            },
            || {
                fired_w.fetch_add(1, Ordering::SeqCst);
                0
            },
        );
        assert_eq!(result.unwrap(), 42);
    });

    rt.run().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}

#[test]
fn chain_stops_at_the_first_failing_leg() {
    use fibra::ChainOp;

    let rt = Runtime::new().unwrap();
    if rt.kind() != fibra::BackendKind::IoUring {
        // Chains are a completion-ring-only capability.
        return;
    }

    let (read_fd, write_fd) = make_pipe();
    unsafe {
        libc::close(read_fd);
    }
    let closed_fd = read_fd;

    rt.spawn(move |io| {
        let ops = vec![
            ChainOp::Write {
                fd: write_fd,
                buf: Arc::from(b"first leg".as_slice()),
            },
            ChainOp::Write {
                fd: closed_fd,
                buf: Arc::from(b"second leg, targets a closed fd".as_slice()),
            },
        ];
        let result = io.chain(ops);
        assert!(result.is_err() || result.unwrap() < 0);
        unsafe {
            libc::close(write_fd);
        }
    });

    rt.run().unwrap();
}

#[test]
fn multishot_accept_collects_five_connections() {
    let rt = Runtime::new().unwrap();
    if rt.kind() != fibra::BackendKind::IoUring {
        return;
    }

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let listener_fd = listener.as_raw_fd();

    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(20));
        let mut conns = Vec::new();
        for _ in 0..5 {
            conns.push(TcpStream::connect(addr).unwrap());
        }
        std::thread::sleep(Duration::from_millis(50));
        drop(conns);
    });

    let accepted = Rc::new(std::cell::Cell::new(0usize));
    let accepted_w = accepted.clone();
    rt.spawn(move |io| {
        io.multishot_accept(listener_fd, move |_io, fd| {
            accepted_w.set(accepted_w.get() + 1);
            unsafe {
                libc::close(fd);
            }
            accepted_w.get() < 5
        })
        .unwrap();
    });

    rt.run().unwrap();
    assert_eq!(accepted.get(), 5);
}

#[test]
fn snooze_round_robins_across_many_fibers() {
    let rt = Runtime::new().unwrap();
    let order = Rc::new(std::cell::RefCell::new(Vec::new()));

    for id in 0..100 {
        let order = order.clone();
        rt.spawn(move |io| {
            io.snooze();
            order.borrow_mut().push(id);
        });
    }

    rt.run().unwrap();
    let order = order.borrow();
    assert_eq!(order.len(), 100);
    // Every fiber's single snooze yields exactly once, so they all
    // resume in the order they were originally spawned.
    assert!(order.windows(2).all(|w| w[0] < w[1]));
}
