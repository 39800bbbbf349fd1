// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Signal delivery through `signalfd`, shared by both backends.
//!
//! Mirrors `ext/ev/signal.c`'s watcher: the signal is blocked from its
//! default disposition via `sigprocmask` and instead observed as
//! readiness on a file descriptor, so it composes with whichever
//! backend is driving the event loop.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

use crate::fiber::FiberId;

/// Tracks which fibers are waiting on which signal numbers, and owns
/// the underlying `signalfd`.
pub struct SignalBackend {
    fd: RawFd,
    mask: libc::sigset_t,
    waiters: HashMap<i32, Vec<FiberId>>,
}

impl SignalBackend {
    pub fn new() -> io::Result<Self> {
        let mask = empty_sigset();
        let fd = create_signalfd(&mask, -1)?;
        Ok(SignalBackend {
            fd,
            mask,
            waiters: HashMap::new(),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Register `fiber` as waiting for `signal`. Blocks the signal from
    /// normal delivery and widens the signalfd's mask if this is the
    /// first waiter for it.
    pub fn watch(&mut self, signal: i32, fiber: FiberId) -> io::Result<()> {
        if !self.waiters.contains_key(&signal) {
            unsafe {
                libc::sigaddset(&mut self.mask, signal);
                if libc::sigprocmask(libc::SIG_BLOCK, &self.mask, std::ptr::null_mut()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            let new_fd = create_signalfd(&self.mask, self.fd)?;
            self.fd = new_fd;
        }
        self.waiters.entry(signal).or_default().push(fiber);
        Ok(())
    }

    /// Read one pending `signalfd_siginfo` (non-blocking) and return the
    /// fibers waiting on that signal number, removing them from the
    /// waiter list (each is a one-shot wait, matching `wait_signal`'s
    /// single-completion contract).
    pub fn poll_one(&mut self) -> io::Result<Option<(i32, Vec<FiberId>)>> {
        let mut info = MaybeUninit::<libc::signalfd_siginfo>::uninit();
        let size = std::mem::size_of::<libc::signalfd_siginfo>();
        let n = unsafe { libc::read(self.fd, info.as_mut_ptr().cast(), size) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        if n as usize != size {
            return Ok(None);
        }
        let info = unsafe { info.assume_init() };
        let signo = info.ssi_signo as i32;
        let fibers = self.waiters.remove(&signo).unwrap_or_default();
        Ok(Some((signo, fibers)))
    }

    /// Re-create the signalfd after a fork, re-arming the same signal
    /// mask. Any fibers that were waiting belonged to the parent and are
    /// dropped, matching the "outstanding operations from the parent are
    /// abandoned" fork rule.
    pub fn post_fork(&mut self) -> io::Result<()> {
        self.waiters.clear();
        let fd = create_signalfd(&self.mask, self.fd)?;
        self.fd = fd;
        Ok(())
    }

    /// Idempotently close the signalfd ahead of `Drop`, e.g. from
    /// `Runtime::finalize`. Safe to call more than once.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
        self.waiters.clear();
    }
}

impl Drop for SignalBackend {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

fn empty_sigset() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigemptyset(set.as_mut_ptr());
        set.assume_init()
    }
}

fn create_signalfd(mask: &libc::sigset_t, existing: RawFd) -> io::Result<RawFd> {
    let flags = libc::SFD_NONBLOCK | libc::SFD_CLOEXEC;
    let fd = unsafe { libc::signalfd(existing, mask, flags) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}
