// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness-backend watcher bookkeeping.

use bitflags::bitflags;
use std::os::unix::io::RawFd;

use crate::context::ContextId;
use crate::error::Error;
use crate::fiber::FiberId;

bitflags! {
    /// A watcher's interest set. Maps to libev's `EV_READ`/`EV_WRITE`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Interest: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

impl Interest {
    /// Parse the `r`/`w`/`rw` tags the op surface accepts. Anything else
    /// is an argument error.
    pub fn from_tag(tag: &str) -> Result<Self, Error> {
        match tag {
            "r" => Ok(Interest::READ),
            "w" => Ok(Interest::WRITE),
            "rw" => Ok(Interest::READ | Interest::WRITE),
            other => Err(Error::argument(format!("invalid watcher interest: {other:?}"))),
        }
    }

    pub(crate) fn to_poll_events(self) -> i16 {
        let mut events = 0;
        if self.contains(Interest::READ) {
            events |= libc::POLLIN;
        }
        if self.contains(Interest::WRITE) {
            events |= libc::POLLOUT;
        }
        events as i16
    }
}

/// A one-shot registration of interest on a single fd, bound to exactly
/// one fiber at a time. Two fibers racing to await the same (fd,
/// interest) is a misuse documented as undefined in the design notes;
/// in debug builds the second registration trips a `debug_assert!`.
#[derive(Debug)]
pub struct Watcher {
    pub fd: RawFd,
    pub interest: Interest,
    pub active: bool,
    pub fiber: Option<FiberId>,
    pub context: Option<ContextId>,
}

impl Watcher {
    pub fn new(fd: RawFd, interest: Interest) -> Self {
        Watcher {
            fd,
            interest,
            active: false,
            fiber: None,
            context: None,
        }
    }

    /// `fiber` is `None` for a watcher nothing in particular owns (e.g.
    /// the shared signalfd poll): its completion still counts toward
    /// `outstanding` and still stops the watcher, it just never
    /// resumes anyone on its own.
    pub fn arm(&mut self, fiber: Option<FiberId>, context: ContextId) {
        debug_assert!(
            !self.active,
            "two fibers concurrently awaiting the same (fd, interest) is a program error"
        );
        self.fiber = fiber;
        self.context = Some(context);
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
        self.fiber = None;
        self.context = None;
    }
}
