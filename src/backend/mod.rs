// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The pluggable kernel-I/O adapter seam.
//!
//! A [`Backend`] is either a completion ring ([`uring::UringBackend`]) or
//! a readiness reactor ([`readiness::ReadinessBackend`]).
//!
//! The two backends do not share an op surface the way a naive "submit
//! a read, await it" trait might suggest. The completion backend
//! genuinely submits kernel work items and waits for the kernel to
//! report a result. The readiness backend instead performs the syscall
//! itself, inline, and only defers to the event loop on `EAGAIN` — the
//! op surface in [`crate::runtime`] calls straight into `libc` for the
//! readiness path and only asks the backend for the one thing it
//! actually provides: "wake me when this fd is ready". This mirrors the
//! two real implementations this crate is grounded on, which are
//! separate C translation units with no shared op dispatch either.
//!
//! What both backends do share: context lifecycle (acquire/result/
//! release/cancel), the blocking wait the scheduler parks in, wakeup,
//! fork recovery, and fiber parking. That shared contract is this enum.

pub mod readiness;
pub mod uring;

use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::BackendKind;
use crate::context::{ContextId, ContextStore, OpContext};
use crate::error::{Error, Result};
use crate::fiber::FiberId;
use crate::runqueue::RunQueue;
use crate::watcher::Interest;

pub use readiness::ReadinessBackend;
pub use uring::{ChainOp, UringBackend};

#[derive(Debug, Default, Clone, Copy)]
pub struct PollOutcome {
    pub completions: usize,
}

/// State every backend needs regardless of kind: the op-context pool
/// and a count of operations the kernel (or a watcher) still owes a
/// result for. `outstanding` is what [`Runtime::run`](crate::runtime::Runtime::run)
/// checks before declaring deadlock.
#[derive(Default)]
pub struct BackendBase {
    pub contexts: ContextStore,
    pub outstanding: usize,
}

impl BackendBase {
    pub fn new() -> Self {
        BackendBase {
            contexts: ContextStore::new(),
            outstanding: 0,
        }
    }
}

pub enum Backend {
    Uring(UringBackend),
    Readiness(ReadinessBackend),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Uring(_) => BackendKind::IoUring,
            Backend::Readiness(_) => BackendKind::Readiness,
        }
    }

    pub fn poll(&mut self, run_queue: &mut RunQueue, blocking: bool) -> Result<PollOutcome> {
        match self {
            Backend::Uring(b) => b.poll(run_queue, blocking),
            Backend::Readiness(b) => b.poll(run_queue, blocking),
        }
    }

    pub fn wakeup(&mut self) -> Result<()> {
        match self {
            Backend::Uring(b) => b.wakeup(),
            Backend::Readiness(b) => b.wakeup(),
        }
    }

    pub fn outstanding(&self) -> usize {
        match self {
            Backend::Uring(b) => b.outstanding(),
            Backend::Readiness(b) => b.outstanding(),
        }
    }

    pub fn post_fork(&mut self) -> Result<()> {
        match self {
            Backend::Uring(b) => b.post_fork(),
            Backend::Readiness(b) => b.post_fork(),
        }
    }

    /// Cancel anything still outstanding and free the op-context store.
    /// Part of [`crate::runtime::Runtime::finalize`]'s teardown.
    pub fn shutdown(&mut self) {
        match self {
            Backend::Uring(b) => b.shutdown(),
            Backend::Readiness(b) => b.shutdown(),
        }
    }

    pub fn idle_budget(&self) -> Option<Duration> {
        match self {
            Backend::Uring(_) => None,
            Backend::Readiness(b) => b.next_deadline(),
        }
    }

    pub fn context(&self, id: ContextId) -> Option<&OpContext> {
        match self {
            Backend::Uring(b) => b.base.contexts.get(id),
            Backend::Readiness(b) => b.base.contexts.get(id),
        }
    }

    pub fn context_mut(&mut self, id: ContextId) -> Option<&mut OpContext> {
        match self {
            Backend::Uring(b) => b.base.contexts.get_mut(id),
            Backend::Readiness(b) => b.base.contexts.get_mut(id),
        }
    }

    pub fn release(&mut self, id: ContextId) {
        match self {
            Backend::Uring(b) => b.base.contexts.release(id),
            Backend::Readiness(b) => b.base.contexts.release(id),
        }
    }

    pub fn cancel(&mut self, id: ContextId) -> Result<()> {
        match self {
            Backend::Uring(b) => b.cancel(id),
            Backend::Readiness(b) => b.cancel(id),
        }
    }

    /// Generic "wake me when fd is ready for `interest`" primitive.
    /// Backs `wait_io`, the readiness-backend read/write/accept loops,
    /// the `waitpid` pidfd fallback, and `wait_event`.
    pub fn start_poll(&mut self, fd: RawFd, interest: Interest, fiber: Option<FiberId>) -> Result<ContextId> {
        match self {
            Backend::Uring(b) => b.start_poll(fd, interest, fiber),
            Backend::Readiness(b) => b.start_poll(fd, interest, fiber),
        }
    }

    pub fn start_timeout(&mut self, dur: Duration, fiber: FiberId) -> Result<ContextId> {
        match self {
            Backend::Uring(b) => b.start_timeout(dur, fiber),
            Backend::Readiness(b) => b.start_timeout(dur, fiber),
        }
    }

    pub fn as_uring_mut(&mut self) -> Result<&mut UringBackend> {
        match self {
            Backend::Uring(b) => Ok(b),
            Backend::Readiness(_) => Err(Error::argument(
                "this operation requires the io_uring backend",
            )),
        }
    }

    pub fn is_uring(&self) -> bool {
        matches!(self, Backend::Uring(_))
    }
}
