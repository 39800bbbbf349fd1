// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The readiness-based (`poll(2)`) backend.
//!
//! Grounded on `ext/gyro/io.c`: a level-triggered reactor where each
//! watcher is one-shot (stopped the moment it fires) and the actual I/O
//! syscall is always performed by the op surface, not the backend —
//! this backend only ever answers "wake me up when fd is ready for
//! this interest".

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::backend::{BackendBase, PollOutcome};
use crate::context::{ContextId, ContextStore, OpKind};
use crate::error::{Error, Result};
use crate::fiber::{FiberId, ResumeValue};
use crate::runqueue::RunQueue;
use crate::time::TimerWheel;
use crate::watcher::{Interest, Watcher};

pub struct ReadinessBackend {
    pub base: BackendBase,
    watchers: HashMap<(RawFd, Interest), Watcher>,
    ctx_to_key: HashMap<ContextId, (RawFd, Interest)>,
    timers: TimerWheel,
    wake_fd: RawFd,
}

impl ReadinessBackend {
    pub fn new() -> Result<Self> {
        let wake_fd = create_eventfd()?;
        Ok(ReadinessBackend {
            base: BackendBase::new(),
            watchers: HashMap::new(),
            ctx_to_key: HashMap::new(),
            timers: TimerWheel::new(),
            wake_fd,
        })
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_timeout(Instant::now())
    }

    /// Per-(fd, interest) watchers are cached rather than allocated
    /// fresh every call: a watcher that is still active when a second
    /// caller arrives is a program error (see `Watcher::arm`), and
    /// reusing the slot is what makes that `debug_assert!` reachable.
    pub fn start_poll(&mut self, fd: RawFd, interest: Interest, fiber: Option<FiberId>) -> Result<ContextId> {
        let ctx = self.base.contexts.acquire(OpKind::Poll, fiber);
        let key = (fd, interest);
        self.watchers
            .entry(key)
            .or_insert_with(|| Watcher::new(fd, interest))
            .arm(fiber, ctx);
        self.ctx_to_key.insert(ctx, key);
        self.base.outstanding += 1;
        Ok(ctx)
    }

    pub fn start_timeout(&mut self, dur: Duration, fiber: FiberId) -> Result<ContextId> {
        let ctx = self.base.contexts.acquire(OpKind::Timeout, Some(fiber));
        self.timers.insert(Instant::now() + dur, fiber, ctx);
        self.base.outstanding += 1;
        Ok(ctx)
    }

    pub fn cancel(&mut self, ctx: ContextId) -> Result<()> {
        if let Some(key) = self.ctx_to_key.remove(&ctx) {
            let stale = self.watchers.get(&key).is_some_and(|w| w.context != Some(ctx));
            if !stale {
                self.watchers.remove(&key);
            }
            self.base.outstanding = self.base.outstanding.saturating_sub(1);
        }
        if let Some(c) = self.base.contexts.get_mut(ctx) {
            c.cancelling = true;
            c.result = -libc::ECANCELED;
        }
        // Timers are lazily dropped: `poll` checks the context is still
        // present before delivering a fired deadline, so a cancelled
        // timeout simply never resolves to anything once its heap entry
        // is eventually popped.
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.base.outstanding
    }

    pub fn wakeup(&mut self) -> Result<()> {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wake_fd,
                (&one as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(Error::Sys(err));
            }
        }
        Ok(())
    }

    pub fn post_fork(&mut self) -> Result<()> {
        self.watchers.clear();
        self.ctx_to_key.clear();
        self.timers = TimerWheel::new();
        self.base.outstanding = 0;
        unsafe {
            libc::close(self.wake_fd);
        }
        self.wake_fd = create_eventfd()?;
        Ok(())
    }

    pub fn poll(&mut self, run_queue: &mut RunQueue, blocking: bool) -> Result<PollOutcome> {
        let now = Instant::now();
        let timeout_ms = if !blocking {
            0
        } else {
            match self.timers.next_timeout(now) {
                Some(d) => i32::try_from(d.as_millis().min(i64::MAX as u128)).unwrap_or(i32::MAX),
                None => -1,
            }
        };

        let mut pollfds = Vec::with_capacity(self.watchers.len() + 1);
        let mut keys: Vec<(RawFd, Interest)> = Vec::with_capacity(self.watchers.len());
        pollfds.push(libc::pollfd {
            fd: self.wake_fd,
            events: libc::POLLIN,
            revents: 0,
        });
        for (key, w) in &self.watchers {
            keys.push(*key);
            pollfds.push(libc::pollfd {
                fd: w.fd,
                events: w.interest.to_poll_events(),
                revents: 0,
            });
        }

        let rc = loop {
            let rc = unsafe {
                libc::poll(
                    pollfds.as_mut_ptr(),
                    pollfds.len() as libc::nfds_t,
                    timeout_ms,
                )
            };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted && run_queue.is_empty() {
                    continue;
                }
                if err.kind() == io::ErrorKind::Interrupted {
                    break 0;
                }
                return Err(Error::Sys(err));
            }
            break rc;
        };

        let mut completions = 0;
        if rc > 0 {
            if pollfds[0].revents != 0 {
                drain_eventfd(self.wake_fd);
            }
            for (i, key) in keys.iter().enumerate() {
                let revents = pollfds[i + 1].revents;
                if revents == 0 {
                    continue;
                }
                if let Some(watcher) = self.watchers.remove(key) {
                    let Some(id) = watcher.context else { continue };
                    self.ctx_to_key.remove(&id);
                    self.base.outstanding = self.base.outstanding.saturating_sub(1);
                    if let Some(c) = self.base.contexts.get_mut(id) {
                        c.result = i32::from(revents);
                    }
                    self.base.contexts.release(id);
                    if let Some(fiber) = watcher.fiber {
                        run_queue.schedule(fiber, ResumeValue::Value(i64::from(revents)), false);
                        completions += 1;
                    }
                }
            }
        }

        for (fiber, ctx) in self.timers.drain_expired(Instant::now()) {
            let Some(c) = self.base.contexts.get_mut(ctx) else {
                continue;
            };
            if c.cancelling {
                self.base.contexts.release(ctx);
                continue;
            }
            self.base.outstanding = self.base.outstanding.saturating_sub(1);
            c.result = 1;
            self.base.contexts.release(ctx);
            run_queue.schedule(fiber, ResumeValue::Value(1), true);
            completions += 1;
        }

        Ok(PollOutcome { completions })
    }

    /// Drop every armed watcher and free the op-context store. `wake_fd`
    /// closes via this backend's own `Drop`.
    pub fn shutdown(&mut self) {
        self.watchers.clear();
        self.ctx_to_key.clear();
        self.base.contexts = ContextStore::new();
    }
}

fn create_eventfd() -> Result<RawFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(Error::Sys(io::Error::last_os_error()));
    }
    Ok(fd)
}

fn drain_eventfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    unsafe {
        libc::read(fd, buf.as_mut_ptr().cast(), 8);
    }
}

impl Drop for ReadinessBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}
