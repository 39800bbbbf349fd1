// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime: fiber table, run queue, active backend, and the op
//! surface fiber bodies call into.
//!
//! [`Runtime`] is a cheap `Rc`-backed handle; cloning it shares the same
//! underlying scheduler state. It is deliberately `!Send`/`!Sync` (it
//! owns raw fds and an `io_uring`/`poll` set that must never be touched
//! concurrently), matching the single-threaded `CurrentThread` scheduler
//! shape this crate is modeled on.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, ChainOp};
use crate::config::{BackendKind, RuntimeConfig};
use crate::context::ContextId;
use crate::error::{Error, Result};
use crate::fiber::{Fiber, FiberId, ResumeValue, Suspend};
use crate::runqueue::RunQueue;
use crate::signal::SignalBackend;
use crate::watcher::Interest;

const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Point-in-time counters, returned by [`Runtime::stats`].
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub poll_count: u64,
    pub op_count: u64,
    pub switch_count: u64,
    pub runqueue_size: u64,
}

/// Events [`Runtime::trace_proc`] is invoked with, mirroring the
/// `{enter_poll, leave_poll, unblock, schedule, switch}` hook points.
#[derive(Debug, Clone, Copy)]
pub enum TraceEvent {
    EnterPoll,
    LeavePoll { completions: usize },
    Unblock(FiberId),
    Schedule(FiberId),
    Switch(FiberId),
}

struct FiberSlot {
    generation: u32,
    fiber: Option<Fiber>,
}

#[derive(Default)]
struct FiberTable {
    slots: Vec<FiberSlot>,
    free: Vec<usize>,
    alive: usize,
}

impl FiberTable {
    fn insert(&mut self, fiber: Fiber) -> FiberId {
        self.alive += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index];
            slot.fiber = Some(fiber);
            FiberId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len();
            self.slots.push(FiberSlot {
                generation: 0,
                fiber: Some(fiber),
            });
            FiberId {
                index,
                generation: 0,
            }
        }
    }

    fn take(&mut self, id: FiberId) -> Option<Fiber> {
        let slot = self.slots.get_mut(id.index)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.fiber.take()
    }

    fn put_back(&mut self, id: FiberId, fiber: Fiber) {
        if let Some(slot) = self.slots.get_mut(id.index) {
            slot.fiber = Some(fiber);
        }
    }

    fn remove(&mut self, id: FiberId) {
        if let Some(slot) = self.slots.get_mut(id.index) {
            slot.fiber = None;
            slot.generation = slot.generation.wrapping_add(1);
            self.free.push(id.index);
            self.alive = self.alive.saturating_sub(1);
        }
    }

    fn is_empty(&self) -> bool {
        self.alive == 0
    }
}

struct SchedState {
    run_queue: RunQueue,
    backend: Backend,
    signals: SignalBackend,
    current: Option<FiberId>,
    idle_gc_period: Duration,
    last_gc: Instant,
    on_idle: Option<Box<dyn FnMut()>>,
    trace_proc: Option<Box<dyn Fn(TraceEvent)>>,
    stats: Stats,
}

struct Inner {
    fibers: RefCell<FiberTable>,
    state: RefCell<SchedState>,
}

/// The fiber runtime. Cloning shares state; drop the last clone to tear
/// everything down (rings, signalfd, watchers) via [`Drop`].
#[derive(Clone)]
pub struct Runtime(Rc<Inner>);

impl Runtime {
    pub fn new() -> Result<Self> {
        Self::with_config(RuntimeConfig::new())
    }

    pub fn with_config(config: RuntimeConfig) -> Result<Self> {
        let kind = config.backend.unwrap_or_else(detect_backend);
        let backend = match kind {
            BackendKind::IoUring => {
                match crate::backend::UringBackend::with_entries(config.ring_entries) {
                    Ok(b) => Backend::Uring(b),
                    Err(e) => {
                        tracing::warn!(error = %e, "io_uring unavailable, falling back to readiness backend");
                        Backend::Readiness(crate::backend::ReadinessBackend::new()?)
                    }
                }
            }
            BackendKind::Readiness => Backend::Readiness(crate::backend::ReadinessBackend::new()?),
        };
        tracing::debug!(kind = ?backend.kind(), "runtime initialized");
        let state = SchedState {
            run_queue: RunQueue::with_capacity(config.runqueue_capacity),
            backend,
            signals: SignalBackend::new().map_err(Error::Sys)?,
            current: None,
            idle_gc_period: config.idle_gc_period,
            last_gc: Instant::now(),
            on_idle: config.on_idle,
            trace_proc: None,
            stats: Stats::default(),
        };
        Ok(Runtime(Rc::new(Inner {
            fibers: RefCell::new(FiberTable::default()),
            state: RefCell::new(state),
        })))
    }

    pub fn kind(&self) -> BackendKind {
        self.0.state.borrow().backend.kind()
    }

    pub fn stats(&self) -> Stats {
        let state = self.0.state.borrow();
        Stats {
            runqueue_size: state.run_queue.len() as u64,
            ..state.stats
        }
    }

    pub fn trace_proc(&self, f: impl Fn(TraceEvent) + 'static) {
        self.0.state.borrow_mut().trace_proc = Some(Box::new(f));
    }

    pub fn idle_gc_period(&self, period: Duration) {
        self.0.state.borrow_mut().idle_gc_period = period;
    }

    fn trace(&self, event: TraceEvent) {
        let state = self.0.state.borrow();
        if let Some(proc) = state.trace_proc.as_ref() {
            proc(event);
        }
    }

    /// Spawn a fiber running `body`, scheduling it to run on its first
    /// turn. `body` receives an [`Io`] handle it uses for every
    /// suspending call.
    pub fn spawn<F>(&self, body: F) -> FiberId
    where
        F: FnOnce(&Io) + 'static,
    {
        let rt = self.clone();
        let fiber = Fiber::spawn(DEFAULT_STACK_SIZE, move |suspend, _initial| {
            let io = Io { rt, suspend };
            body(&io);
        })
        .expect("failed to allocate fiber stack");
        let id = self.0.fibers.borrow_mut().insert(fiber);
        self.0
            .state
            .borrow_mut()
            .run_queue
            .schedule(id, ResumeValue::Value(0), false);
        self.trace(TraceEvent::Schedule(id));
        id
    }

    /// Resume `fiber` at its next turn with `value`, bypassing the run
    /// queue's FIFO order if `prioritize` is set (used by wakeup,
    /// signal delivery, and timeout firing).
    pub fn schedule(&self, fiber: FiberId, value: ResumeValue, prioritize: bool) {
        self.0
            .state
            .borrow_mut()
            .run_queue
            .schedule(fiber, value, prioritize);
        self.trace(TraceEvent::Schedule(fiber));
    }

    /// Drive the scheduler until every spawned fiber has finished.
    pub fn run(&self) -> Result<()> {
        loop {
            let next = self.0.state.borrow_mut().run_queue.pop();
            if let Some((id, value)) = next {
                self.resume_fiber(id, value);
                continue;
            }
            if self.0.fibers.borrow().is_empty() {
                return Ok(());
            }
            if self.0.state.borrow().backend.outstanding() == 0 {
                tracing::error!("deadlock: empty run queue, no outstanding operations");
                return Err(Error::Deadlock);
            }
            self.poll_once(true)?;
        }
    }

    fn resume_fiber(&self, id: FiberId, value: ResumeValue) {
        let Some(mut fiber) = self.0.fibers.borrow_mut().take(id) else {
            return;
        };
        self.0.state.borrow_mut().current = Some(id);
        self.0.state.borrow_mut().stats.switch_count += 1;
        self.trace(TraceEvent::Switch(id));
        fiber.resume(value);
        self.0.state.borrow_mut().current = None;
        if fiber.done() {
            self.0.fibers.borrow_mut().remove(id);
        } else {
            self.0.fibers.borrow_mut().put_back(id, fiber);
        }
    }

    /// Drain one pending `signalfd_siginfo` (non-blocking) and reschedule
    /// whoever was waiting on that signal number. Called both before and
    /// after the backend's blocking wait: a signal arriving while
    /// nothing else is outstanding is what actually wakes that wait (via
    /// the sentinel poll context `wait_signal` registers), so the fd
    /// needs checking again once it returns, not just up front.
    fn dispatch_signals(&self) -> Result<()> {
        let mut state = self.0.state.borrow_mut();
        if let Some((signo, fibers)) = state.signals.poll_one().map_err(Error::Sys)? {
            for f in fibers {
                state.run_queue.schedule(f, ResumeValue::Value(i64::from(signo)), true);
            }
        }
        Ok(())
    }

    fn poll_once(&self, blocking: bool) -> Result<()> {
        self.dispatch_signals()?;
        {
            let mut state = self.0.state.borrow_mut();
            if state.on_idle.is_some() && state.last_gc.elapsed() >= state.idle_gc_period {
                state.last_gc = Instant::now();
                if let Some(f) = state.on_idle.as_mut() {
                    f();
                }
            }
        }
        self.trace(TraceEvent::EnterPoll);
        tracing::trace!("enter_poll");
        let outcome = {
            let mut state = self.0.state.borrow_mut();
            let SchedState {
                backend, run_queue, ..
            } = &mut *state;
            backend.poll(run_queue, blocking)?
        };
        self.0.state.borrow_mut().stats.poll_count += 1;
        self.dispatch_signals()?;
        tracing::trace!(completions = outcome.completions, "leave_poll");
        self.trace(TraceEvent::LeavePoll {
            completions: outcome.completions,
        });
        Ok(())
    }

    /// Unblock a concurrently-blocking poll. No-op if nothing is
    /// currently blocked.
    pub fn wakeup(&self) -> Result<()> {
        self.0.state.borrow_mut().backend.wakeup()
    }

    /// Reinitialize after `fork()`. Must be called in the child before
    /// any op is issued.
    pub fn post_fork(&self) -> Result<()> {
        self.0.fibers.borrow_mut().free.clear();
        let mut state = self.0.state.borrow_mut();
        state.run_queue = RunQueue::new();
        state.backend.post_fork()?;
        state.signals.post_fork().map_err(Error::Sys)?;
        Ok(())
    }

    fn current_fiber(&self) -> FiberId {
        self.0
            .state
            .borrow()
            .current
            .expect("operation called outside a running fiber")
    }

    /// Explicit, idempotent teardown: cancel anything still outstanding,
    /// free the op-context store, and close the signalfd. Safe to call
    /// more than once. [`Drop`] calls this too, so a caller that never
    /// invokes it explicitly still gets the same cleanup once the last
    /// handle to this runtime goes away; calling it early is only useful
    /// when the caller wants deterministic teardown ahead of that point
    /// (e.g. before `fork`, or in a test that asserts fds are closed).
    pub fn finalize(&self) {
        let mut state = self.0.state.borrow_mut();
        state.backend.shutdown();
        state.signals.close();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if Rc::strong_count(&self.0) == 1 {
            self.finalize();
        }
    }
}

fn detect_backend() -> BackendKind {
    if cfg!(target_os = "linux") {
        BackendKind::IoUring
    } else {
        BackendKind::Readiness
    }
}

/// The op surface a fiber body sees. One per fiber, created at spawn
/// time and passed by reference to every call the fiber body makes.
pub struct Io {
    rt: Runtime,
    suspend: Suspend,
}

impl Io {
    pub fn runtime(&self) -> &Runtime {
        &self.rt
    }

    /// Suspend until `ctx` completes, releasing the fiber's ownership
    /// of the context either way. On cancellation (the fiber was
    /// resumed with an error), the op is cancelled in the backend
    /// before the error propagates.
    fn await_ctx(&self, ctx: ContextId) -> Result<i32> {
        self.rt.0.state.borrow_mut().stats.op_count += 1;
        let resume = self.suspend.suspend();
        let mut state = self.rt.0.state.borrow_mut();
        match resume {
            ResumeValue::Value(v) => {
                state.backend.release(ctx);
                Ok(v as i32)
            }
            ResumeValue::Error(e) => {
                let _ = state.backend.cancel(ctx);
                state.backend.release(ctx);
                Err(e)
            }
        }
    }

    fn is_uring(&self) -> bool {
        self.rt.0.state.borrow().backend.is_uring()
    }

    // -- scheduling primitives --

    /// Reschedule self at the tail of the run queue and yield; every
    /// currently-runnable fiber runs before this one resumes.
    pub fn snooze(&self) {
        let fiber = self.rt.current_fiber();
        self.rt.schedule(fiber, ResumeValue::Value(0), false);
        let _ = self.suspend.suspend();
    }

    /// Yield without self-scheduling. Only another fiber calling
    /// [`Runtime::schedule`] on this fiber's id resumes it.
    pub fn suspend(&self) -> ResumeValue {
        self.suspend.suspend()
    }

    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let fiber = self.rt.current_fiber();
        let ctx = self
            .rt
            .0
            .state
            .borrow_mut()
            .backend
            .start_timeout(duration, fiber)?;
        self.await_ctx(ctx)?;
        Ok(())
    }

    /// Yield points spaced by `interval`, advancing by whole multiples
    /// of it even if a tick runs long (catch-up semantics) rather than
    /// firing a burst of missed ticks back to back.
    pub fn timer_loop(&self, interval: Duration, mut tick: impl FnMut(&Io) -> bool) -> Result<()> {
        let mut next = Instant::now() + interval;
        loop {
            self.sleep(next.saturating_duration_since(Instant::now()))?;
            if !tick(self) {
                return Ok(());
            }
            next = crate::time::advance_catch_up(next, interval, Instant::now());
        }
    }

    /// Run `body` in its own fiber, racing it against `duration`. If the
    /// timer wins, the body's fiber is left to finish on its own time
    /// (its result is simply discarded) and `on_timeout()` is returned
    /// instead; a single suspend point can only ever carry one pending
    /// resume, so the race has to happen between two separate fibers
    /// rather than by injecting a second wakeup into `body`'s own
    /// suspension.
    pub fn timeout<T: 'static>(
        &self,
        duration: Duration,
        body: impl FnOnce(&Io) -> Result<T> + 'static,
        on_timeout: impl FnOnce() -> T,
    ) -> Result<T> {
        let outcome: Rc<RefCell<Option<Result<T>>>> = Rc::new(RefCell::new(None));
        let settled = Rc::new(std::cell::Cell::new(false));
        let waiter = self.rt.current_fiber();

        let outcome_w = outcome.clone();
        let settled_w = settled.clone();
        let rt_w = self.rt.clone();
        self.rt.spawn(move |io| {
            let result = body(io);
            if !settled_w.replace(true) {
                *outcome_w.borrow_mut() = Some(result);
                rt_w.schedule(waiter, ResumeValue::Value(0), true);
            }
        });

        let timeout_ctx = self
            .rt
            .0
            .state
            .borrow_mut()
            .backend
            .start_timeout(duration, waiter)?;
        let _ = self.suspend.suspend();
        let mut state = self.rt.0.state.borrow_mut();
        // Whichever side lost the race may already have queued a
        // second resume for this fiber before it knew it had lost;
        // drop it so a stale wakeup never reaches an unrelated future
        // suspension point.
        state.run_queue.delete(waiter);
        if settled.replace(true) {
            // The body fiber beat the timer; cancel the now-useless
            // timeout op and report the body's result.
            let _ = state.backend.cancel(timeout_ctx);
            state.backend.release(timeout_ctx);
            drop(state);
            outcome
                .borrow_mut()
                .take()
                .unwrap_or(Err(Error::Cancelled))
        } else {
            // The timer fired first; the backend already released its
            // side of the context in the completion path.
            state.backend.release(timeout_ctx);
            drop(state);
            Ok(on_timeout())
        }
    }

    // -- plain read/write --

    pub fn read(&self, fd: RawFd, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Err(Error::argument("read length must be positive"));
        }
        if self.is_uring() {
            self.uring_read(fd, len)
        } else {
            self.readiness_read(fd, len)
        }
    }

    /// Read repeatedly until EOF or the buffer is exhausted, matching
    /// `read_loop`'s chunked-delivery contract (each chunk handed to
    /// `on_chunk` as soon as it arrives).
    pub fn read_loop(&self, fd: RawFd, chunk_len: usize, mut on_chunk: impl FnMut(&[u8])) -> Result<()> {
        loop {
            let chunk = self.read(fd, chunk_len)?;
            if chunk.is_empty() {
                return Ok(());
            }
            on_chunk(&chunk);
        }
    }

    fn uring_read(&self, fd: RawFd, len: usize) -> Result<Vec<u8>> {
        let fiber = self.rt.current_fiber();
        let ctx = {
            let mut state = self.rt.0.state.borrow_mut();
            state.backend.as_uring_mut()?.start_read(fd, len, fiber)?
        };
        let n = self.await_ctx(ctx)?;
        let buf = {
            let mut state = self.rt.0.state.borrow_mut();
            state.backend.as_uring_mut()?.take_read_buffer(ctx)
        };
        if n < 0 {
            return Err(Error::from_errno(-n));
        }
        let mut v = buf.map(Vec::from).unwrap_or_default();
        v.truncate(n as usize);
        Ok(v)
    }

    fn readiness_read(&self, fd: RawFd, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), len) };
            if n >= 0 {
                buf.truncate(n as usize);
                return Ok(buf);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(Error::Sys(err));
            }
            self.await_readiness(fd, Interest::READ)?;
        }
    }

    pub fn write(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        self.writev(fd, &[buf])
    }

    /// Write one or more buffers; submits a single `writev`-equivalent
    /// op per backend rather than one syscall per buffer.
    pub fn writev(&self, fd: RawFd, bufs: &[&[u8]]) -> Result<usize> {
        let mut total = 0;
        for buf in bufs {
            let mut offset = 0;
            while offset < buf.len() {
                let n = self.write_once(fd, &buf[offset..])?;
                if n == 0 {
                    return Ok(total + offset);
                }
                offset += n;
            }
            total += buf.len();
        }
        Ok(total)
    }

    fn write_once(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        if self.is_uring() {
            let owned: Arc<[u8]> = Arc::from(buf);
            let fiber = self.rt.current_fiber();
            let ctx = {
                let mut state = self.rt.0.state.borrow_mut();
                state.backend.as_uring_mut()?.start_write(fd, owned, fiber)?
            };
            let n = self.await_ctx(ctx)?;
            if n < 0 {
                return Err(Error::from_errno(-n));
            }
            Ok(n as usize)
        } else {
            loop {
                let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
                if n >= 0 {
                    return Ok(n as usize);
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(Error::Sys(err));
                }
                self.await_readiness(fd, Interest::WRITE)?;
            }
        }
    }

    /// `send`/`sendv`: identical to `write`/`writev` for this crate's
    /// purposes (both backends submit through the same fd-oriented
    /// path); kept as a distinct name because callers reason about
    /// sockets separately from files.
    pub fn send(&self, fd: RawFd, buf: &[u8]) -> Result<usize> {
        self.write(fd, buf)
    }

    pub fn sendv(&self, fd: RawFd, bufs: &[&[u8]]) -> Result<usize> {
        self.writev(fd, bufs)
    }

    pub fn recv(&self, fd: RawFd, len: usize) -> Result<Vec<u8>> {
        self.read(fd, len)
    }

    /// `recv_loop`/`feed_loop`: identical chunked-delivery contract to
    /// `read_loop`, kept as distinct names for the same reason `recv` is
    /// kept distinct from `read`.
    pub fn recv_loop(&self, fd: RawFd, chunk_len: usize, on_chunk: impl FnMut(&[u8])) -> Result<()> {
        self.read_loop(fd, chunk_len, on_chunk)
    }

    pub fn feed_loop(&self, fd: RawFd, chunk_len: usize, on_chunk: impl FnMut(&[u8])) -> Result<()> {
        self.read_loop(fd, chunk_len, on_chunk)
    }

    pub fn recv_feed_loop(&self, fd: RawFd, chunk_len: usize, on_chunk: impl FnMut(&[u8])) -> Result<()> {
        self.read_loop(fd, chunk_len, on_chunk)
    }

    /// `recvmsg`: like `recv`, but preserves the peer address a
    /// datagram arrived from (requires an unconnected socket).
    pub fn recvmsg(&self, fd: RawFd, len: usize) -> Result<(Vec<u8>, Option<SocketAddr>)> {
        if self.is_uring() {
            let fiber = self.rt.current_fiber();
            let ctx = {
                let mut state = self.rt.0.state.borrow_mut();
                state.backend.as_uring_mut()?.start_recvmsg(fd, len, fiber)?
            };
            let n = self.await_ctx(ctx)?;
            let taken = {
                let mut state = self.rt.0.state.borrow_mut();
                state.backend.as_uring_mut()?.take_recvmsg(ctx, n.max(0) as usize)
            };
            if n < 0 {
                return Err(Error::from_errno(-n));
            }
            Ok(taken.unwrap_or_default())
        } else {
            let mut buf = vec![0u8; len];
            loop {
                let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
                let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
                let n = unsafe {
                    libc::recvfrom(
                        fd,
                        buf.as_mut_ptr().cast(),
                        len,
                        0,
                        std::ptr::from_mut(&mut storage).cast(),
                        &mut addrlen,
                    )
                };
                if n >= 0 {
                    buf.truncate(n as usize);
                    let addr = crate::backend::uring::sockaddr_to_socket_addr(&storage, addrlen);
                    return Ok((buf, addr));
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(Error::Sys(err));
                }
                self.await_readiness(fd, Interest::READ)?;
            }
        }
    }

    /// `sendmsg`: like `send`, but targets `addr` explicitly rather than
    /// requiring a connected socket.
    pub fn sendmsg(&self, fd: RawFd, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        if self.is_uring() {
            let fiber = self.rt.current_fiber();
            let ctx = {
                let mut state = self.rt.0.state.borrow_mut();
                state.backend.as_uring_mut()?.start_sendmsg(fd, buf, addr, fiber)?
            };
            let n = self.await_ctx(ctx)?;
            {
                let mut state = self.rt.0.state.borrow_mut();
                state.backend.as_uring_mut()?.take_sendmsg(ctx);
            }
            if n < 0 {
                return Err(Error::from_errno(-n));
            }
            Ok(n as usize)
        } else {
            let (storage, len) = crate::backend::uring::sockaddr_for_connect(addr);
            loop {
                let n = unsafe {
                    libc::sendto(
                        fd,
                        buf.as_ptr().cast(),
                        buf.len(),
                        0,
                        std::ptr::from_ref(&storage).cast(),
                        len,
                    )
                };
                if n >= 0 {
                    return Ok(n as usize);
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(Error::Sys(err));
                }
                self.await_readiness(fd, Interest::WRITE)?;
            }
        }
    }

    fn await_readiness(&self, fd: RawFd, interest: Interest) -> Result<()> {
        let fiber = self.rt.current_fiber();
        let ctx = self
            .rt
            .0
            .state
            .borrow_mut()
            .backend
            .start_poll(fd, interest, Some(fiber))?;
        self.await_ctx(ctx)?;
        Ok(())
    }

    /// Wait for `fd` to become ready for `interest` without performing
    /// any I/O. `interest` accepts the `"r"`/`"w"`/`"rw"` tags.
    pub fn wait_io(&self, fd: RawFd, interest: &str) -> Result<()> {
        self.await_readiness(fd, Interest::from_tag(interest)?)
    }

    // -- accept / connect --

    pub fn accept(&self, listener: RawFd) -> Result<RawFd> {
        if self.is_uring() {
            let fiber = self.rt.current_fiber();
            // A `multishot_accept` loop may already be draining this
            // listener; ride its queue instead of racing a second,
            // independent accept submission against the same fd.
            let running = {
                let mut state = self.rt.0.state.borrow_mut();
                state.backend.as_uring_mut()?.multishot_accept_for(listener)
            };
            if let Some(ctx) = running {
                loop {
                    let item = {
                        let mut state = self.rt.0.state.borrow_mut();
                        let uring = state.backend.as_uring_mut()?;
                        match uring.poll_multishot_accept(ctx) {
                            Some(item) => Some(item),
                            None if uring.multishot_accept_done(ctx) => None,
                            None => {
                                if let Some(c) = uring.base.contexts.get_mut(ctx) {
                                    c.fiber = Some(fiber);
                                }
                                self.await_ctx(ctx)?;
                                continue;
                            }
                        }
                    };
                    return match item {
                        Some(Ok(fd)) => Ok(fd),
                        Some(Err(e)) => Err(Error::Sys(e)),
                        None => Err(Error::Cancelled),
                    };
                }
            }
            let ctx = {
                let mut state = self.rt.0.state.borrow_mut();
                state.backend.as_uring_mut()?.start_accept(listener, fiber)?
            };
            let n = self.await_ctx(ctx)?;
            if n < 0 {
                return Err(Error::from_errno(-n));
            }
            Ok(n)
        } else {
            loop {
                let fd = unsafe { libc::accept(listener, std::ptr::null_mut(), std::ptr::null_mut()) };
                if fd >= 0 {
                    return Ok(fd);
                }
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(Error::Sys(err));
                }
                self.await_readiness(listener, Interest::READ)?;
            }
        }
    }

    /// Accept connections until cancelled, handing each one to
    /// `on_accept`.
    pub fn accept_loop(&self, listener: RawFd, mut on_accept: impl FnMut(&Io, RawFd)) -> Result<()> {
        loop {
            let fd = self.accept(listener)?;
            on_accept(self, fd);
        }
    }

    /// Arm a single multishot-accept submission and hand every accepted
    /// connection to `on_accept` as it arrives, until it returns `false`
    /// or the submission itself ends. Requires the completion backend;
    /// cleans up (cancels the still-live submission) on exit whether
    /// `on_accept` stopped the loop or the call is cancelled.
    pub fn multishot_accept(
        &self,
        listener: RawFd,
        mut on_accept: impl FnMut(&Io, RawFd) -> bool,
    ) -> Result<()> {
        let fiber = self.rt.current_fiber();
        let ctx = {
            let mut state = self.rt.0.state.borrow_mut();
            state
                .backend
                .as_uring_mut()?
                .start_multishot_accept(listener, fiber)?
        };
        let result = (|| -> Result<()> {
            loop {
                let item = {
                    let mut state = self.rt.0.state.borrow_mut();
                    let uring = state.backend.as_uring_mut()?;
                    match uring.poll_multishot_accept(ctx) {
                        Some(item) => Some(item),
                        None if uring.multishot_accept_done(ctx) => return Ok(()),
                        None => None,
                    }
                };
                match item {
                    Some(Ok(fd)) => {
                        if !on_accept(self, fd) {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(Error::Sys(e)),
                    None => {
                        // Nothing queued yet; park until the next
                        // completion by waiting on the same context.
                        self.await_ctx(ctx)?;
                    }
                }
            }
        })();
        let mut state = self.rt.0.state.borrow_mut();
        if let Ok(u) = state.backend.as_uring_mut() {
            let _ = u.cleanup_multishot_accept(ctx);
        }
        drop(state);
        result
    }

    pub fn connect(&self, fd: RawFd, addr: SocketAddr) -> Result<()> {
        if self.is_uring() {
            let fiber = self.rt.current_fiber();
            let ctx = {
                let mut state = self.rt.0.state.borrow_mut();
                state.backend.as_uring_mut()?.start_connect(fd, addr, fiber)?
            };
            let n = self.await_ctx(ctx)?;
            if n < 0 {
                return Err(Error::from_errno(-n));
            }
            Ok(())
        } else {
            let (sockaddr, len) = crate::backend::uring::sockaddr_for_connect(addr);
            let rc = unsafe {
                libc::connect(
                    fd,
                    std::ptr::from_ref(&sockaddr).cast(),
                    len,
                )
            };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(Error::Sys(err));
            }
            self.await_readiness(fd, Interest::WRITE)?;
            let mut sockerr: libc::c_int = 0;
            let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
            unsafe {
                libc::getsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    std::ptr::from_mut(&mut sockerr).cast(),
                    &mut len,
                );
            }
            if sockerr != 0 {
                return Err(Error::from_errno(sockerr));
            }
            Ok(())
        }
    }

    // -- completion-ring-only zero-copy ops --

    pub fn splice(&self, src: RawFd, dst: RawFd, len: u32) -> Result<usize> {
        let fiber = self.rt.current_fiber();
        let ctx = {
            let mut state = self.rt.0.state.borrow_mut();
            state.backend.as_uring_mut()?.start_splice(src, dst, len, fiber)?
        };
        let n = self.await_ctx(ctx)?;
        if n < 0 {
            return Err(Error::from_errno(-n));
        }
        Ok(n as usize)
    }

    /// Splice until EOF, returning the total number of bytes moved.
    pub fn splice_to_eof(&self, src: RawFd, dst: RawFd, chunk: u32) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.splice(src, dst, chunk)?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    pub fn tee(&self, src: RawFd, dst: RawFd, len: u32) -> Result<usize> {
        let fiber = self.rt.current_fiber();
        let ctx = {
            let mut state = self.rt.0.state.borrow_mut();
            state.backend.as_uring_mut()?.start_tee(src, dst, len, fiber)?
        };
        let n = self.await_ctx(ctx)?;
        if n < 0 {
            return Err(Error::from_errno(-n));
        }
        Ok(n as usize)
    }

    /// Move data from `src` to `dst` through an intermediate pipe,
    /// chunk by chunk, until `src` reaches EOF. The two splice legs of
    /// each round are submitted as one `IOSQE_IO_LINK` chain rather than
    /// awaited one at a time: the second leg's `chunk` request is capped
    /// by however much the first leg actually put in the pipe, so
    /// linking them needs no result threaded between the two.
    pub fn double_splice(&self, src: RawFd, dst: RawFd, chunk: u32) -> Result<usize> {
        let mut pipe = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(Error::Sys(io::Error::last_os_error()));
        }
        let [read_end, write_end] = pipe;
        let result = (|| -> Result<usize> {
            let mut total = 0;
            loop {
                let n = self.spliced_chain(src, write_end, read_end, dst, chunk)?;
                if n == 0 {
                    break;
                }
                total += n as usize;
            }
            Ok(total)
        })();
        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
        result
    }

    /// One `splice(src, pipe) -> splice(pipe, dst)` round as a linked
    /// chain. Returns the number of bytes moved, or `0` at `src`'s EOF.
    /// `-EAGAIN` on the pipe leg means the first leg found `src` already
    /// at EOF and put nothing in the pipe for the second leg to drain,
    /// which is EOF too rather than a real error.
    fn spliced_chain(
        &self,
        src: RawFd,
        pipe_w: RawFd,
        pipe_r: RawFd,
        dst: RawFd,
        chunk: u32,
    ) -> Result<usize> {
        let n = self.chain(vec![
            ChainOp::Splice { src, dst: pipe_w, len: chunk },
            ChainOp::Splice { src: pipe_r, dst, len: chunk },
        ])?;
        if n == -libc::EAGAIN {
            return Ok(0);
        }
        if n < 0 {
            return Err(Error::from_errno(-n));
        }
        Ok(n as usize)
    }

    /// Copy `src` to `dst` in chunks, optionally writing a literal
    /// prefix/postfix once and a per-chunk prefix/postfix around every
    /// chunk, interleaved with the splice so ordering onto `dst` is
    /// preserved.
    #[allow(clippy::too_many_arguments)]
    pub fn splice_chunks(
        &self,
        src: RawFd,
        dst: RawFd,
        chunk: u32,
        prefix: Option<&[u8]>,
        postfix: Option<&[u8]>,
        mut chunk_prefix: impl FnMut() -> Option<Vec<u8>>,
        mut chunk_postfix: impl FnMut() -> Option<Vec<u8>>,
    ) -> Result<usize> {
        if let Some(p) = prefix {
            self.write(dst, p)?;
        }
        let mut pipe = [0 as RawFd; 2];
        if unsafe { libc::pipe2(pipe.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } != 0 {
            return Err(Error::Sys(io::Error::last_os_error()));
        }
        let [read_end, write_end] = pipe;
        let result = (|| -> Result<usize> {
            let mut total = 0;
            loop {
                // Unlike `double_splice`, the two legs here can't be
                // linked: `chunk_prefix`/`chunk_postfix` must land on
                // `dst` strictly before/after this round's data, which
                // means the first leg's actual byte count has to be
                // known before the second leg (and the postfix) submit.
                let n = self.splice(src, write_end, chunk)?;
                if n == 0 {
                    break;
                }
                if let Some(p) = chunk_prefix() {
                    self.write(dst, &p)?;
                }
                let mut moved = 0;
                while moved < n {
                    moved += self.splice(read_end, dst, (n - moved) as u32)?;
                }
                if let Some(p) = chunk_postfix() {
                    self.write(dst, &p)?;
                }
                total += n;
            }
            Ok(total)
        })();
        unsafe {
            libc::close(read_end);
            libc::close(write_end);
        }
        let total = result?;
        if let Some(p) = postfix {
            self.write(dst, p)?;
        }
        Ok(total)
    }

    /// Submit `ops` as one linked chain sharing a single op-context. The
    /// kernel cancels the remainder of the chain the instant one leg
    /// fails; the result reported back is the last leg's.
    pub fn chain(&self, ops: Vec<ChainOp>) -> Result<i32> {
        let fiber = self.rt.current_fiber();
        let ctx = {
            let mut state = self.rt.0.state.borrow_mut();
            state.backend.as_uring_mut()?.start_chain(ops, fiber)?
        };
        self.await_ctx(ctx)
    }

    // -- process / event primitives --

    pub fn waitpid(&self, pid: libc::pid_t) -> Result<(libc::pid_t, i32)> {
        let pidfd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) };
        if pidfd >= 0 {
            let pidfd = pidfd as RawFd;
            let result = (|| -> Result<(libc::pid_t, i32)> {
                self.await_readiness(pidfd, Interest::READ)?;
                let mut status = 0;
                let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                if rc < 0 {
                    return Err(Error::Sys(io::Error::last_os_error()));
                }
                Ok((pid, status))
            })();
            unsafe {
                libc::close(pidfd);
            }
            return result;
        }
        // No pidfd support: fall back to a polling loop.
        loop {
            let mut status = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rc == pid {
                return Ok((pid, status));
            }
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::ECHILD) {
                    return Ok((pid, 0));
                }
                return Err(Error::Sys(err));
            }
            self.sleep(Duration::from_millis(10))?;
        }
    }

    /// Block until `eventfd` (caller-owned) is bumped. Each call polls
    /// the fd independently and drains whatever count is posted; unlike
    /// `wait_signal` there is no shared registration to fan one wakeup
    /// out to several waiters, so two fibers calling this on the same
    /// fd race for whichever read wins.
    pub fn wait_event(&self, eventfd: RawFd) -> Result<()> {
        self.await_readiness(eventfd, Interest::READ)?;
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(eventfd, buf.as_mut_ptr().cast(), 8);
        }
        Ok(())
    }

    /// Block until `signal` is delivered. Registers with the shared
    /// signalfd (`signals.watch`) so `poll_once`'s non-blocking drain
    /// decodes and dispatches the real signal number, and separately
    /// arms a fiber-less poll on the same fd so the backend's blocking
    /// wait actually includes it instead of sleeping through a signal
    /// that arrives while nothing else is outstanding.
    pub fn wait_signal(&self, signal: i32) -> Result<i32> {
        let fiber = self.rt.current_fiber();
        let ctx = {
            let mut state = self.rt.0.state.borrow_mut();
            state.signals.watch(signal, fiber).map_err(Error::Sys)?;
            let fd = state.signals.fd();
            state.backend.start_poll(fd, Interest::READ, None)?
        };
        let resume = self.suspend.suspend();
        let mut state = self.rt.0.state.borrow_mut();
        match resume {
            ResumeValue::Value(v) => Ok(v as i32),
            ResumeValue::Error(e) => {
                let _ = state.backend.cancel(ctx);
                state.backend.release(ctx);
                Err(e)
            }
        }
    }

}
