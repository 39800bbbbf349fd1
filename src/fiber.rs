// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful cooperative execution contexts.
//!
//! Each [`Fiber`] runs its body on its own OS-level stack, courtesy of
//! [`corosensei`]. Suspending a fiber mid-call (for I/O, a timeout, a
//! sleep) is a plain stack switch, not a generated state machine, so the
//! op surface in [`crate::runtime`] can write ordinary blocking-looking
//! Rust and still cooperate with everything else sharing the thread.

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::fmt;

use crate::context::ContextId;

/// The value a fiber is resumed with: either ordinary data, or an
/// exception unwinding the fiber from whatever it was awaiting.
pub enum ResumeValue {
    Value(i64),
    Error(crate::error::Error),
}

impl fmt::Debug for ResumeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeValue::Value(v) => write!(f, "Value({v})"),
            ResumeValue::Error(e) => write!(f, "Error({e})"),
        }
    }
}

/// Generational slot index identifying a fiber. Never reused while a
/// fiber with the same index is alive; the generation guards against a
/// stale handle addressing a fiber that has since died and been
/// replaced in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiberId {
    pub(crate) index: usize,
    pub(crate) generation: u32,
}

/// Observable lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Running,
    Runnable,
    Waiting,
    Dead,
}

/// A single fiber's bookkeeping: its coroutine handle, current state,
/// and (if suspended on an op) the context it is waiting on.
pub struct Fiber {
    coroutine: Option<Coroutine<ResumeValue, (), (), DefaultStack>>,
    state: FiberState,
    awaiting: Option<ContextId>,
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("state", &self.state)
            .field("awaiting", &self.awaiting)
            .finish_non_exhaustive()
    }
}

impl Fiber {
    /// Spawn a fiber running `body` on a freshly allocated stack. `body`
    /// receives a [`Suspend`] handle it uses to yield control back to the
    /// scheduler at every suspension point.
    pub fn spawn<F>(stack_size: usize, body: F) -> std::io::Result<Self>
    where
        F: FnOnce(Suspend, ResumeValue) + 'static,
    {
        let stack = DefaultStack::new(stack_size)?;
        let coroutine = Coroutine::with_stack(stack, move |yielder, input| {
            body(Suspend { yielder: yielder as *const Yielder<ResumeValue, ()> }, input);
        });
        Ok(Fiber {
            coroutine: Some(coroutine),
            state: FiberState::Runnable,
            awaiting: None,
        })
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    pub fn awaiting(&self) -> Option<ContextId> {
        self.awaiting
    }

    pub fn set_awaiting(&mut self, ctx: Option<ContextId>) {
        self.awaiting = ctx;
    }

    pub fn done(&self) -> bool {
        self.coroutine.as_ref().map(Coroutine::done).unwrap_or(true)
    }

    /// Transfer control to this fiber, passing `value` as its resume
    /// value. Returns once the fiber suspends again or completes.
    pub fn resume(&mut self, value: ResumeValue) {
        let Some(co) = self.coroutine.as_mut() else {
            self.state = FiberState::Dead;
            return;
        };
        self.state = FiberState::Running;
        match co.resume(value) {
            CoroutineResult::Yield(()) => {
                self.state = FiberState::Waiting;
            }
            CoroutineResult::Return(()) => {
                self.state = FiberState::Dead;
                self.coroutine = None;
            }
        }
    }
}

/// Handle a running fiber body uses to suspend itself back to the
/// scheduler. Mirrors the `Suspend<Input, Yield>` wrapper the fiber
/// primitive this runtime is built on exposes, narrowed to this crate's
/// single resume/yield value types.
pub struct Suspend {
    yielder: *const Yielder<ResumeValue, ()>,
}

impl Suspend {
    /// Yield control back to whichever fiber resumed us (normally the
    /// scheduler's switch loop). Returns the value the scheduler resumes
    /// us with.
    pub fn suspend(&self) -> ResumeValue {
        // SAFETY: `yielder` points at the `Yielder` corosensei passes to
        // the coroutine's entry closure, which stays valid for as long as
        // the coroutine (and therefore this `Suspend`) is alive.
        unsafe { (*self.yielder).suspend(()) }
    }
}
