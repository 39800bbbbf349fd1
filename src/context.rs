// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The operation-context store.
//!
//! Every in-flight submission (completion backend) or armed watcher
//! (readiness backend) gets one [`OpContext`], pooled in a [`ContextStore`].
//! The backend and the awaiting fiber both hold a logical reference to it;
//! it is only returned to the pool once both release it, except in
//! multishot mode where it is never auto-freed on completion.

use slab::Slab;
use std::sync::Arc;

use crate::fiber::FiberId;

/// Slab index identifying a live [`OpContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub(crate) usize);

/// Reference count discipline for a context. `Shared(n)` counts down to
/// zero (single-shot: backend + fiber, or `n+1` owners for a chain of
/// `n` linked SQEs). `Multishot` contexts are never freed by the normal
/// decrement path; the owning op releases them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefCount {
    Shared(u32),
    Multishot,
}

/// What kind of operation a context belongs to. Used only for logging
/// and for dispatch inside the multishot completion handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Poll,
    Read,
    Write,
    Recvmsg,
    Sendmsg,
    Accept,
    MultishotAccept,
    Connect,
    Splice,
    Timeout,
    Chain,
    WaitEvent,
    Signal,
    Other,
}

/// Live operation state shared between a backend and the fiber awaiting
/// it.
pub struct OpContext {
    pub kind: OpKind,
    pub fiber: Option<FiberId>,
    pub ref_count: RefCount,
    /// Kernel result of the most recent completion (negative = errno).
    pub result: i32,
    /// Set once the kernel has been asked to cancel this operation;
    /// completions after this point must not be delivered to the fiber.
    pub cancelling: bool,
    /// Buffers pinned for the kernel's benefit; kept alive until the
    /// kernel reports terminal status even if the awaiting fiber has
    /// already unwound past the call site.
    pub buffers: Vec<Arc<[u8]>>,
}

impl OpContext {
    fn new(kind: OpKind, fiber: Option<FiberId>, ref_count: RefCount) -> Self {
        OpContext {
            kind,
            fiber,
            ref_count,
            result: 0,
            cancelling: false,
            buffers: Vec::new(),
        }
    }

    pub fn is_multishot(&self) -> bool {
        matches!(self.ref_count, RefCount::Multishot)
    }

    /// Attach a buffer the kernel may still write into, keeping it alive
    /// past the point where the fiber that supplied it has unwound.
    pub fn attach_buffer(&mut self, buf: Arc<[u8]>) {
        self.buffers.push(buf);
    }
}

/// Pool of [`OpContext`] records, acquired and released in O(1).
#[derive(Default)]
pub struct ContextStore {
    slab: Slab<OpContext>,
}

impl ContextStore {
    pub fn new() -> Self {
        ContextStore { slab: Slab::new() }
    }

    /// Acquire a single-shot context with the default two owners
    /// (backend + awaiting fiber).
    pub fn acquire(&mut self, kind: OpKind, fiber: Option<FiberId>) -> ContextId {
        self.acquire_with_refs(kind, fiber, RefCount::Shared(2))
    }

    /// Acquire a context with a caller-chosen reference count, used by
    /// `chain` (n linked SQEs + 1 awaiter) and `multishot_accept`
    /// (sentinel, never auto-freed).
    pub fn acquire_with_refs(
        &mut self,
        kind: OpKind,
        fiber: Option<FiberId>,
        ref_count: RefCount,
    ) -> ContextId {
        let ctx = OpContext::new(kind, fiber, ref_count);
        ContextId(self.slab.insert(ctx))
    }

    pub fn get(&self, id: ContextId) -> Option<&OpContext> {
        self.slab.get(id.0)
    }

    pub fn get_mut(&mut self, id: ContextId) -> Option<&mut OpContext> {
        self.slab.get_mut(id.0)
    }

    /// Decrement a single-shot context's reference count, freeing it
    /// once it reaches zero. No-op (the multishot owner must release
    /// explicitly) for multishot contexts.
    pub fn release(&mut self, id: ContextId) {
        let free = match self.slab.get_mut(id.0) {
            Some(ctx) => match ctx.ref_count {
                RefCount::Shared(n) if n <= 1 => true,
                RefCount::Shared(n) => {
                    ctx.ref_count = RefCount::Shared(n - 1);
                    false
                }
                RefCount::Multishot => false,
            },
            None => false,
        };
        if free {
            self.slab.remove(id.0);
        }
    }

    /// Force-free a context regardless of its reference count, used
    /// when a multishot operation observes its terminal completion.
    pub fn force_release(&mut self, id: ContextId) {
        if self.slab.contains(id.0) {
            self.slab.remove(id.0);
        }
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }
}
