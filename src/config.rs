// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::time::Duration;

/// Which kernel-I/O backend a [`crate::Runtime`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Submission/completion ring (Linux only).
    IoUring,
    /// `poll`-based readiness reactor (portable).
    Readiness,
}

/// Builder for a [`crate::Runtime`]. Every field has a sensible default;
/// only `backend` needs to be forced away from auto-detection when a
/// caller wants to exercise the portable path deliberately (see the
/// readiness-only integration test).
pub struct RuntimeConfig {
    pub(crate) backend: Option<BackendKind>,
    pub(crate) ring_entries: u32,
    pub(crate) runqueue_capacity: usize,
    pub(crate) idle_gc_period: Duration,
    pub(crate) on_idle: Option<Box<dyn FnMut() + 'static>>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            backend: None,
            ring_entries: 256,
            runqueue_capacity: 64,
            idle_gc_period: Duration::from_secs(10),
            on_idle: None,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force a specific backend instead of auto-detecting io_uring
    /// availability.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.backend = Some(kind);
        self
    }

    pub fn auto_detect_backend(mut self) -> Self {
        self.backend = None;
        self
    }

    pub fn ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }

    pub fn runqueue_capacity(mut self, capacity: usize) -> Self {
        self.runqueue_capacity = capacity;
        self
    }

    pub fn idle_gc_period(mut self, period: Duration) -> Self {
        self.idle_gc_period = period;
        self
    }

    /// Install a callback invoked from the switch loop's idle path
    /// (empty run queue, about to block in the backend) once per
    /// `idle_gc_period`. Stands in for the host-runtime garbage
    /// collection hook this design is modeled on; there is no tracing
    /// GC to drive in a reference-counted host, so this is left to the
    /// embedder.
    pub fn on_idle(mut self, f: impl FnMut() + 'static) -> Self {
        self.on_idle = Some(Box::new(f));
        self
    }
}
