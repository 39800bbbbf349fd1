// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Wall-clock deadline tracking for the readiness backend, and the
//! catch-up arithmetic shared by `timer_loop`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::context::ContextId;
use crate::fiber::FiberId;

#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    fiber: FiberId,
    context: ContextId,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at
    }
}
impl Eq for Deadline {}
impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.at.cmp(&other.at)
    }
}

/// Min-heap of pending timeouts, used by the readiness backend to both
/// size its `poll(2)` timeout and fire expired entries.
#[derive(Default)]
pub struct TimerWheel {
    heap: BinaryHeap<Reverse<Deadline>>,
}

impl TimerWheel {
    pub fn new() -> Self {
        TimerWheel {
            heap: BinaryHeap::new(),
        }
    }

    pub fn insert(&mut self, at: Instant, fiber: FiberId, context: ContextId) {
        self.heap.push(Reverse(Deadline { at, fiber, context }));
    }

    /// How long `poll(2)` should block for, or `None` if there are no
    /// pending timers (block indefinitely, or until the run queue is no
    /// longer empty).
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.heap
            .peek()
            .map(|Reverse(d)| d.at.saturating_duration_since(now))
    }

    /// Drain and return every deadline that has passed `now`.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<(FiberId, ContextId)> {
        let mut fired = Vec::new();
        while let Some(Reverse(d)) = self.heap.peek() {
            if d.at > now {
                break;
            }
            let Reverse(d) = self.heap.pop().unwrap();
            fired.push((d.fiber, d.context));
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Advance `next` by whole multiples of `interval` until it is in the
/// future relative to `now`, even if one or more ticks were missed
/// entirely (a long-running tick body does not cause `timer_loop` to
/// fire a burst of catch-up ticks back to back).
pub fn advance_catch_up(mut next: Instant, interval: Duration, now: Instant) -> Instant {
    if interval.is_zero() {
        return now;
    }
    while next <= now {
        next += interval;
    }
    next
}
