// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use fibra::fiber::{Fiber, ResumeValue};

/// Cost of one stack switch, with no scheduler or backend involved:
/// a fiber that immediately suspends again every time it's resumed.
fn fiber_switch(c: &mut Criterion) {
    let mut fiber = Fiber::spawn(64 * 1024, |suspend, _initial| loop {
        suspend.suspend();
    })
    .unwrap();

    c.bench_function("fiber_switch", |b| {
        b.iter(|| fiber.resume(black_box(ResumeValue::Value(0))));
    });
}

/// Cost of spawning a fiber (stack allocation included) and running it
/// to completion without ever suspending.
fn fiber_spawn_and_run(c: &mut Criterion) {
    c.bench_function("fiber_spawn_and_run", |b| {
        b.iter(|| {
            let mut fiber = Fiber::spawn(64 * 1024, |_suspend, _initial| {
                black_box(1 + 1);
            })
            .unwrap();
            fiber.resume(ResumeValue::Value(0));
        });
    });
}

criterion_group!(fiber, fiber_switch, fiber_spawn_and_run);
criterion_main!(fiber);
