// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use fibra::config::BackendKind;
use fibra::{Runtime, RuntimeConfig};

fn single_fiber_snooze(c: &mut Criterion) {
    c.bench_function("single_fiber_snooze", |b| {
        b.iter(|| {
            let rt = Runtime::with_config(RuntimeConfig::new().backend(BackendKind::Readiness)).unwrap();
            rt.spawn(|io| {
                for _ in 0..black_box(10) {
                    io.snooze();
                }
            });
            rt.run().unwrap();
        });
    });
}

/// Ten fibers snoozing in round robin, exercising the run queue and
/// the fiber table's take/put-back path under contention rather than
/// just a single fiber's self-reschedule.
fn ten_fibers_snooze(c: &mut Criterion) {
    c.bench_function("ten_fibers_snooze", |b| {
        b.iter(|| {
            let rt = Runtime::with_config(RuntimeConfig::new().backend(BackendKind::Readiness)).unwrap();
            for _ in 0..10 {
                rt.spawn(|io| {
                    for _ in 0..black_box(10) {
                        io.snooze();
                    }
                });
            }
            rt.run().unwrap();
        });
    });
}

criterion_group!(scheduler, single_fiber_snooze, ten_fibers_snooze);
criterion_main!(scheduler);
