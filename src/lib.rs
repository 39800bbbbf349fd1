// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-threaded cooperative fiber runtime with two pluggable
//! kernel-I/O backends.
//!
//! Every fiber runs on its own stack (see [`fiber`]) and suspends
//! through ordinary function calls on the [`runtime::Io`] handle it is
//! spawned with — `io.read(fd, len)` blocks that fiber, not the thread.
//! A single [`Runtime`] drives every fiber on one OS thread, backed by
//! either a Linux `io_uring` completion ring ([`backend::uring`]) or a
//! portable `poll(2)` readiness reactor ([`backend::readiness`]),
//! chosen automatically unless [`config::RuntimeConfig::backend`] pins
//! one down.
//!
//! ```no_run
//! use fibra::Runtime;
//!
//! let rt = Runtime::new().unwrap();
//! rt.spawn(|io| {
//!     io.sleep(std::time::Duration::from_millis(10)).unwrap();
//!     println!("done");
//! });
//! rt.run().unwrap();
//! ```

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
pub mod runqueue;
pub mod runtime;
pub mod signal;
pub mod time;
pub mod watcher;

pub use backend::ChainOp;
pub use config::{BackendKind, RuntimeConfig};
pub use error::{Error, Result};
pub use fiber::{FiberId, ResumeValue};
pub use runtime::{Io, Runtime, Stats, TraceEvent};
