// Copyright 2026 the fibra authors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;

/// Errors produced by runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A syscall returned a negative errno.
    #[error("system error: {0}")]
    Sys(#[from] io::Error),

    /// A caller passed a value the op surface rejects outright (bad
    /// interest tag, negative length, wrong chain arity).
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The run queue emptied with no outstanding operations and no
    /// fiber left to resume.
    #[error("deadlock: no runnable fiber and no pending operation")]
    Deadlock,

    /// An operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn from_errno(errno: i32) -> Self {
        Error::Sys(io::Error::from_raw_os_error(errno))
    }

    pub(crate) fn argument(msg: impl Into<String>) -> Self {
        Error::Argument(msg.into())
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Sys(e) => e,
            Error::Argument(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            Error::Deadlock => io::Error::other("deadlock"),
            Error::Cancelled => io::Error::new(io::ErrorKind::Interrupted, "cancelled"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
