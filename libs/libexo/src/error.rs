//! Unified error type for libexo operations.
//!
//! Recoverable failures (a kernel primitive running out of memory or
//! process slots) come back as `Result<T, Error>`. Failures that leave no
//! safe state to return to, such as an invalid page fault, abort the process
//! instead and never show up here.

use core::fmt;

use crate::errno::Errno;

/// Unified error type for libexo operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A kernel primitive failed.
    Os(Errno),
}

impl Error {
    /// The underlying kernel error number.
    pub fn errno(&self) -> Errno {
        match self {
            Error::Os(e) => *e,
        }
    }

    /// Negative integer form, as returned by the raw entry points.
    pub fn code(&self) -> i32 {
        self.errno().code()
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::Os(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Os(e) => write!(f, "{} ({})", e, e.code()),
        }
    }
}
