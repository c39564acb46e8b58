//! Error kinds shared by every CSFS subsystem.
//!
//! Mirrors the teacher's hand-rolled error-enum idiom (`fzboot::err`): a single
//! `Debug`-derived enum instead of per-crate `thiserror` derives, now
//! implementing `std::error::Error` directly since the crate targets `std`.

use std::fmt;
use std::io;

/// The error type returned by every fallible CSFS operation.
#[derive(Debug)]
pub enum CsfsError {
    /// The underlying device or block cache failed.
    Io(io::Error),
    /// An on-disk structure violated an invariant (magic, depth, sort order,
    /// length). Fatal for the current mount.
    BadData(&'static str),
    /// The allocator found no run of the requested size.
    OutOfSpace,
    /// An exact-range allocation or free found bits in the wrong state.
    Busy,
    /// A directory lookup missed.
    NotFound,
    /// A directory insertion found a duplicate key.
    Exists,
    /// A name exceeded the 255-byte limit, or was empty.
    NameTooLong,
    /// An argument failed a precondition check.
    InvalidArgument(&'static str),
    /// The volume is mounted read-only.
    ReadOnly,
    /// Host memory allocation failed.
    OutOfMemory,
}

pub type CsfsResult<T> = Result<T, CsfsError>;

impl fmt::Display for CsfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsfsError::Io(err) => write!(f, "i/o error: {err}"),
            CsfsError::BadData(what) => write!(f, "on-disk structure invalid: {what}"),
            CsfsError::OutOfSpace => write!(f, "no free blocks available"),
            CsfsError::Busy => write!(f, "requested blocks are not in the expected state"),
            CsfsError::NotFound => write!(f, "entry not found"),
            CsfsError::Exists => write!(f, "entry already exists"),
            CsfsError::NameTooLong => write!(f, "name too long"),
            CsfsError::InvalidArgument(what) => write!(f, "invalid argument: {what}"),
            CsfsError::ReadOnly => write!(f, "volume is read-only"),
            CsfsError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl std::error::Error for CsfsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CsfsError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CsfsError {
    fn from(err: io::Error) -> Self {
        CsfsError::Io(err)
    }
}
