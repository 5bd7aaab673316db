//! Error handling utils.
//!
//! Every fallible operation of the runtime returns a [`Result`]. Conditions
//! which indicate programmer misuse (unlocking a mutex held by another
//! fiber, yielding in the root fiber, re-entrant locking) are asserted and
//! abort instead; they are not recoverable and never show up here.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,

    /// The generational id refers to a fiber which has since been reclaimed
    /// (or never existed). Holding a stale id is always safe and always
    /// reports this error.
    #[error("no such fiber")]
    NoSuchFiber,

    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// Mapping the same backing pages at two adjacent addresses failed.
    #[error("failed to mmap two adjacent buffer regions: {0}")]
    BufferMmap(io::Error),

    #[error("fiber-local key does not exist")]
    NoSuchKey,

    #[error("not enough space in the buffer")]
    BufferNoSpace,

    #[error("timed out")]
    TimedOut,
}

impl Error {
    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NoSuchFiber => "NoSuchFiber",
            Self::IO(_) => "IO",
            Self::BufferMmap(_) => "BufferMmap",
            Self::NoSuchKey => "NoSuchKey",
            Self::BufferNoSpace => "BufferNoSpace",
            Self::TimedOut => "TimedOut",
        }
    }
}
