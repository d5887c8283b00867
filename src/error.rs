//! Crate-wide error type.
//!
//! Lookup misses surface as [`Error::NonExistent`] and are informational;
//! everything else is a real failure. Errors raised while a transaction is
//! in its work stage do not abort it by themselves, the caller decides
//! (see the transaction notes in [`crate::pmem`]).

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// No record matches the given key, or an equality probe hit a
    /// tombstone.
    #[error("no matching record")]
    NonExistent,
    /// Malformed key or value for the record class.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The persistent memory manager could not allocate.
    #[error("out of persistent memory")]
    OutOfMemory,
    /// The caller buffer was too small; `len` is the actual record length.
    /// The buffer contents are unspecified.
    #[error("buffer too small, record length is {len}")]
    Truncated { len: usize },
    /// A mutation was attempted outside a work-stage transaction.
    #[error("not inside a work-stage transaction")]
    StageViolation,
    /// The tree handle is no longer valid.
    #[error("invalid tree handle")]
    NoHandle,
    /// The operation is not permitted on this tree.
    #[error("permission denied")]
    NoPermission,
    /// The persistent memory manager reported a persistence failure.
    #[error("persistent memory failure: {0}")]
    IoFailure(&'static str),
}
