//! Error taxonomy for store operations.

use crate::uid::Uid;

/// Result alias for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors returned by store operations.
///
/// Every mutating operation is all-or-nothing: an error means no state was
/// changed, with the one exception of chunk writes, which are idempotent and
/// content-keyed, so a chunk retained by an aborted operation is inert.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// Optimistic-concurrency check failed.
    ///
    /// Recoverable by the caller: re-fetch the current state and retry, or
    /// surface a merge to the client. The store never retries on its own.
    #[error("wrong etag: expected {expected:?}, got {got:?}")]
    EtagConflict {
        /// The entity's actual current etag (`None` for "no revision yet").
        expected: Option<Uid>,
        /// The etag the caller supplied.
        got: Option<Uid>,
    },
    /// A revision referenced a chunk uid that is absent from the chunk store.
    #[error("unknown chunk {uid}")]
    UnknownChunk {
        /// The missing chunk.
        uid: Uid,
    },
    /// A uniqueness or consistency invariant would be violated.
    #[error("integrity violation: {reason}")]
    Integrity {
        /// Which invariant.
        reason: &'static str,
    },
    /// A semantic precondition failed before any write happened.
    #[error("{reason}")]
    Validation {
        /// Which precondition.
        reason: &'static str,
    },
    /// The referenced entity does not exist.
    #[error("{kind} not found")]
    NotFound {
        /// The kind of entity looked up.
        kind: &'static str,
    },
}
