//! Error types for product-queue operations.

use thiserror::Error;

/// Errors that can occur while operating on a product queue or index map.
#[derive(Debug, Error)]
pub enum PqError {
    /// Caller violated a precondition (bad geometry, stale region handle).
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// No product with the given signature is live in the queue.
    #[error("product not found")]
    NotFound,

    /// A product with the same signature is already live. Observable but
    /// benign; the queue state is unchanged.
    #[error("duplicate product signature")]
    Duplicate,

    /// The product can never fit: its payload exceeds the data capacity.
    #[error("product of {size} bytes exceeds data capacity {capacity}")]
    TooBig { size: u64, capacity: u64 },

    /// The persistent store failed an integrity check. The queue must be
    /// recreated; all further operations on this handle fail the same way.
    #[error("product queue is corrupt: {0}")]
    Corrupt(String),

    /// Underlying I/O failure (open, map, flush, lock).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource exhaustion that is not a capacity rule, e.g. every
    /// evictable record is pinned by an outstanding reservation.
    #[error("system limit: {0}")]
    System(String),

    /// Internal invariant failure. A bug, not an environmental condition.
    #[error("internal invariant violated: {0}")]
    Logic(String),
}

impl PqError {
    /// Returns `true` if the queue object is unusable and must be recreated.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::Logic(_))
    }

    /// Returns `true` for outcomes that callers routinely ignore.
    #[inline]
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

pub type Result<T> = std::result::Result<T, PqError>;
