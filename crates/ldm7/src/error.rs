//! Error types for session-engine operations.

use pq::PqError;
use thiserror::Error;

/// Errors raised by the upstream and downstream session machinery.
#[derive(Debug, Error)]
pub enum Ldm7Error {
    /// Caller or peer violated a protocol precondition.
    #[error("invalid: {0}")]
    Invalid(String),

    /// A requested product or record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The peer refused the operation.
    #[error("refused by peer: {0}")]
    Refused(String),

    /// The ACL denied the caller.
    #[error("not authorized: {0}")]
    Unauth(String),

    /// The requested feed is unknown to this server.
    #[error("unsupported feed: {0}")]
    Unsupported(String),

    /// An RPC or probe exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Graceful shutdown was requested; not a failure.
    #[error("shut down")]
    Shutdown,

    /// Underlying transport or file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The product queue or another persistent store is damaged.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// Product-queue failure that is not corruption.
    #[error("product queue: {0}")]
    Queue(PqError),

    /// Internal invariant failure. A bug, not an environmental condition.
    #[error("internal invariant violated: {0}")]
    Logic(String),
}

impl Ldm7Error {
    /// Returns `true` when the owning object cannot continue and the
    /// session must be rebuilt from scratch.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Corrupt(_) | Self::Logic(_))
    }

    /// Returns `true` for an orderly stop rather than a failure.
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl From<PqError> for Ldm7Error {
    fn from(e: PqError) -> Self {
        match e {
            PqError::Corrupt(msg) => Ldm7Error::Corrupt(msg),
            PqError::Io(e) => Ldm7Error::Io(e),
            other => Ldm7Error::Queue(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Ldm7Error>;
