//! Error types for frame scanning and product assembly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The bytes at the cursor do not form a valid frame; the scanner
    /// resynchronizes on the next sentinel.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Frame parsed but carries an unknown command or version.
    #[error("unsupported frame: {0}")]
    Unsupported(String),

    /// The byte source failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Product queue rejected a handoff for a reason that is not benign.
    #[error("product queue: {0}")]
    Queue(#[from] pq::PqError),

    /// Per-product decompression failed; the product is aborted.
    #[error("zlib stream error: {0}")]
    Compress(String),
}

pub type Result<T> = std::result::Result<T, FrameError>;
