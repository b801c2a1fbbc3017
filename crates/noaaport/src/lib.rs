//! NOAAPort frame assembly.
//!
//! Parses the SBN/PDH/PSH/CCB header stack from a sentinel-framed byte
//! stream, reassembles fragmented products with per-product zlib streams,
//! and hands finished products to the product queue.

pub mod assembler;
pub mod error;
pub mod frames;
pub mod ingest;
pub mod scanner;
pub mod stream;

// Re-export main types
pub use assembler::{
    deflate, feed_for, normalize_trailer, Assembler, AssemblerConfig, AssemblerStats,
    FOS_PREFIX_LEN, NWSTG_BLOCK_SIZE, TRAILER,
};
pub use error::{FrameError, Result};
pub use frames::{Pdh, Psh, Sbn};
pub use ingest::Ingester;
pub use scanner::{DataFrame, Frame, FrameScanner, FrameSource};
pub use stream::{ProductSpec, StreamBuilder};
