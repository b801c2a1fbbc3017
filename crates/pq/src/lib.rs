//! Persistent product queue.
//!
//! A single-file, memory-mapped, fixed-capacity ring of data-products,
//! safe across threads and cooperating processes. Supports insertion with
//! signature-keyed deduplication, streaming region reservation,
//! pattern-filtered cursor traversal in arrival order, FIFO eviction under
//! two independent capacity limits, and blocking waits for new arrivals.
//!
//! The crate also carries the sender-side product-index map used to answer
//! retransmission requests by product index after a restart.

pub mod cursor;
pub mod error;
pub mod index_map;
pub mod info;
mod invariants;
pub mod layout;
pub mod mapped;
pub mod queue;
pub mod sig;
mod sigtable;

// Re-export main types
pub use cursor::{CursorMode, ProductClass, Seq, WakeReason};
pub use error::{PqError, Result};
pub use index_map::ProductIndexMap;
pub use info::{DataProduct, FeedType, ProductInfo, MAX_IDENT_LEN, MAX_ORIGIN_LEN};
pub use mapped::OpenMode;
pub use queue::{Inserted, Pq, PqStats, Region, Unblocker};
pub use sig::Signature;
