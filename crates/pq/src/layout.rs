//! On-disk layout of the product queue.
//!
//! One file, four regions at offsets fixed at create time:
//!
//! ```text
//! Offset        Region
//! 0             Header (one page reserved)
//! index_off     IndexRecord[slot_capacity]
//! table_off     TableEntry[table_capacity]   (signature hash table)
//! arena_off     byte ring of data_capacity bytes
//! ```
//!
//! All structures are `#[repr(C)]` and native-endian: the file round-trips
//! across restarts of the same build, and the magic + version reject foreign
//! files. Every multi-byte field of every record lands on its natural
//! alignment, so there is no implicit padding to leak uninitialized bytes.

use crate::info::{FeedType, ProductInfo, MAX_IDENT_LEN, MAX_ORIGIN_LEN};
use crate::sig::Signature;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// "LDM7PQ" + layout generation, as a native u64.
pub const PQ_MAGIC: u64 = 0x4C44_4D37_5051_3031;
pub const PQ_VERSION: u32 = 1;

/// Null link in the index-record lists.
pub const NIL: u64 = u64::MAX;

/// Sentinel for "arena not wrapped".
pub const NO_WRAP: u64 = u64::MAX;

/// Space reserved for the header region.
pub const HEADER_SPACE: u64 = 4096;

/// Queue-file header. Mutated only under the writer lock.
#[repr(C)]
#[derive(Debug)]
pub struct Header {
    pub magic: u64,
    pub version: u32,
    /// Consistency epoch: bumped on every writable open, written back with
    /// `clean = 1` on orderly close. An unclean epoch triggers the bounded
    /// sanity sweep at the next open.
    pub epoch: u32,
    pub clean: u32,
    pub _pad0: u32,

    pub slot_capacity: u64,
    pub data_capacity: u64,
    pub table_capacity: u64,
    pub index_off: u64,
    pub table_off: u64,
    pub arena_off: u64,
    pub file_size: u64,

    /// Occupied index records: live + reserved + dead.
    pub slots_used: u64,
    /// Arena bytes accounted: extents of occupied records plus wrap waste.
    pub data_used: u64,
    /// Committed, signature-published records only.
    pub live_count: u64,

    pub arrival_head: u64,
    pub arrival_tail: u64,
    pub free_head: u64,

    pub arena_head: u64,
    pub arena_tail: u64,
    /// Offset at which the live span wraps to 0, or [`NO_WRAP`]. Bytes in
    /// `[wrap_point, data_capacity)` are waste until the head passes them.
    pub wrap_point: u64,

    pub next_seq: u64,
    pub insert_count: u64,
    pub dup_count: u64,
    pub evict_count: u64,
    /// Outstanding reservations.
    pub reserve_count: u64,

    pub crc: u32,
    pub _pad1: u32,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();
const _: () = assert!(HEADER_SIZE == 200);
const _: () = assert!(HEADER_SIZE as u64 <= HEADER_SPACE);

impl Header {
    /// CRC over every header byte up to the `crc` field itself.
    pub fn compute_crc(&self) -> u32 {
        // SAFETY: Header is repr(C) plain data; we hash its prefix bytes.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                (self as *const Header).cast::<u8>(),
                std::mem::offset_of!(Header, crc),
            )
        };
        crc32fast::hash(bytes)
    }
}

/// Index-record lifecycle states.
pub const REC_FREE: u32 = 0;
/// Arena extent allocated, signature not yet published.
pub const REC_RESERVED: u32 = 1;
/// Committed and visible to readers.
pub const REC_LIVE: u32 = 2;
/// Aborted or superseded; extent held until FIFO eviction reclaims it.
pub const REC_DEAD: u32 = 3;

/// One slot of the product index.
#[repr(C)]
pub struct IndexRecord {
    pub state: u32,
    pub feed: u32,
    /// Arena offset of the payload.
    pub offset: u64,
    /// Payload size in bytes (may be less than `extent` after a shrinking
    /// commit).
    pub size: u64,
    /// Bytes allocated in the arena for this record.
    pub extent: u64,
    /// Arrival sequence: allocation order under the writer lock.
    pub seq: u64,
    pub arrival_secs: u64,
    pub arrival_nanos: u32,
    pub seqno: u32,
    pub signature: [u8; 16],
    pub origin_len: u16,
    pub ident_len: u16,
    /// CRC over the canonical wire encoding of the product info.
    pub info_crc: u32,
    pub origin: [u8; MAX_ORIGIN_LEN],
    pub ident: [u8; MAX_IDENT_LEN + 1],
    pub prev: u64,
    pub next: u64,
    pub next_free: u64,
}

pub const RECORD_SIZE: usize = std::mem::size_of::<IndexRecord>();
const _: () = assert!(RECORD_SIZE == 424);

impl IndexRecord {
    /// Copies the metadata fields out of a live record.
    pub fn to_info(&self) -> ProductInfo {
        let origin = String::from_utf8_lossy(&self.origin[..self.origin_len as usize]).into_owned();
        let ident = String::from_utf8_lossy(&self.ident[..self.ident_len as usize]).into_owned();
        ProductInfo {
            signature: Signature(self.signature),
            arrival: UNIX_EPOCH + Duration::new(self.arrival_secs, self.arrival_nanos),
            origin,
            feed: FeedType(self.feed),
            seqno: self.seqno,
            ident,
            size: self.size,
        }
    }

    /// Writes the metadata fields of `info` into this record.
    pub fn set_info(&mut self, info: &ProductInfo) {
        let (secs, nanos) = crate::info::split_time(info.arrival);
        self.feed = info.feed.0;
        self.size = info.size;
        self.arrival_secs = secs;
        self.arrival_nanos = nanos;
        self.seqno = info.seqno;
        self.signature = *info.signature.as_bytes();
        let olen = info.origin.len().min(MAX_ORIGIN_LEN);
        self.origin[..olen].copy_from_slice(&info.origin.as_bytes()[..olen]);
        self.origin_len = olen as u16;
        let ilen = info.ident.len().min(MAX_IDENT_LEN);
        self.ident[..ilen].copy_from_slice(&info.ident.as_bytes()[..ilen]);
        self.ident_len = ilen as u16;
        let mut wire = Vec::with_capacity(64 + olen + ilen);
        info.encode(&mut wire);
        self.info_crc = crc32fast::hash(&wire);
    }

    /// Re-derives the info CRC; mismatch means the record was torn.
    pub fn info_crc_ok(&self) -> bool {
        let mut wire = Vec::with_capacity(64);
        self.to_info().encode(&mut wire);
        crc32fast::hash(&wire) == self.info_crc
    }
}

/// Signature-table slot tags.
pub const SLOT_EMPTY: u64 = u64::MAX;
pub const SLOT_TOMB: u64 = u64::MAX - 1;

/// One slot of the open-addressed signature table.
#[repr(C)]
pub struct TableEntry {
    /// Index-record slot number, or [`SLOT_EMPTY`] / [`SLOT_TOMB`].
    pub slot: u64,
    pub signature: [u8; 16],
}

pub const ENTRY_SIZE: usize = std::mem::size_of::<TableEntry>();
const _: () = assert!(ENTRY_SIZE == 24);

/// Region offsets derived from the capacity pair at create time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub slot_capacity: u64,
    pub data_capacity: u64,
    pub table_capacity: u64,
    pub index_off: u64,
    pub table_off: u64,
    pub arena_off: u64,
    pub file_size: u64,
}

impl Geometry {
    /// Computes the layout for the given capacities. The signature table is
    /// sized so its load factor never exceeds 0.7 even at full slot
    /// occupancy.
    pub fn compute(slot_capacity: u64, data_capacity: u64) -> Geometry {
        let min_entries = slot_capacity * 10 / 7 + 1;
        let table_capacity = min_entries.next_power_of_two().max(8);
        let index_off = HEADER_SPACE;
        let table_off = index_off + slot_capacity * RECORD_SIZE as u64;
        let arena_off = round_up(table_off + table_capacity * ENTRY_SIZE as u64, 4096);
        Geometry {
            slot_capacity,
            data_capacity,
            table_capacity,
            index_off,
            table_off,
            arena_off,
            file_size: arena_off + data_capacity,
        }
    }

    /// Reconstructs the geometry recorded in a header, checking that the
    /// offsets are self-consistent.
    pub fn from_header(h: &Header) -> Option<Geometry> {
        let g = Geometry::compute(h.slot_capacity, h.data_capacity);
        let ok = g.table_capacity == h.table_capacity
            && g.index_off == h.index_off
            && g.table_off == h.table_off
            && g.arena_off == h.arena_off
            && g.file_size == h.file_size;
        ok.then_some(g)
    }
}

#[inline]
pub fn round_up(v: u64, to: u64) -> u64 {
    v.div_ceil(to) * to
}

/// Payload extents are 8-byte aligned in the arena.
#[inline]
pub fn extent_for(size: u64) -> u64 {
    round_up(size, 8)
}

pub fn now_parts() -> (u64, u32) {
    crate::info::split_time(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_is_ordered_and_sized() {
        let g = Geometry::compute(100, 1 << 20);
        assert!(g.index_off >= HEADER_SIZE as u64);
        assert!(g.table_off > g.index_off);
        assert!(g.arena_off > g.table_off);
        assert_eq!(g.file_size, g.arena_off + (1 << 20));
        assert_eq!(g.arena_off % 4096, 0);
        // Load factor bound: 100 live entries in the table.
        assert!(g.table_capacity as f64 * 0.7 >= 100.0);
    }

    #[test]
    fn geometry_round_trips_through_header() {
        let g = Geometry::compute(10, 1_000_000);
        let mut h: Header = unsafe { std::mem::zeroed() };
        h.slot_capacity = g.slot_capacity;
        h.data_capacity = g.data_capacity;
        h.table_capacity = g.table_capacity;
        h.index_off = g.index_off;
        h.table_off = g.table_off;
        h.arena_off = g.arena_off;
        h.file_size = g.file_size;
        assert_eq!(Geometry::from_header(&h), Some(g));
    }

    #[test]
    fn extent_rounding() {
        assert_eq!(extent_for(0), 0);
        assert_eq!(extent_for(1), 8);
        assert_eq!(extent_for(8), 8);
        assert_eq!(extent_for(100_000), 100_000);
    }
}
