//! Persistent product-index → signature map.
//!
//! A small memory-mapped ring the sender updates on each multicast send so
//! a restarted upstream can still answer backstop requests by product
//! index. Capacity should be at least the product queue's slot capacity;
//! entries are keyed `index % capacity`, so an entry survives exactly one
//! lap of the index space.

use crate::error::{PqError, Result};
use crate::info::FeedType;
use crate::mapped::{MappedFile, OpenMode};
use crate::sig::Signature;
use std::path::Path;
use std::sync::Mutex;

const PIM_MAGIC: u64 = 0x4C44_4D37_5049_4D31;
const PIM_VERSION: u32 = 1;

#[repr(C)]
struct PimHeader {
    magic: u64,
    version: u32,
    capacity: u32,
    feed: u32,
    crc: u32,
}

const PIM_HEADER_SIZE: usize = std::mem::size_of::<PimHeader>();
const _: () = assert!(PIM_HEADER_SIZE == 24);

#[repr(C)]
struct PimEntry {
    present: u32,
    index: u32,
    signature: [u8; 16],
}

const PIM_ENTRY_SIZE: usize = std::mem::size_of::<PimEntry>();
const _: () = assert!(PIM_ENTRY_SIZE == 24);

impl PimHeader {
    fn compute_crc(&self) -> u32 {
        let mut h = crc32fast::Hasher::new();
        h.update(&self.magic.to_ne_bytes());
        h.update(&self.version.to_ne_bytes());
        h.update(&self.capacity.to_ne_bytes());
        h.update(&self.feed.to_ne_bytes());
        h.finalize()
    }
}

/// The sender-side product-index map.
pub struct ProductIndexMap {
    mapped: MappedFile,
    capacity: u32,
    guard: Mutex<()>,
}

impl ProductIndexMap {
    /// Creates a fresh map for `feed` with room for `capacity` entries.
    pub fn create(path: &Path, feed: FeedType, capacity: u32) -> Result<ProductIndexMap> {
        if capacity == 0 {
            return Err(PqError::Invalid("index map capacity must be non-zero".into()));
        }
        let len = PIM_HEADER_SIZE as u64 + u64::from(capacity) * PIM_ENTRY_SIZE as u64;
        let mapped = MappedFile::create(path, len, 0o600)?;
        let map = ProductIndexMap {
            mapped,
            capacity,
            guard: Mutex::new(()),
        };
        {
            let _flk = map.mapped.lock(true)?;
            // SAFETY: exclusive lock held; fresh zeroed file.
            let h = unsafe { map.header_mut() };
            h.magic = PIM_MAGIC;
            h.version = PIM_VERSION;
            h.capacity = capacity;
            h.feed = feed.0;
            h.crc = h.compute_crc();
        }
        map.mapped.flush()?;
        Ok(map)
    }

    /// Opens an existing map, or creates it when absent or unreadable.
    pub fn open_or_create(path: &Path, feed: FeedType, capacity: u32) -> Result<ProductIndexMap> {
        match Self::open(path) {
            Ok(map) if map.capacity >= capacity => Ok(map),
            Ok(_) | Err(PqError::Corrupt(_)) | Err(PqError::Io(_)) => {
                Self::create(path, feed, capacity)
            }
            Err(e) => Err(e),
        }
    }

    /// Opens an existing map read-write.
    pub fn open(path: &Path) -> Result<ProductIndexMap> {
        let mapped = MappedFile::open(path, OpenMode::ReadWrite)?;
        if mapped.len() < PIM_HEADER_SIZE as u64 {
            return Err(PqError::Corrupt("index map smaller than header".into()));
        }
        let map = ProductIndexMap {
            mapped,
            capacity: 0,
            guard: Mutex::new(()),
        };
        let capacity = {
            let _flk = map.mapped.lock(false)?;
            // SAFETY: shared lock held.
            let h = unsafe { map.header() };
            if h.magic != PIM_MAGIC || h.version != PIM_VERSION {
                return Err(PqError::Corrupt("not a product-index map".into()));
            }
            if h.crc != h.compute_crc() {
                return Err(PqError::Corrupt("index map header checksum mismatch".into()));
            }
            let want = PIM_HEADER_SIZE as u64 + u64::from(h.capacity) * PIM_ENTRY_SIZE as u64;
            if want != map.mapped.len() {
                return Err(PqError::Corrupt("index map length mismatch".into()));
            }
            h.capacity
        };
        Ok(ProductIndexMap { capacity, ..map })
    }

    /// Records that `index` named the product with `sig`.
    pub fn put(&self, index: u32, sig: &Signature) -> Result<()> {
        let _g = self.lock();
        let _flk = self.mapped.lock(true)?;
        // SAFETY: exclusive lock held; slot < capacity by construction.
        let e = unsafe { self.entry_mut(index % self.capacity) };
        e.present = 1;
        e.index = index;
        e.signature = *sig.as_bytes();
        Ok(())
    }

    /// Looks up the signature last recorded for `index`.
    pub fn get(&self, index: u32) -> Result<Option<Signature>> {
        let _g = self.lock();
        let _flk = self.mapped.lock(false)?;
        // SAFETY: shared lock held; slot < capacity by construction.
        let e = unsafe { self.entry(index % self.capacity) };
        if e.present == 1 && e.index == index {
            Ok(Some(Signature(e.signature)))
        } else {
            Ok(None)
        }
    }

    /// Clears every entry and rebinds the map to `feed`.
    pub fn delete_all(&self, feed: FeedType) -> Result<()> {
        let _g = self.lock();
        let _flk = self.mapped.lock(true)?;
        for slot in 0..self.capacity {
            // SAFETY: exclusive lock held; slot < capacity.
            let e = unsafe { self.entry_mut(slot) };
            e.present = 0;
            e.index = 0;
            e.signature = [0; 16];
        }
        // SAFETY: exclusive lock held.
        let h = unsafe { self.header_mut() };
        h.feed = feed.0;
        h.crc = h.compute_crc();
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn flush(&self) -> Result<()> {
        self.mapped.flush()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        self.guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    unsafe fn header(&self) -> &PimHeader {
        &*self.mapped.base().cast::<PimHeader>()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut PimHeader {
        &mut *self.mapped.base().cast::<PimHeader>()
    }

    unsafe fn entry(&self, slot: u32) -> &PimEntry {
        &*self
            .mapped
            .base()
            .add(PIM_HEADER_SIZE + slot as usize * PIM_ENTRY_SIZE)
            .cast::<PimEntry>()
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn entry_mut(&self, slot: u32) -> &mut PimEntry {
        &mut *self
            .mapped
            .base()
            .add(PIM_HEADER_SIZE + slot as usize * PIM_ENTRY_SIZE)
            .cast::<PimEntry>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pim.bin");
        let map = ProductIndexMap::create(&path, FeedType::EXP, 64).unwrap();
        let sig = Signature::digest(b"product");
        map.put(12, &sig).unwrap();
        assert_eq!(map.get(12).unwrap(), Some(sig));
        assert_eq!(map.get(13).unwrap(), None);
    }

    #[test]
    fn laps_overwrite_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let map = ProductIndexMap::create(&dir.path().join("pim.bin"), FeedType::EXP, 8).unwrap();
        let a = Signature::digest(b"a");
        let b = Signature::digest(b"b");
        map.put(3, &a).unwrap();
        map.put(11, &b).unwrap(); // same slot, one lap later
        assert_eq!(map.get(3).unwrap(), None);
        assert_eq!(map.get(11).unwrap(), Some(b));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pim.bin");
        let sig = Signature::digest(b"persist");
        {
            let map = ProductIndexMap::create(&path, FeedType::EXP, 16).unwrap();
            map.put(5, &sig).unwrap();
            map.flush().unwrap();
        }
        let map = ProductIndexMap::open(&path).unwrap();
        assert_eq!(map.get(5).unwrap(), Some(sig));
        assert_eq!(map.capacity(), 16);
    }

    #[test]
    fn delete_all_clears() {
        let dir = tempfile::tempdir().unwrap();
        let map = ProductIndexMap::create(&dir.path().join("pim.bin"), FeedType::EXP, 16).unwrap();
        map.put(1, &Signature::digest(b"x")).unwrap();
        map.delete_all(FeedType::HDS).unwrap();
        assert_eq!(map.get(1).unwrap(), None);
    }
}
