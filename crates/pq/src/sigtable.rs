//! Open-addressed signature hash table.
//!
//! Linear probing over a power-of-two entry array mapped inside the queue
//! file. Deletion tombstones; a successful probe that crossed a tombstone
//! run relocates the found entry into the first tombstone so runs shrink
//! under churn. The table is sized at create time for a load factor of at
//! most 0.7, so probes terminate at an empty slot in the absence of
//! corruption.

use crate::error::{PqError, Result};
use crate::layout::{TableEntry, SLOT_EMPTY, SLOT_TOMB};
use crate::sig::Signature;

/// Outcome of a table insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableInsert {
    Inserted,
    /// The signature is already present, mapped to the returned slot.
    Present(u64),
}

#[inline]
fn start_index(sig: &Signature, mask: u64) -> u64 {
    sig.table_key() & mask
}

/// Inserts `sig → slot`. The caller must hold the writer lock.
pub fn insert(entries: &mut [TableEntry], sig: &Signature, slot: u64) -> Result<TableInsert> {
    let mask = entries.len() as u64 - 1;
    let mut idx = start_index(sig, mask);
    let mut first_tomb: Option<u64> = None;

    for _ in 0..entries.len() {
        let e = &entries[idx as usize];
        match e.slot {
            SLOT_EMPTY => {
                let target = first_tomb.unwrap_or(idx) as usize;
                entries[target] = TableEntry {
                    slot,
                    signature: *sig.as_bytes(),
                };
                return Ok(TableInsert::Inserted);
            }
            SLOT_TOMB => {
                if first_tomb.is_none() {
                    first_tomb = Some(idx);
                }
            }
            occupied => {
                if e.signature == *sig.as_bytes() {
                    return Ok(TableInsert::Present(occupied));
                }
            }
        }
        idx = (idx + 1) & mask;
    }

    // A full scan without an empty slot means the load-factor sizing rule
    // was violated on disk.
    Err(PqError::Corrupt("signature table has no empty slot".into()))
}

/// Looks up `sig`, relocating the entry backward over any tombstone run it
/// was found behind. Requires at least the reader lock; relocation happens
/// only when the caller holds the writer lock (`relocate = true`).
pub fn find(entries: &mut [TableEntry], sig: &Signature, relocate: bool) -> Option<u64> {
    let mask = entries.len() as u64 - 1;
    let mut idx = start_index(sig, mask);
    let mut first_tomb: Option<u64> = None;

    for _ in 0..entries.len() {
        let e = &entries[idx as usize];
        match e.slot {
            SLOT_EMPTY => return None,
            SLOT_TOMB => {
                if first_tomb.is_none() {
                    first_tomb = Some(idx);
                }
            }
            slot => {
                if e.signature == *sig.as_bytes() {
                    if relocate {
                        if let Some(tomb) = first_tomb {
                            entries[tomb as usize] = TableEntry {
                                slot,
                                signature: *sig.as_bytes(),
                            };
                            entries[idx as usize].slot = SLOT_TOMB;
                        }
                    }
                    return Some(slot);
                }
            }
        }
        idx = (idx + 1) & mask;
    }
    None
}

/// Read-only lookup for callers holding only the reader lock.
pub fn find_ro(entries: &[TableEntry], sig: &Signature) -> Option<u64> {
    let mask = entries.len() as u64 - 1;
    let mut idx = start_index(sig, mask);

    for _ in 0..entries.len() {
        let e = &entries[idx as usize];
        match e.slot {
            SLOT_EMPTY => return None,
            SLOT_TOMB => {}
            slot => {
                if e.signature == *sig.as_bytes() {
                    return Some(slot);
                }
            }
        }
        idx = (idx + 1) & mask;
    }
    None
}

/// Removes `sig`, returning the slot it mapped to.
pub fn remove(entries: &mut [TableEntry], sig: &Signature) -> Option<u64> {
    let mask = entries.len() as u64 - 1;
    let mut idx = start_index(sig, mask);

    for _ in 0..entries.len() {
        let e = &entries[idx as usize];
        match e.slot {
            SLOT_EMPTY => return None,
            SLOT_TOMB => {}
            slot => {
                if e.signature == *sig.as_bytes() {
                    entries[idx as usize].slot = SLOT_TOMB;
                    return Some(slot);
                }
            }
        }
        idx = (idx + 1) & mask;
    }
    None
}

/// Counts live entries; used by the open-time sanity sweep.
pub fn cardinality(entries: &[TableEntry]) -> u64 {
    entries
        .iter()
        .filter(|e| e.slot != SLOT_EMPTY && e.slot != SLOT_TOMB)
        .count() as u64
}

/// Resets every entry to empty.
pub fn clear(entries: &mut [TableEntry]) {
    for e in entries {
        e.slot = SLOT_EMPTY;
        e.signature = [0; 16];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(cap: usize) -> Vec<TableEntry> {
        let mut v = Vec::with_capacity(cap);
        for _ in 0..cap {
            v.push(TableEntry {
                slot: SLOT_EMPTY,
                signature: [0; 16],
            });
        }
        v
    }

    fn sig(n: u8) -> Signature {
        Signature::digest(&[n])
    }

    #[test]
    fn insert_find_remove() {
        let mut t = fresh(16);
        assert_eq!(insert(&mut t, &sig(1), 7).unwrap(), TableInsert::Inserted);
        assert_eq!(find(&mut t, &sig(1), false), Some(7));
        assert_eq!(insert(&mut t, &sig(1), 9).unwrap(), TableInsert::Present(7));
        assert_eq!(remove(&mut t, &sig(1)), Some(7));
        assert_eq!(find(&mut t, &sig(1), false), None);
        assert_eq!(cardinality(&t), 0);
    }

    #[test]
    fn survives_churn_through_tombstones() {
        let mut t = fresh(16);
        // Fill to the load-factor bound repeatedly, deleting in between, so
        // probes must walk tombstone runs.
        for round in 0..8u8 {
            for n in 0..10u8 {
                let s = sig(round.wrapping_mul(16).wrapping_add(n));
                insert(&mut t, &s, u64::from(n)).unwrap();
            }
            for n in 0..10u8 {
                let s = sig(round.wrapping_mul(16).wrapping_add(n));
                assert_eq!(remove(&mut t, &s), Some(u64::from(n)));
            }
        }
        assert_eq!(cardinality(&t), 0);
    }

    #[test]
    fn relocation_compacts_tombstone_runs() {
        let mut t = fresh(16);
        for n in 0..6u8 {
            insert(&mut t, &sig(n), u64::from(n)).unwrap();
        }
        for n in 0..5u8 {
            remove(&mut t, &sig(n));
        }
        // Finding the survivor with relocation enabled must still succeed
        // and must keep it findable afterwards.
        assert_eq!(find(&mut t, &sig(5), true), Some(5));
        assert_eq!(find(&mut t, &sig(5), true), Some(5));
        assert_eq!(cardinality(&t), 1);
    }
}
