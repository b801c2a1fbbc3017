//! The product queue: a persistent, memory-mapped, fixed-capacity ring of
//! data-products.
//!
//! # Concurrency protocol
//!
//! Two lock layers, always acquired file-lock first:
//!
//! - A cross-process advisory `fcntl` lock on the backing file: exclusive
//!   for any header/index mutation, shared for traversal.
//! - An in-process `RwLock` with the same discipline, because POSIX record
//!   locks do not arbitrate between threads of one process.
//!
//! Payload bytes of a reservation are written *outside* both locks: every
//! reservation owns an arena extent disjoint from all others, and the
//! extent becomes reader-visible only when `commit` publishes the signature
//! under the writer lock.
//!
//! # Arena
//!
//! The data arena is a logical byte ring. Allocation happens at the tail;
//! the free pool is always one contiguous range abutting the head, so
//! freeing the oldest record (arrival-order head) releases a contiguous
//! prefix. An allocation that does not fit before the physical end of the
//! arena wraps to offset zero and the skipped tail bytes are accounted as
//! waste until the head passes them.

use crate::cursor::{CursorMode, ProductClass, Seq, WakeReason};
use crate::error::{PqError, Result};
use crate::info::{DataProduct, ProductInfo};
use crate::invariants::{
    debug_assert_data_bounded, debug_assert_frees_prefix, debug_assert_sig_cardinality,
    debug_assert_slots_bounded,
};
use crate::layout::{
    extent_for, Geometry, Header, IndexRecord, TableEntry, HEADER_SIZE, NIL, NO_WRAP, PQ_MAGIC,
    PQ_VERSION, REC_DEAD, REC_FREE, REC_LIVE, REC_RESERVED, RECORD_SIZE,
};
use crate::mapped::{MappedFile, OpenMode};
use crate::sig::Signature;
use crate::sigtable;
use crossbeam_utils::CachePadded;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Outcome of a successful insertion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The product is newly live.
    New,
    /// A product with the same signature was already live; nothing changed.
    Duplicate,
}

/// Point-in-time queue statistics.
#[derive(Debug, Clone)]
pub struct PqStats {
    pub n_products: u64,
    pub n_bytes_used: u64,
    pub oldest_arrival: Option<SystemTime>,
    pub newest_arrival: Option<SystemTime>,
    pub cursor_seq: u64,
    pub insert_count: u64,
    pub dup_count: u64,
    pub evict_count: u64,
}

struct NotifyState {
    generation: u64,
    interrupts: u64,
}

struct ArrivalNotify {
    state: CachePadded<Mutex<NotifyState>>,
    cond: Condvar,
}

impl ArrivalNotify {
    fn new() -> Self {
        ArrivalNotify {
            state: CachePadded::new(Mutex::new(NotifyState {
                generation: 0,
                interrupts: 0,
            })),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotifyState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Handle that wakes suspended queue readers, standing in for the signal
/// set of the classic interface.
#[derive(Clone)]
pub struct Unblocker {
    notify: Arc<ArrivalNotify>,
}

impl Unblocker {
    /// Wakes every thread currently inside
    /// [`Pq::suspend_and_unblock`]; they return [`WakeReason::Interrupted`].
    pub fn unblock(&self) {
        let mut st = self.notify.lock();
        st.interrupts += 1;
        self.notify.cond.notify_all();
    }
}

struct CursorState {
    seq: u64,
}

/// In-process state shared by every handle to one queue file.
///
/// POSIX record locks arbitrate between processes but not between threads
/// (or handles) of a single process, so the `RwLock` and the arrival
/// broadcast must be shared per canonical path.
struct Shared {
    state: RwLock<()>,
    notify: Arc<ArrivalNotify>,
}

fn shared_for(path: &Path) -> Arc<Shared> {
    use std::collections::HashMap;
    use std::sync::{OnceLock, Weak};

    static REGISTRY: OnceLock<Mutex<HashMap<std::path::PathBuf, Weak<Shared>>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
    let key = path.canonicalize().unwrap_or_else(|_| path.to_owned());

    let mut map = registry
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    map.retain(|_, weak| weak.strong_count() > 0);
    if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
        return existing;
    }
    let fresh = Arc::new(Shared {
        state: RwLock::new(()),
        notify: Arc::new(ArrivalNotify::new()),
    });
    map.insert(key, Arc::downgrade(&fresh));
    fresh
}

struct AllocPlan {
    offset: u64,
    cost: u64,
    tail: u64,
    wrap: u64,
}

/// A persistent, process-shared product queue.
///
/// Every handle carries its own cursor; in-process lock state is shared
/// between handles to the same file.
pub struct Pq {
    mapped: MappedFile,
    shared: Arc<Shared>,
    cursor: Mutex<CursorState>,
    poisoned: AtomicBool,
}

impl Pq {
    // ---------------------------------------------------------------------
    // LIFECYCLE
    // ---------------------------------------------------------------------

    /// Creates a fresh queue at `path`, clobbering any existing file.
    pub fn create(path: &Path, slot_capacity: u64, data_capacity: u64, perms: u32) -> Result<Pq> {
        if slot_capacity == 0 || data_capacity == 0 {
            return Err(PqError::Invalid(
                "slot and data capacities must be non-zero".into(),
            ));
        }
        let geo = Geometry::compute(slot_capacity, data_capacity);
        let mapped = MappedFile::create(path, geo.file_size, perms)?;
        let shared = shared_for(mapped.path());
        let pq = Pq {
            mapped,
            shared,
            cursor: Mutex::new(CursorState { seq: 0 }),
            poisoned: AtomicBool::new(false),
        };

        {
            let _flk = pq.mapped.lock(true)?;
            let _g = pq.write_state();
            // SAFETY: exclusive lock held; the mapping covers the header.
            let h = unsafe { pq.header_mut() };
            h.magic = PQ_MAGIC;
            h.version = PQ_VERSION;
            h.epoch = 1;
            h.clean = 0;
            h.slot_capacity = geo.slot_capacity;
            h.data_capacity = geo.data_capacity;
            h.table_capacity = geo.table_capacity;
            h.index_off = geo.index_off;
            h.table_off = geo.table_off;
            h.arena_off = geo.arena_off;
            h.file_size = geo.file_size;
            h.arrival_head = NIL;
            h.arrival_tail = NIL;
            h.wrap_point = NO_WRAP;
            h.free_head = 0;
            // Chain every index record into the free list.
            for slot in 0..slot_capacity {
                // SAFETY: slot < slot_capacity; exclusive lock held.
                let r = unsafe { pq.record_mut(slot) };
                r.state = REC_FREE;
                r.next_free = if slot + 1 < slot_capacity { slot + 1 } else { NIL };
            }
            // SAFETY: exclusive lock held; region bounds from geometry.
            sigtable::clear(unsafe { pq.table_mut() });
        }
        pq.mapped.flush()?;
        tracing::info!(
            path = %path.display(),
            slots = slot_capacity,
            bytes = data_capacity,
            "created product queue"
        );
        Ok(pq)
    }

    /// Opens an existing queue.
    ///
    /// A writable open bumps the consistency epoch and clears the clean
    /// flag; both are restored by an orderly close. Every open runs a
    /// bounded sanity sweep — on failure the handle is poisoned and
    /// subsequent operations return [`PqError::Corrupt`].
    pub fn open(path: &Path, mode: OpenMode) -> Result<Pq> {
        let mapped = MappedFile::open(path, mode)?;
        if mapped.len() < HEADER_SIZE as u64 {
            return Err(PqError::Corrupt("file smaller than header".into()));
        }
        let shared = shared_for(mapped.path());
        let pq = Pq {
            mapped,
            shared,
            cursor: Mutex::new(CursorState { seq: 0 }),
            poisoned: AtomicBool::new(false),
        };

        let was_clean;
        {
            let _flk = pq.mapped.lock(true)?;
            let _g = pq.write_state();
            // SAFETY: lock held; mapping covers the header.
            let h = unsafe { pq.header_mut() };
            if h.magic != PQ_MAGIC {
                return Err(PqError::Corrupt("not a product-queue file".into()));
            }
            if h.version != PQ_VERSION {
                return Err(PqError::Corrupt(format!(
                    "queue version {} unsupported",
                    h.version
                )));
            }
            if h.file_size != pq.mapped.len() || Geometry::from_header(h).is_none() {
                return Err(PqError::Corrupt("header geometry mismatch".into()));
            }
            was_clean = h.clean == 1;
            if was_clean && h.compute_crc() != h.crc {
                return Err(PqError::Corrupt("header checksum mismatch".into()));
            }
            if mode == OpenMode::ReadWrite {
                h.epoch = h.epoch.wrapping_add(1);
                h.clean = 0;
            }
            if let Err(e) = pq.sanity_sweep(h) {
                tracing::error!(path = %path.display(), error = %e, "queue failed sanity sweep");
                pq.poisoned.store(true, Ordering::Release);
            }
        }
        if !was_clean {
            tracing::warn!(path = %path.display(), "queue was not closed cleanly");
        }
        Ok(pq)
    }

    /// Flushes and releases the queue, marking it cleanly closed.
    pub fn close(self) -> Result<()> {
        self.finalize()
    }

    fn finalize(&self) -> Result<()> {
        if self.mapped.mode() == OpenMode::ReadWrite && !self.poisoned.load(Ordering::Acquire) {
            let _flk = self.mapped.lock(true)?;
            let _g = self.write_state();
            // SAFETY: exclusive lock held.
            let h = unsafe { self.header_mut() };
            h.clean = 1;
            h.crc = h.compute_crc();
        }
        self.mapped.flush()
    }

    /// Filesystem path of the backing file.
    pub fn path(&self) -> &Path {
        self.mapped.path()
    }

    /// Record capacity fixed at create time.
    pub fn slot_capacity(&self) -> u64 {
        // SAFETY: geometry fields are immutable after create.
        unsafe { self.header() }.slot_capacity
    }

    /// Arena capacity in bytes fixed at create time.
    pub fn data_capacity(&self) -> u64 {
        // SAFETY: geometry fields are immutable after create.
        unsafe { self.header() }.data_capacity
    }

    /// Number of outstanding reservations.
    pub fn pqe_count(&self) -> Result<u64> {
        let _flk = self.mapped.lock(false)?;
        let _g = self.read_state();
        // SAFETY: shared lock held.
        Ok(unsafe { self.header() }.reserve_count)
    }

    // ---------------------------------------------------------------------
    // INSERTION
    // ---------------------------------------------------------------------

    /// Atomically inserts a product, evicting oldest records as needed.
    ///
    /// Returns [`Inserted::Duplicate`] without any state change when the
    /// signature is already live; [`PqError::TooBig`] when the payload can
    /// never fit.
    pub fn insert(&self, product: &DataProduct) -> Result<Inserted> {
        self.ensure_writable()?;
        self.ensure_healthy()?;
        product.info.validate()?;
        if product.info.signature.is_none() {
            return Err(PqError::Invalid("product signature is unset".into()));
        }
        if product.data.len() as u64 != product.info.size {
            return Err(PqError::Invalid(format!(
                "info size {} disagrees with payload length {}",
                product.info.size,
                product.data.len()
            )));
        }

        let extent = extent_for(product.info.size);
        let outcome = {
            let _flk = self.mapped.lock(true)?;
            let _g = self.write_state();
            // SAFETY: exclusive lock held for all header/index access below.
            let h = unsafe { self.header_mut() };
            if product.info.size > h.data_capacity || extent > h.data_capacity {
                return Err(PqError::TooBig {
                    size: product.info.size,
                    capacity: h.data_capacity,
                });
            }

            // SAFETY: exclusive lock held.
            let table = unsafe { self.table_mut() };
            if sigtable::find(table, &product.info.signature, true).is_some() {
                h.dup_count += 1;
                tracing::debug!(signature = %product.info.signature, "duplicate insert ignored");
                Inserted::Duplicate
            } else {
                let offset = self.make_room(h, extent)?;
                let slot = self.take_free_record(h)?;
                // SAFETY: [offset, offset + size) is an extent owned by this
                // record alone; no reader sees it until the signature is
                // published below.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        product.data.as_ptr(),
                        self.arena_ptr(h.arena_off, offset),
                        product.data.len(),
                    );
                }
                h.next_seq += 1;
                let seq = h.next_seq;
                // SAFETY: slot came from the free list under the lock.
                let r = unsafe { self.record_mut(slot) };
                reset_record(r);
                r.state = REC_LIVE;
                r.offset = offset;
                r.extent = extent;
                r.seq = seq;
                r.set_info(&product.info);
                // SAFETY: exclusive lock held.
                match sigtable::insert(unsafe { self.table_mut() }, &product.info.signature, slot)? {
                    sigtable::TableInsert::Inserted => {}
                    sigtable::TableInsert::Present(_) => {
                        return Err(PqError::Logic(
                            "signature appeared during insertion".into(),
                        ));
                    }
                }
                self.link_tail(h, slot);
                h.slots_used += 1;
                h.live_count += 1;
                h.insert_count += 1;

                debug_assert_slots_bounded!(h.slots_used, h.slot_capacity);
                debug_assert_data_bounded!(h.data_used, h.data_capacity);
                // SAFETY: exclusive lock held.
                debug_assert_sig_cardinality!(
                    sigtable::cardinality(unsafe { self.table_mut() }),
                    h.live_count
                );
                Inserted::New
            }
        };
        if outcome == Inserted::New {
            self.notify_new_arrival();
        }
        Ok(outcome)
    }

    /// Pre-allocates an arena extent and an index slot without publishing a
    /// signature. The returned region must be committed or aborted; drop
    /// aborts.
    pub fn reserve(&self, size: u64) -> Result<Region<'_>> {
        self.ensure_writable()?;
        self.ensure_healthy()?;
        let extent = extent_for(size);
        let _flk = self.mapped.lock(true)?;
        let _g = self.write_state();
        // SAFETY: exclusive lock held.
        let h = unsafe { self.header_mut() };
        if size > h.data_capacity || extent > h.data_capacity {
            return Err(PqError::TooBig {
                size,
                capacity: h.data_capacity,
            });
        }
        let offset = self.make_room(h, extent)?;
        let slot = self.take_free_record(h)?;
        h.next_seq += 1;
        let seq = h.next_seq;
        // SAFETY: slot came from the free list under the lock.
        let r = unsafe { self.record_mut(slot) };
        reset_record(r);
        r.state = REC_RESERVED;
        r.offset = offset;
        r.extent = extent;
        r.size = size;
        r.seq = seq;
        self.link_tail(h, slot);
        h.slots_used += 1;
        h.reserve_count += 1;
        debug_assert_slots_bounded!(h.slots_used, h.slot_capacity);
        debug_assert_data_bounded!(h.data_used, h.data_capacity);

        Ok(Region {
            pq: self,
            slot,
            offset,
            size,
            written: 0,
            settled: false,
        })
    }

    // ---------------------------------------------------------------------
    // LOOKUP & DELETION
    // ---------------------------------------------------------------------

    /// Copies out the product with the given signature, if live.
    pub fn find_by_signature(&self, sig: &Signature) -> Result<Option<DataProduct>> {
        self.ensure_healthy()?;
        let _flk = self.mapped.lock(false)?;
        let _g = self.read_state();
        // SAFETY: shared lock held; lookups do not mutate.
        let table = unsafe { self.table_ref() };
        let Some(slot) = sigtable::find_ro(table, sig) else {
            return Ok(None);
        };
        // SAFETY: slot validated against capacity by the table invariant.
        let r = unsafe { self.record(slot) };
        if r.state != REC_LIVE {
            return Err(PqError::Corrupt(
                "signature table points at a non-live record".into(),
            ));
        }
        let h = unsafe { self.header() };
        // SAFETY: the record's extent is inside the arena and stable while
        // the shared lock blocks eviction.
        let data = unsafe {
            std::slice::from_raw_parts(self.arena_ptr(h.arena_off, r.offset), r.size as usize)
        };
        Ok(Some(DataProduct {
            info: r.to_info(),
            data: data.to_vec(),
        }))
    }

    /// Removes a single live product. Returns `false` if no such product.
    ///
    /// Must not be called from inside a [`Pq::sequence`] callback: the
    /// callback runs under the reader lock and deletion needs the writer
    /// lock.
    pub fn delete_by_signature(&self, sig: &Signature) -> Result<bool> {
        self.ensure_writable()?;
        self.ensure_healthy()?;
        let _flk = self.mapped.lock(true)?;
        let _g = self.write_state();
        // SAFETY: exclusive lock held.
        let h = unsafe { self.header_mut() };
        let table = unsafe { self.table_mut() };
        let Some(slot) = sigtable::remove(table, sig) else {
            return Ok(false);
        };
        // SAFETY: slot validated by the table invariant.
        let r = unsafe { self.record_mut(slot) };
        if r.state != REC_LIVE {
            return Err(PqError::Corrupt(
                "signature table points at a non-live record".into(),
            ));
        }
        // The extent stays in place until FIFO eviction reaches it, so the
        // free pool keeps abutting the arena head.
        r.state = REC_DEAD;
        h.live_count -= 1;
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // CURSOR TRAVERSAL
    // ---------------------------------------------------------------------

    /// Visits the first product in arrival order that is beyond the cursor
    /// (per `mode`) and matches `class`, then advances the cursor to it.
    ///
    /// The callback runs with the product's region read-locked; it must not
    /// call back into mutating queue operations.
    pub fn sequence<F>(&self, mode: CursorMode, class: &ProductClass, mut f: F) -> Result<Seq>
    where
        F: FnMut(&ProductInfo, &[u8]),
    {
        self.ensure_healthy()?;
        let _flk = self.mapped.lock(false)?;
        let _g = self.read_state();
        let mut cursor = self.lock_cursor();
        // SAFETY: shared lock held for the whole traversal.
        let h = unsafe { self.header() };

        let mut slot = h.arrival_head;
        let mut hops = 0u64;
        while slot != NIL {
            hops += 1;
            if hops > h.slot_capacity || slot >= h.slot_capacity {
                self.poisoned.store(true, Ordering::Release);
                return Err(PqError::Corrupt("arrival list is cyclic or out of range".into()));
            }
            // SAFETY: slot bound checked above.
            let r = unsafe { self.record(slot) };
            if r.state == REC_LIVE && cursor_admits(mode, r.seq, cursor.seq) {
                let info = r.to_info();
                if class.matches(&info) {
                    // SAFETY: extent inside the arena; shared lock blocks
                    // eviction while the callback runs.
                    let data = unsafe {
                        std::slice::from_raw_parts(
                            self.arena_ptr(h.arena_off, r.offset),
                            r.size as usize,
                        )
                    };
                    f(&info, data);
                    cursor.seq = r.seq;
                    return Ok(Seq::Advanced);
                }
            }
            slot = r.next;
        }
        Ok(Seq::End)
    }

    /// Rewinds the cursor before the oldest product.
    pub fn rewind(&self) {
        self.lock_cursor().seq = 0;
    }

    /// Positions the cursor *at* the product with the given signature, so a
    /// subsequent `Gt` step visits its successor. Returns `false` if the
    /// signature is not live.
    pub fn set_cursor_to_signature(&self, sig: &Signature) -> Result<bool> {
        self.ensure_healthy()?;
        let _flk = self.mapped.lock(false)?;
        let _g = self.read_state();
        // SAFETY: shared lock held.
        let table = unsafe { self.table_ref() };
        let Some(slot) = sigtable::find_ro(table, sig) else {
            return Ok(false);
        };
        // SAFETY: slot validated by the table invariant.
        let r = unsafe { self.record(slot) };
        if r.state != REC_LIVE {
            return Ok(false);
        }
        self.lock_cursor().seq = r.seq;
        Ok(true)
    }

    /// Positions the cursor at the first live product whose arrival is at
    /// or after `t`, so a subsequent `Ge` step visits it. With no such
    /// product, the cursor lands past the newest entry.
    pub fn set_cursor_to_time(&self, t: SystemTime) -> Result<()> {
        self.ensure_healthy()?;
        let _flk = self.mapped.lock(false)?;
        let _g = self.read_state();
        // SAFETY: shared lock held.
        let h = unsafe { self.header() };
        let target = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut slot = h.arrival_head;
        let mut hops = 0u64;
        let mut seq = h.next_seq + 1;
        while slot != NIL && hops <= h.slot_capacity {
            hops += 1;
            // SAFETY: sweep-validated list; bounds enforced by hops guard.
            let r = unsafe { self.record(slot) };
            if r.state == REC_LIVE {
                let arrival = Duration::new(r.arrival_secs, r.arrival_nanos);
                if arrival >= target {
                    seq = r.seq;
                    break;
                }
            }
            slot = r.next;
        }
        self.lock_cursor().seq = seq;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // BLOCKING
    // ---------------------------------------------------------------------

    /// Blocks until a new product is committed, `timeout` elapses, or an
    /// [`Unblocker`] fires. The broadcast is edge-triggered: callers must
    /// re-query the cursor after waking.
    pub fn suspend_and_unblock(&self, timeout: Duration) -> WakeReason {
        let deadline = Instant::now() + timeout;
        let mut st = self.shared.notify.lock();
        let gen0 = st.generation;
        let intr0 = st.interrupts;
        loop {
            if st.generation != gen0 {
                return WakeReason::NewProduct;
            }
            if st.interrupts != intr0 {
                return WakeReason::Interrupted;
            }
            let now = Instant::now();
            if now >= deadline {
                return WakeReason::Timeout;
            }
            let (guard, _res) = self
                .shared
                .notify
                .cond
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            st = guard;
        }
    }

    /// Returns a handle that interrupts suspended readers of this queue.
    pub fn unblocker(&self) -> Unblocker {
        Unblocker {
            notify: Arc::clone(&self.shared.notify),
        }
    }

    // ---------------------------------------------------------------------
    // STATISTICS
    // ---------------------------------------------------------------------

    pub fn stats(&self) -> Result<PqStats> {
        self.ensure_healthy()?;
        let _flk = self.mapped.lock(false)?;
        let _g = self.read_state();
        // SAFETY: shared lock held.
        let h = unsafe { self.header() };

        let oldest = self.walk_to_live(h.arrival_head, h, |r| r.next);
        let newest = self.walk_to_live(h.arrival_tail, h, |r| r.prev);
        Ok(PqStats {
            n_products: h.live_count,
            n_bytes_used: h.data_used,
            oldest_arrival: oldest,
            newest_arrival: newest,
            cursor_seq: self.lock_cursor().seq,
            insert_count: h.insert_count,
            dup_count: h.dup_count,
            evict_count: h.evict_count,
        })
    }

    fn walk_to_live(
        &self,
        start: u64,
        h: &Header,
        step: impl Fn(&IndexRecord) -> u64,
    ) -> Option<SystemTime> {
        let mut slot = start;
        let mut hops = 0u64;
        while slot != NIL && slot < h.slot_capacity && hops <= h.slot_capacity {
            hops += 1;
            // SAFETY: bound checked in the loop condition.
            let r = unsafe { self.record(slot) };
            if r.state == REC_LIVE {
                return Some(UNIX_EPOCH + Duration::new(r.arrival_secs, r.arrival_nanos));
            }
            slot = step(r);
        }
        None
    }

    // ---------------------------------------------------------------------
    // INTERNALS
    // ---------------------------------------------------------------------

    fn ensure_writable(&self) -> Result<()> {
        if self.mapped.mode() != OpenMode::ReadWrite {
            return Err(PqError::Invalid("queue opened read-only".into()));
        }
        Ok(())
    }

    fn ensure_healthy(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(PqError::Corrupt("queue failed an integrity check".into()));
        }
        Ok(())
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, ()> {
        self.shared
            .state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, ()> {
        self.shared
            .state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn lock_cursor(&self) -> MutexGuard<'_, CursorState> {
        self.cursor
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn notify_new_arrival(&self) {
        let mut st = self.shared.notify.lock();
        st.generation += 1;
        self.shared.notify.cond.notify_all();
    }

    // SAFETY contract for the accessors below: the mapping is valid for the
    // life of `self`; callers hold the lock level stated on each.

    /// Requires at least the reader lock.
    unsafe fn header(&self) -> &Header {
        &*self.mapped.base().cast::<Header>()
    }

    /// Requires the writer lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut Header {
        &mut *self.mapped.base().cast::<Header>()
    }

    /// Requires at least the reader lock and `slot < slot_capacity`.
    unsafe fn record(&self, slot: u64) -> &IndexRecord {
        let h = self.header();
        &*self
            .mapped
            .base()
            .add(h.index_off as usize + slot as usize * RECORD_SIZE)
            .cast::<IndexRecord>()
    }

    /// Requires the writer lock and `slot < slot_capacity`.
    #[allow(clippy::mut_from_ref)]
    unsafe fn record_mut(&self, slot: u64) -> &mut IndexRecord {
        let h = self.header();
        &mut *self
            .mapped
            .base()
            .add(h.index_off as usize + slot as usize * RECORD_SIZE)
            .cast::<IndexRecord>()
    }

    /// Requires at least the reader lock.
    unsafe fn table_ref(&self) -> &[TableEntry] {
        let h = self.header();
        std::slice::from_raw_parts(
            self.mapped.base().add(h.table_off as usize).cast::<TableEntry>(),
            h.table_capacity as usize,
        )
    }

    /// Requires the writer lock.
    #[allow(clippy::mut_from_ref)]
    unsafe fn table_mut(&self) -> &mut [TableEntry] {
        let h = self.header();
        std::slice::from_raw_parts_mut(
            self.mapped.base().add(h.table_off as usize).cast::<TableEntry>(),
            h.table_capacity as usize,
        )
    }

    /// Pointer into the arena; bounds are the caller's responsibility.
    fn arena_ptr(&self, arena_off: u64, offset: u64) -> *mut u8 {
        // SAFETY: arena_off + offset stays inside the mapping for every
        // extent the allocator hands out.
        unsafe { self.mapped.base().add(arena_off as usize + offset as usize) }
    }

    /// Plans an allocation of `extent` bytes at the arena tail without
    /// mutating anything. `None` means no contiguous space at present.
    fn plan_alloc(h: &Header, extent: u64) -> Option<AllocPlan> {
        if extent == 0 {
            return Some(AllocPlan {
                offset: h.arena_tail,
                cost: 0,
                tail: h.arena_tail,
                wrap: h.wrap_point,
            });
        }
        if h.wrap_point == NO_WRAP {
            if h.data_capacity - h.arena_tail >= extent {
                return Some(AllocPlan {
                    offset: h.arena_tail,
                    cost: extent,
                    tail: h.arena_tail + extent,
                    wrap: NO_WRAP,
                });
            }
            // Wrap: skip the tail remainder and restart at offset zero.
            if h.arena_head >= extent {
                return Some(AllocPlan {
                    offset: 0,
                    cost: (h.data_capacity - h.arena_tail) + extent,
                    tail: extent,
                    wrap: h.arena_tail,
                });
            }
            return None;
        }
        if h.arena_head - h.arena_tail >= extent {
            return Some(AllocPlan {
                offset: h.arena_tail,
                cost: extent,
                tail: h.arena_tail + extent,
                wrap: h.wrap_point,
            });
        }
        None
    }

    /// Evicts oldest records until `extent` bytes and one slot are
    /// available, then performs the allocation. Caller holds the writer
    /// lock.
    fn make_room(&self, h: &mut Header, extent: u64) -> Result<u64> {
        loop {
            if h.slots_used + 1 <= h.slot_capacity {
                if let Some(plan) = Self::plan_alloc(h, extent) {
                    if h.data_used + plan.cost <= h.data_capacity {
                        h.arena_tail = plan.tail;
                        h.wrap_point = plan.wrap;
                        h.data_used += plan.cost;
                        return Ok(plan.offset);
                    }
                }
            }
            if !self.evict_oldest(h)? {
                return Err(PqError::System(
                    "queue space is pinned by outstanding reservations".into(),
                ));
            }
        }
    }

    /// Removes the arrival-order head record. Returns `false` when nothing
    /// can be evicted (empty queue or a still-reserved head).
    fn evict_oldest(&self, h: &mut Header) -> Result<bool> {
        let slot = h.arrival_head;
        if slot == NIL {
            return Ok(false);
        }
        if slot >= h.slot_capacity {
            return Err(PqError::Corrupt("arrival head out of range".into()));
        }
        // SAFETY: writer lock held; bound checked.
        let r = unsafe { self.record_mut(slot) };
        match r.state {
            REC_RESERVED => return Ok(false),
            REC_LIVE => {
                let sig = Signature(r.signature);
                // SAFETY: writer lock held.
                let removed = sigtable::remove(unsafe { self.table_mut() }, &sig);
                if removed != Some(slot) {
                    return Err(PqError::Corrupt(
                        "live record missing from signature table".into(),
                    ));
                }
                h.live_count -= 1;
                h.evict_count += 1;
                tracing::trace!(signature = %sig, "evicted oldest product");
            }
            REC_DEAD => {}
            _ => return Err(PqError::Corrupt("free record linked in arrival list".into())),
        }

        // Unlink from the arrival list.
        let next = r.next;
        h.arrival_head = next;
        if next != NIL {
            // SAFETY: writer lock held; next validated by the sweep bound.
            unsafe { self.record_mut(next) }.prev = NIL;
        } else {
            h.arrival_tail = NIL;
        }

        // Release the arena prefix.
        if r.extent > 0 {
            debug_assert_frees_prefix!(r.offset, h.arena_head);
            h.arena_head = r.offset + r.extent;
            h.data_used -= r.extent;
            if h.wrap_point != NO_WRAP && h.arena_head == h.wrap_point {
                h.data_used -= h.data_capacity - h.wrap_point;
                h.arena_head = 0;
                h.wrap_point = NO_WRAP;
            }
        }

        h.slots_used -= 1;
        if h.slots_used == 0 {
            debug_assert!(h.data_used == 0, "empty queue with data_used {}", h.data_used);
            h.arena_head = 0;
            h.arena_tail = 0;
            h.wrap_point = NO_WRAP;
        }

        let r = unsafe { self.record_mut(slot) };
        r.state = REC_FREE;
        r.next_free = h.free_head;
        h.free_head = slot;
        Ok(true)
    }

    fn take_free_record(&self, h: &mut Header) -> Result<u64> {
        let slot = h.free_head;
        if slot == NIL || slot >= h.slot_capacity {
            return Err(PqError::Corrupt("free list exhausted or out of range".into()));
        }
        // SAFETY: writer lock held; bound checked.
        h.free_head = unsafe { self.record(slot) }.next_free;
        Ok(slot)
    }

    fn link_tail(&self, h: &mut Header, slot: u64) {
        // SAFETY: writer lock held throughout.
        let r = unsafe { self.record_mut(slot) };
        r.prev = h.arrival_tail;
        r.next = NIL;
        if h.arrival_tail != NIL {
            unsafe { self.record_mut(h.arrival_tail) }.next = slot;
        } else {
            h.arrival_head = slot;
        }
        h.arrival_tail = slot;
    }

    /// Bounded integrity sweep of the arrival list, free list, arena
    /// accounting, and signature table. Runs at open; the hop bound is the
    /// slot capacity, so a cyclic list cannot hang the caller.
    fn sanity_sweep(&self, h: &Header) -> Result<()> {
        let mut hops = 0u64;
        let mut slot = h.arrival_head;
        let mut prev = NIL;
        let mut live = 0u64;
        let mut extents = 0u64;
        let mut ptr = h.arena_head;
        let mut reserved = 0u64;

        while slot != NIL {
            hops += 1;
            if hops > h.slot_capacity || slot >= h.slot_capacity {
                return Err(PqError::Corrupt("arrival list cyclic or out of range".into()));
            }
            // SAFETY: bound checked above; open-time exclusive lock held.
            let r = unsafe { self.record(slot) };
            if r.prev != prev {
                return Err(PqError::Corrupt("arrival list back-link mismatch".into()));
            }
            match r.state {
                REC_LIVE => {
                    live += 1;
                    if !r.info_crc_ok() {
                        return Err(PqError::Corrupt("torn product info record".into()));
                    }
                }
                REC_RESERVED => reserved += 1,
                REC_DEAD => {}
                _ => return Err(PqError::Corrupt("free record linked in arrival list".into())),
            }
            if r.extent > 0 {
                if h.wrap_point != NO_WRAP && ptr == h.wrap_point {
                    ptr = 0;
                }
                if r.offset != ptr || r.size > r.extent {
                    return Err(PqError::Corrupt("arena extents are not contiguous".into()));
                }
                ptr += r.extent;
                extents += r.extent;
            }
            prev = slot;
            slot = r.next;
        }

        if prev != h.arrival_tail {
            return Err(PqError::Corrupt("arrival tail mismatch".into()));
        }
        if hops != h.slots_used || live != h.live_count || reserved != h.reserve_count {
            return Err(PqError::Corrupt("occupancy counters disagree with list".into()));
        }
        let waste = if h.wrap_point == NO_WRAP {
            0
        } else {
            h.data_capacity - h.wrap_point
        };
        if extents + waste != h.data_used || h.data_used > h.data_capacity {
            return Err(PqError::Corrupt("arena accounting mismatch".into()));
        }
        // SAFETY: open-time exclusive lock held.
        let cardinality = sigtable::cardinality(unsafe { self.table_ref() });
        if cardinality != h.live_count {
            return Err(PqError::Corrupt(
                "signature table cardinality disagrees with live count".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for Pq {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

fn cursor_admits(mode: CursorMode, seq: u64, cursor: u64) -> bool {
    match mode {
        CursorMode::Gt => seq > cursor,
        CursorMode::Ge => seq >= cursor,
    }
}

fn reset_record(r: &mut IndexRecord) {
    *r = unsafe { std::mem::zeroed() };
    r.prev = NIL;
    r.next = NIL;
    r.next_free = NIL;
}

// =============================================================================
// RESERVED REGIONS
// =============================================================================

/// A pre-allocated arena extent awaiting its payload and signature.
///
/// Bytes are streamed in with [`Region::write`]; [`Region::commit`]
/// publishes the signature and makes the product visible,
/// [`Region::abort`] (or drop) discards it. A discarded region keeps its
/// arena extent until eviction reaches it in arrival order.
pub struct Region<'a> {
    pq: &'a Pq,
    slot: u64,
    offset: u64,
    size: u64,
    written: u64,
    settled: bool,
}

impl Region<'_> {
    /// Bytes reserved for this region.
    pub fn capacity(&self) -> u64 {
        self.size
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends payload bytes. No queue lock is taken: the extent is owned
    /// exclusively by this region until commit.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.written + bytes.len() as u64 > self.size {
            return Err(PqError::Invalid(format!(
                "write of {} bytes overflows reservation of {}",
                bytes.len(),
                self.size
            )));
        }
        // SAFETY: [offset, offset + size) is this region's private extent;
        // readers cannot see it before commit publishes the signature.
        let h = unsafe { self.pq.header() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.pq.arena_ptr(h.arena_off, self.offset + self.written),
                bytes.len(),
            );
        }
        self.written += bytes.len() as u64;
        Ok(())
    }

    /// Publishes the product. `info.size` may be smaller than the
    /// reservation (a streaming writer can over-reserve); the slack stays
    /// allocated until eviction.
    pub fn commit(mut self, info: &ProductInfo) -> Result<Inserted> {
        info.validate()?;
        if info.signature.is_none() {
            return Err(PqError::Invalid("committing with unset signature".into()));
        }
        if info.size > self.size {
            return Err(PqError::Invalid(format!(
                "info size {} exceeds reservation of {}",
                info.size, self.size
            )));
        }
        let outcome = {
            let _flk = self.pq.mapped.lock(true)?;
            let _g = self.pq.write_state();
            // SAFETY: exclusive lock held.
            let h = unsafe { self.pq.header_mut() };
            let r = unsafe { self.pq.record_mut(self.slot) };
            if r.state != REC_RESERVED {
                return Err(PqError::Logic("commit of a non-reserved region".into()));
            }
            // SAFETY: exclusive lock held.
            let table = unsafe { self.pq.table_mut() };
            if sigtable::find(table, &info.signature, true).is_some() {
                r.state = REC_DEAD;
                h.reserve_count -= 1;
                h.dup_count += 1;
                self.settled = true;
                Inserted::Duplicate
            } else {
                r.set_info(info);
                r.state = REC_LIVE;
                // SAFETY: exclusive lock held.
                match sigtable::insert(unsafe { self.pq.table_mut() }, &info.signature, self.slot)? {
                    sigtable::TableInsert::Inserted => {}
                    sigtable::TableInsert::Present(_) => {
                        return Err(PqError::Logic(
                            "signature appeared during commit".into(),
                        ));
                    }
                }
                h.reserve_count -= 1;
                h.live_count += 1;
                h.insert_count += 1;
                self.settled = true;
                // SAFETY: exclusive lock held.
                debug_assert_sig_cardinality!(
                    sigtable::cardinality(unsafe { self.pq.table_ref() }),
                    h.live_count
                );
                Inserted::New
            }
        };
        if outcome == Inserted::New {
            self.pq.notify_new_arrival();
        }
        Ok(outcome)
    }

    /// Discards the reservation.
    pub fn abort(mut self) {
        self.abort_inner();
    }

    fn abort_inner(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        let Ok(_flk) = self.pq.mapped.lock(true) else {
            return;
        };
        let _g = self.pq.write_state();
        // SAFETY: exclusive lock held.
        let h = unsafe { self.pq.header_mut() };
        let r = unsafe { self.pq.record_mut(self.slot) };
        if r.state == REC_RESERVED {
            r.state = REC_DEAD;
            h.reserve_count -= 1;
        }
    }
}

impl Drop for Region<'_> {
    fn drop(&mut self) {
        self.abort_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{DataProduct, FeedType};

    fn tmp_pq(slots: u64, bytes: u64) -> (tempfile::TempDir, Pq) {
        let dir = tempfile::tempdir().unwrap();
        let pq = Pq::create(&dir.path().join("pq.bin"), slots, bytes, 0o600).unwrap();
        (dir, pq)
    }

    fn product(n: u32, size: usize) -> DataProduct {
        let data: Vec<u8> = (0..size).map(|i| ((i + n as usize) % 256) as u8).collect();
        DataProduct::new("test.host", FeedType::EXP, n, format!("prod {n}"), data)
    }

    #[test]
    fn insert_then_find_round_trips() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        let p = product(1, 1000);
        assert_eq!(pq.insert(&p).unwrap(), Inserted::New);
        let got = pq.find_by_signature(&p.info.signature).unwrap().unwrap();
        assert_eq!(got.info, p.info);
        assert_eq!(got.data, p.data);
    }

    #[test]
    fn duplicate_insert_is_observable_noop() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        let p = product(1, 100);
        assert_eq!(pq.insert(&p).unwrap(), Inserted::New);
        assert_eq!(pq.insert(&p).unwrap(), Inserted::Duplicate);
        let stats = pq.stats().unwrap();
        assert_eq!(stats.n_products, 1);
        assert_eq!(stats.dup_count, 1);
    }

    #[test]
    fn oversize_insert_is_too_big_without_eviction() {
        let (_d, pq) = tmp_pq(8, 4096);
        pq.insert(&product(1, 100)).unwrap();
        let err = pq.insert(&product(2, 5000)).unwrap_err();
        assert!(matches!(err, PqError::TooBig { .. }));
        assert_eq!(pq.stats().unwrap().n_products, 1);
    }

    #[test]
    fn zero_length_product_round_trips() {
        let (_d, pq) = tmp_pq(8, 4096);
        let p = DataProduct::new("test.host", FeedType::EXP, 9, "empty", Vec::new());
        assert_eq!(pq.insert(&p).unwrap(), Inserted::New);
        let got = pq.find_by_signature(&p.info.signature).unwrap().unwrap();
        assert!(got.data.is_empty());
        assert_eq!(got.info.size, 0);
    }

    #[test]
    fn slot_capacity_evicts_fifo() {
        let (_d, pq) = tmp_pq(4, 1 << 20);
        let prods: Vec<_> = (0..6).map(|n| product(n, 128)).collect();
        for p in &prods {
            pq.insert(p).unwrap();
        }
        // 0 and 1 evicted, 2..=5 live.
        assert!(pq.find_by_signature(&prods[0].info.signature).unwrap().is_none());
        assert!(pq.find_by_signature(&prods[1].info.signature).unwrap().is_none());
        for p in &prods[2..] {
            assert!(pq.find_by_signature(&p.info.signature).unwrap().is_some());
        }
        let stats = pq.stats().unwrap();
        assert_eq!(stats.n_products, 4);
        assert_eq!(stats.evict_count, 2);
    }

    #[test]
    fn data_capacity_evicts_and_wraps() {
        // Arena of 1000 bytes, products of 300: the fourth insert must
        // wrap and evict.
        let (_d, pq) = tmp_pq(64, 1000);
        let mut sigs = Vec::new();
        for n in 0..10 {
            let p = product(n, 300);
            sigs.push(p.info.signature);
            pq.insert(&p).unwrap();
            let stats = pq.stats().unwrap();
            assert!(stats.n_bytes_used <= 1000, "used {} at n={n}", stats.n_bytes_used);
        }
        // The most recent product always survives.
        assert!(pq.find_by_signature(&sigs[9]).unwrap().is_some());
        assert!(pq.find_by_signature(&sigs[0]).unwrap().is_none());
    }

    #[test]
    fn sequence_visits_arrival_order() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        for n in 0..3 {
            pq.insert(&product(n, 64)).unwrap();
        }
        let mut seen = Vec::new();
        loop {
            let out = pq
                .sequence(CursorMode::Gt, &ProductClass::everything(), |info, data| {
                    assert_eq!(data.len() as u64, info.size);
                    seen.push(info.seqno);
                })
                .unwrap();
            if out == Seq::End {
                break;
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn sequence_ge_revisits_cursor_product() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        pq.insert(&product(7, 64)).unwrap();
        let mut count = 0;
        pq.sequence(CursorMode::Gt, &ProductClass::everything(), |_, _| count += 1)
            .unwrap();
        pq.sequence(CursorMode::Ge, &ProductClass::everything(), |_, _| count += 1)
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn sequence_filters_by_class() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        pq.insert(&DataProduct::new("h", FeedType::HDS, 0, "SDUS53 KARX", vec![1]))
            .unwrap();
        pq.insert(&DataProduct::new("h", FeedType::EXP, 1, "EXP DATA", vec![2]))
            .unwrap();
        let class = ProductClass::for_feed(FeedType::EXP);
        let mut seen = Vec::new();
        while pq
            .sequence(CursorMode::Gt, &class, |info, _| seen.push(info.seqno))
            .unwrap()
            == Seq::Advanced
        {}
        assert_eq!(seen, vec![1]);
    }

    #[test]
    fn reserve_commit_publishes() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
        let mut region = pq.reserve(512).unwrap();
        assert_eq!(pq.pqe_count().unwrap(), 1);
        region.write(&payload[..200]).unwrap();
        region.write(&payload[200..]).unwrap();
        let info = ProductInfo {
            signature: Signature::digest(&payload),
            arrival: SystemTime::now(),
            origin: "asm.host".into(),
            feed: FeedType::NIMAGE,
            seqno: 42,
            ident: "TIGE01 KNES".into(),
            size: payload.len() as u64,
        };
        assert_eq!(region.commit(&info).unwrap(), Inserted::New);
        assert_eq!(pq.pqe_count().unwrap(), 0);
        let got = pq.find_by_signature(&info.signature).unwrap().unwrap();
        assert_eq!(got.data, payload);
    }

    #[test]
    fn dropped_region_aborts() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        {
            let mut region = pq.reserve(100).unwrap();
            region.write(&[1, 2, 3]).unwrap();
        }
        assert_eq!(pq.pqe_count().unwrap(), 0);
        assert_eq!(pq.stats().unwrap().n_products, 0);
        // The dead extent is reclaimed by later insertions.
        for n in 0..20 {
            pq.insert(&product(n, 1000)).unwrap();
        }
        assert!(pq.stats().unwrap().n_bytes_used <= 1 << 16);
    }

    #[test]
    fn commit_of_duplicate_signature_is_duplicate() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        let p = product(3, 64);
        pq.insert(&p).unwrap();
        let mut region = pq.reserve(64).unwrap();
        region.write(&p.data).unwrap();
        assert_eq!(region.commit(&p.info).unwrap(), Inserted::Duplicate);
        assert_eq!(pq.stats().unwrap().n_products, 1);
    }

    #[test]
    fn delete_by_signature_removes_one() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        let p = product(5, 64);
        pq.insert(&p).unwrap();
        assert!(pq.delete_by_signature(&p.info.signature).unwrap());
        assert!(!pq.delete_by_signature(&p.info.signature).unwrap());
        assert!(pq.find_by_signature(&p.info.signature).unwrap().is_none());
        assert_eq!(pq.stats().unwrap().n_products, 0);
    }

    #[test]
    fn reopen_preserves_products() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pq.bin");
        let p = product(1, 2048);
        {
            let pq = Pq::create(&path, 16, 1 << 16, 0o600).unwrap();
            pq.insert(&p).unwrap();
            pq.close().unwrap();
        }
        let pq = Pq::open(&path, OpenMode::ReadWrite).unwrap();
        let got = pq.find_by_signature(&p.info.signature).unwrap().unwrap();
        assert_eq!(got.data, p.data);
        assert_eq!(pq.stats().unwrap().n_products, 1);
    }

    #[test]
    fn open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, vec![0xAA; 8192]).unwrap();
        assert!(matches!(
            Pq::open(&path, OpenMode::ReadWrite),
            Err(PqError::Corrupt(_))
        ));
    }

    #[test]
    fn suspend_wakes_on_insert() {
        use std::sync::Arc;
        let (_d, pq) = tmp_pq(8, 1 << 16);
        let pq = Arc::new(pq);
        let waiter = {
            let pq = Arc::clone(&pq);
            std::thread::spawn(move || pq.suspend_and_unblock(Duration::from_secs(30)))
        };
        // The broadcast is edge-triggered, so keep inserting until the
        // waiter observes one.
        let mut n = 0;
        while !waiter.is_finished() {
            pq.insert(&product(n, 16)).unwrap();
            n += 1;
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(waiter.join().unwrap(), WakeReason::NewProduct);
    }

    #[test]
    fn suspend_times_out_and_unblocks() {
        let (_d, pq) = tmp_pq(8, 1 << 16);
        assert_eq!(
            pq.suspend_and_unblock(Duration::from_millis(10)),
            WakeReason::Timeout
        );
        let pq = std::sync::Arc::new(pq);
        let unblocker = pq.unblocker();
        let waiter = {
            let pq = std::sync::Arc::clone(&pq);
            std::thread::spawn(move || pq.suspend_and_unblock(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(50));
        unblocker.unblock();
        assert_eq!(waiter.join().unwrap(), WakeReason::Interrupted);
    }
}
