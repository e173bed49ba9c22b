//! Versioned slot storage shared by the SPSC and MPSC rings.
//!
//! A slot stores its payload together with the sequence number of the write
//! that produced it; the pair is always written and snapshotted as one unit.
//! A separate array of region version counters tells the consumer whether a
//! writer is currently inside a region, so a snapshot taken concurrently with
//! a write is thrown away and retried.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::Record;

/// Alignment for slots, version counters and cursors: two cache lines, so
/// the adjacent-line prefetcher cannot drag a neighbor into the same
/// coherence unit.
pub(crate) const CACHE_LINE_PAIR: usize = 128;

/// The plain-memory image of one slot.
///
/// `seq == 0` means the slot has never been written; the first write to slot
/// `i` stores `seq = i + 1`, and each lap adds the ring length. The record
/// bytes are meaningful only when the sequence number says so.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct Entry<T: Record> {
    pub(crate) record: MaybeUninit<T>,
    pub(crate) seq: u64,
}

impl<T: Record> Entry<T> {
    /// Reports whether this entry is fresh for a consumer at `cursor`, i.e.
    /// whether the stored sequence number exceeds the cursor.
    ///
    /// Branchless: `cursor - seq` underflows exactly when `seq > cursor`, so
    /// the sign bit of the wrapped difference is the answer.
    #[inline]
    pub(crate) fn is_fresh(&self, cursor: u64) -> bool {
        (cursor.wrapping_sub(self.seq) >> 63) == 1
    }
}

/// One ring slot: an [`Entry`] behind an `UnsafeCell`, padded so neighboring
/// slots never share a cache-line pair.
#[repr(C)]
#[repr(align(128))]
pub(crate) struct VersionedSlot<T: Record> {
    entry: UnsafeCell<Entry<T>>,
}

impl<T: Record> VersionedSlot<T> {
    /// A never-written slot: sequence number 0, record bytes undefined.
    pub(crate) const fn new() -> Self {
        Self {
            entry: UnsafeCell::new(Entry {
                record: MaybeUninit::uninit(),
                seq: 0,
            }),
        }
    }

    /// Stores `record` with sequence number `seq` as a single whole-entry write.
    ///
    /// # Safety
    ///
    /// The caller must hold the write claim for this slot's region (the SPSC
    /// parity window or an MPSC refcount claim), so that no second writer
    /// stores to this slot concurrently. Concurrent consumer snapshots are
    /// allowed; they are invalidated by the region's version counter.
    #[inline]
    pub(crate) unsafe fn publish(&self, record: &T, seq: u64) {
        let entry = Entry {
            record: MaybeUninit::new(*record),
            seq,
        };
        // SAFETY: exclusive writer per the claim above; whole-entry store.
        unsafe { self.entry.get().write(entry) };
    }

    /// Copies the whole entry out, possibly racing an in-progress write.
    ///
    /// # Safety
    ///
    /// The returned bytes may be torn. The caller must validate against the
    /// region's version counter (quiescent across the snapshot) before
    /// trusting either field, and must not `assume_init` the record unless
    /// the sequence number proves a completed write.
    #[inline]
    pub(crate) unsafe fn snapshot(&self) -> Entry<T> {
        // Volatile keeps the compiler from eliding or splitting the racing
        // copy; the fence in the caller orders it against the counter probe.
        unsafe { self.entry.get().read_volatile() }
    }
}

// SAFETY: VersionedSlot is shared between producer and consumer threads. All
// mutation goes through `publish`, whose caller holds the region claim, and
// all reads go through `snapshot`, which is validated by the version counter
// protocol. T: Record already requires Send + Sync.
unsafe impl<T: Record> Send for VersionedSlot<T> {}
unsafe impl<T: Record> Sync for VersionedSlot<T> {}

/// Per-region write-activity counter, padded to a cache-line pair.
///
/// The same atomic serves two disciplines:
///
/// - **Parity (SPSC)**: the sole writer increments once before and once after
///   the slot store, so an odd value means "write in progress". Both ends use
///   the same add instruction.
/// - **Refcount (MPSC)**: writers increment on claim and decrement on release
///   or retry-abandonment, so a non-zero value means "at least one writer is
///   inside the region".
#[repr(C)]
#[repr(align(128))]
pub(crate) struct VersionCounter(AtomicU64);

// The align attributes above must agree with the named constant.
const _: () = assert!(std::mem::align_of::<VersionCounter>() == CACHE_LINE_PAIR);


impl VersionCounter {
    pub(crate) const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Parity discipline: marks the region busy and returns the new (odd)
    /// value. The acquire on the RMW keeps the subsequent slot store from
    /// being hoisted above it.
    #[inline]
    pub(crate) fn begin_write(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Acquire).wrapping_add(1)
    }

    /// Parity discipline: marks the region quiescent again and publishes every
    /// store made inside the window.
    #[inline]
    pub(crate) fn end_write(&self) {
        self.0.fetch_add(1, Ordering::Release);
    }

    /// Refcount discipline: registers a writer and returns the new (positive)
    /// count. Same ordering role as [`begin_write`](Self::begin_write).
    #[inline]
    pub(crate) fn claim(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Acquire).wrapping_add(1)
    }

    /// Refcount discipline: retracts a claim that will not publish anything
    /// (the CAS retry moved to another region). No store to order, so relaxed.
    #[inline]
    pub(crate) fn abandon(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Refcount discipline: retracts a claim after the slot store, publishing
    /// it to any consumer that later observes the region quiescent.
    #[inline]
    pub(crate) fn release(&self) {
        self.0.fetch_sub(1, Ordering::Release);
    }

    /// Parity probe: true while the sole writer is inside the region.
    #[inline]
    pub(crate) fn parity_busy(&self) -> bool {
        self.0.load(Ordering::Acquire) & 1 == 1
    }

    /// Refcount probe: true while any writer holds a claim on the region.
    #[inline]
    pub(crate) fn refcount_busy(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_and_counter_are_cache_line_pair_aligned() {
        assert_eq!(std::mem::align_of::<VersionCounter>(), CACHE_LINE_PAIR);
        assert_eq!(std::mem::size_of::<VersionCounter>(), CACHE_LINE_PAIR);
        assert_eq!(std::mem::align_of::<VersionedSlot<u64>>(), CACHE_LINE_PAIR);
        assert_eq!(std::mem::size_of::<VersionedSlot<u64>>(), CACHE_LINE_PAIR);
    }

    #[test]
    fn oversized_records_keep_the_alignment() {
        // A record bigger than the pad unit still starts every slot on a
        // cache-line-pair boundary.
        type Big = [u64; 40];
        assert_eq!(std::mem::align_of::<VersionedSlot<Big>>(), CACHE_LINE_PAIR);
        assert_eq!(std::mem::size_of::<VersionedSlot<Big>>() % CACHE_LINE_PAIR, 0);
    }

    #[test]
    fn freshness_is_a_strict_sequence_comparison() {
        let entry = Entry::<u64> {
            record: MaybeUninit::new(7),
            seq: 5,
        };
        assert!(entry.is_fresh(0));
        assert!(entry.is_fresh(4));
        assert!(!entry.is_fresh(5));
        assert!(!entry.is_fresh(6));

        // seq == 0 (never written) is stale for every cursor.
        let blank = Entry::<u64> {
            record: MaybeUninit::uninit(),
            seq: 0,
        };
        assert!(!blank.is_fresh(0));
        assert!(!blank.is_fresh(u64::MAX));
    }

    #[test]
    fn parity_protocol_alternates() {
        let v = VersionCounter::new();
        assert!(!v.parity_busy());

        assert_eq!(v.begin_write(), 1);
        assert!(v.parity_busy());
        v.end_write();
        assert!(!v.parity_busy());

        assert_eq!(v.begin_write(), 3);
        assert!(v.parity_busy());
        v.end_write();
        assert!(!v.parity_busy());
    }

    #[test]
    fn refcount_protocol_tracks_claims() {
        let v = VersionCounter::new();
        assert!(!v.refcount_busy());

        assert_eq!(v.claim(), 1);
        assert_eq!(v.claim(), 2);
        assert!(v.refcount_busy());

        v.abandon();
        assert!(v.refcount_busy());
        v.release();
        assert!(!v.refcount_busy());
    }

    #[test]
    fn publish_then_snapshot_round_trips() {
        let slot = VersionedSlot::<u64>::new();
        // SAFETY: single-threaded test; no concurrent writer.
        let blank = unsafe { slot.snapshot() };
        assert_eq!(blank.seq, 0);

        unsafe { slot.publish(&42, 9) };
        let entry = unsafe { slot.snapshot() };
        assert_eq!(entry.seq, 9);
        assert_eq!(unsafe { entry.record.assume_init() }, 42);
    }
}
