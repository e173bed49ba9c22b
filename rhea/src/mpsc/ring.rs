//! Core lock-free MPSC versioned ring algorithm.
//!
//! Producers race on a shared cursor with CAS; the winner of a given
//! sequence number owns its slot exclusively. Before attempting the CAS a
//! producer increments the target region's version counter, so a consumer
//! that observes the counter at zero knows no writer is anywhere between
//! claim and release in that region. A producer whose CAS fails and whose
//! retry lands in a different region corrects the speculatively incremented
//! counter on the way.
//!
//! Lock-free, not wait-free: a producer can lose the CAS arbitrarily often
//! under contention, but some producer always makes progress. Ordering
//! between concurrent producers is decided by CAS outcomes, not call order.
//!
//! # Safety
//!
//! Any number of threads may push concurrently. The consumer must be unique,
//! as in the SPSC ring.

use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering, fence};

use crate::Record;
use crate::slot::{VersionCounter, VersionedSlot};

/// The shared producer cursor, alone on its cache-line pair.
///
/// Holds the next sequence number to claim; never wrapped to the slot count,
/// so `next` is also the total number of writes ever claimed.
#[repr(C)]
#[repr(align(128))]
pub(crate) struct CursorState {
    next: AtomicU64,
}

impl CursorState {
    pub(crate) const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }
}

/// Core MPSC versioned ring.
///
/// Same layout discipline as the SPSC ring: `LEN` slots, `GRAN` region
/// counters, both powers of two, `GRAN <= LEN`. The counters are refcounts
/// here rather than parity flags, because several producers can be inside
/// one region at once.
#[repr(C)]
pub(crate) struct Ring<T: Record, const LEN: usize, const GRAN: usize> {
    cursor: CursorState,
    versions: [VersionCounter; GRAN],
    slots: [VersionedSlot<T>; LEN],
}

impl<T: Record, const LEN: usize, const GRAN: usize> Ring<T, LEN, GRAN> {
    const SLOT_MASK: u64 = (LEN as u64) - 1;
    const REGION_MASK: u64 = (GRAN as u64) - 1;

    /// Compile-time parameter validation; referenced from every constructor
    /// so invalid instantiations fail to build.
    pub(crate) const PARAMS_OK: () = {
        assert!(LEN.is_power_of_two(), "slot count must be a power of two");
        assert!(
            GRAN.is_power_of_two(),
            "version granularity must be a power of two"
        );
        assert!(
            GRAN <= LEN,
            "version granularity cannot exceed the slot count"
        );
    };

    /// Creates a zeroed ring: cursor 0, all counters 0, every slot at
    /// sequence number 0 with undefined record bytes.
    pub(crate) fn new() -> Self {
        let () = Self::PARAMS_OK;
        Self {
            cursor: CursorState::new(),
            versions: std::array::from_fn(|_| VersionCounter::new()),
            slots: std::array::from_fn(|_| VersionedSlot::new()),
        }
    }

    /// Initializes a ring in place for shared-memory use.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, aligned for `Self`, writable for
    /// `size_of::<Self>()` bytes, and not aliased during initialization.
    pub(crate) unsafe fn init_shared(ptr: *mut Self) {
        let () = Self::PARAMS_OK;
        // SAFETY: caller guarantees validity and exclusivity; addr_of_mut!
        // writes fields without materializing references to uninit memory.
        unsafe {
            addr_of_mut!((*ptr).cursor).write(CursorState::new());
            let versions = addr_of_mut!((*ptr).versions).cast::<VersionCounter>();
            for i in 0..GRAN {
                versions.add(i).write(VersionCounter::new());
            }
            let slots = addr_of_mut!((*ptr).slots).cast::<VersionedSlot<T>>();
            for i in 0..LEN {
                slots.add(i).write(VersionedSlot::new());
            }
        }
    }

    /// Writes a record into the next claimed slot. Never fails; a full lap
    /// overwrites unread slots without signaling.
    ///
    /// The region counter is incremented *before* the CAS so the claim is
    /// never invisible: from a consumer's point of view, a region with any
    /// producer between claim and release always shows a non-zero counter.
    /// A failed CAS whose retry stays in the same region needs no counter
    /// work at all; one that moves regions decrements the old counter and
    /// increments the new one.
    ///
    /// # Safety
    ///
    /// Caller must ensure the ring has been properly initialized. Any number
    /// of threads may call this concurrently.
    #[inline]
    pub(crate) unsafe fn push(&self, record: &T) {
        let mut seq = self.cursor.next.load(Ordering::Relaxed);
        let mut held = &self.versions[(seq & Self::REGION_MASK) as usize];
        let claimed = held.claim();
        debug_assert!(claimed > 0);

        loop {
            // Release on success orders the claim increment before the new
            // cursor value becomes visible; failure needs no ordering, the
            // observed value just seeds the retry.
            match self.cursor.next.compare_exchange_weak(
                seq,
                seq + 1,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => {
                    seq = observed;
                    let next = &self.versions[(seq & Self::REGION_MASK) as usize];
                    if !std::ptr::eq(next, held) {
                        // The retry moved regions: correct the stale claim
                        // before taking the new one.
                        held.abandon();
                        let claimed = next.claim();
                        debug_assert!(claimed > 0);
                        held = next;
                    }
                }
            }
        }

        // SAFETY: winning the CAS makes this producer the sole owner of
        // sequence number `seq`; the claim on `held` covers the store.
        unsafe {
            self.slots[(seq & Self::SLOT_MASK) as usize].publish(record, seq + 1);
        }

        // The release decrement publishes the slot store; `held` is by
        // construction the counter for `seq`'s region.
        held.release();
    }

    /// Reads the slot at `cursor`, spinning only while some producer holds a
    /// claim on that slot's region.
    ///
    /// Returns `None` when the slot is stale. The caller advances its cursor
    /// by one exactly when `Some` is returned.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread/process calls this method (single consumer)
    /// - The ring has been properly initialized
    #[inline]
    pub(crate) unsafe fn pop(&self, cursor: u64) -> Option<T> {
        let version = &self.versions[(cursor & Self::REGION_MASK) as usize];
        let slot = &self.slots[(cursor & Self::SLOT_MASK) as usize];

        let entry = loop {
            // SAFETY: the snapshot may race a writer; it is discarded unless
            // the refcount probe below says the region was quiescent.
            let entry = unsafe { slot.snapshot() };
            // The snapshot's loads must complete before the refcount probe.
            fence(Ordering::Acquire);
            if !version.refcount_busy() {
                break entry;
            }
            std::hint::spin_loop();
        };

        if !entry.is_fresh(cursor) {
            return None;
        }
        // SAFETY: a fresh sequence number proves a completed write stored
        // these record bytes.
        Some(unsafe { entry.record.assume_init() })
    }
}

// SAFETY: Ring is shared by reference between producer threads and the
// consumer thread. Producers coordinate through the CAS cursor and region
// refcounts; the consumer validates every snapshot against the refcounts.
unsafe impl<T: Record, const LEN: usize, const GRAN: usize> Send for Ring<T, LEN, GRAN> {}
unsafe impl<T: Record, const LEN: usize, const GRAN: usize> Sync for Ring<T, LEN, GRAN> {}
