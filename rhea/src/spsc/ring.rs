//! Core lock-free SPSC versioned ring algorithm.
//!
//! The writer is wait-free: it never inspects consumer progress and never
//! fails. A wrapped ring overwrites its oldest slots, and the consumer sorts
//! fresh records from leftovers of earlier laps with the per-slot sequence
//! number. Tearing is excluded by the region version counter: the writer
//! holds the counter odd for the duration of each slot store, and the reader
//! retries any snapshot taken while the counter was odd.
//!
//! # Safety
//!
//! The types here have unsafe APIs because the caller must uphold the SPSC
//! invariant: exactly one producer and one consumer, with no concurrent
//! access to either role.

use std::cell::UnsafeCell;
use std::ptr::addr_of_mut;
use std::sync::atomic::{Ordering, fence};

use crate::Record;
use crate::slot::{VersionCounter, VersionedSlot};

/// Interior-mutable cell owned exclusively by the producer.
///
/// The wrapper exists so the exclusive-ownership claim is visible in the
/// type, not just in a comment at every access site.
#[repr(transparent)]
pub(crate) struct ProducerCell<T>(UnsafeCell<T>);

impl<T> ProducerCell<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    pub(crate) const fn get(&self) -> &UnsafeCell<T> {
        &self.0
    }
}

// SAFETY: only the single producer dereferences the cell, per the module
// contract; other threads never touch it.
unsafe impl<T: Send> Send for ProducerCell<T> {}
unsafe impl<T: Send> Sync for ProducerCell<T> {}

/// Producer-side state: the write cursor, alone on its cache-line pair.
///
/// The cursor doubles as the next sequence number to assign (`cursor + 1` is
/// stored into the slot), so it is never wrapped to the slot count.
#[repr(C)]
#[repr(align(128))]
pub(crate) struct WriterState {
    cursor: ProducerCell<u64>,
}

impl WriterState {
    pub(crate) const fn new() -> Self {
        Self {
            cursor: ProducerCell::new(0),
        }
    }
}

/// Core SPSC versioned ring.
///
/// `LEN` is the slot count, `GRAN` the number of region version counters;
/// both must be powers of two with `GRAN <= LEN`. Sequence number `s` maps to
/// slot `s & (LEN - 1)` and region `s & (GRAN - 1)`; because `GRAN` divides
/// `LEN`, a slot always probes the same counter its writer incremented.
#[repr(C)]
pub(crate) struct Ring<T: Record, const LEN: usize, const GRAN: usize> {
    writer: WriterState,
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
            writer: WriterState::new(),
            versions: std::array::from_fn(|_| VersionCounter::new()),
            slots: std::array::from_fn(|_| VersionedSlot::new()),
        }
    }

    /// Initializes a ring in place, field by field, without constructing a
    /// value on the stack first. Used for rings living in shared memory.
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
            addr_of_mut!((*ptr).writer).write(WriterState::new());
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

    /// Writes a record into the next slot. Wait-free; never fails. A full
    /// lap overwrites unread slots without signaling.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread/process calls this method (single producer)
    /// - The ring has been properly initialized
    #[inline]
    pub(crate) unsafe fn push(&self, record: &T) {
        // SAFETY: producer-owned cursor cell.
        let cursor = unsafe { *self.writer.cursor.get().get() };
        let version = &self.versions[(cursor & Self::REGION_MASK) as usize];

        // Odd parity marks the region busy; the acquire RMW inside pins the
        // slot store below the increment.
        let parity = version.begin_write();
        debug_assert!(parity & 1 == 1);

        // SAFETY: the parity window above is this slot's write claim.
        unsafe {
            self.slots[(cursor & Self::SLOT_MASK) as usize].publish(record, cursor + 1);
        }

        // SAFETY: producer-owned cursor cell; plain store, nobody else reads it.
        unsafe {
            *self.writer.cursor.get().get() = cursor + 1;
        }

        // Back to even; the release publishes the slot store.
        version.end_write();
    }

    /// Reads the slot at `cursor`, spinning only while the producer is
    /// mid-write in that slot's region.
    ///
    /// Returns `None` when the slot is stale (sequence number <= `cursor`):
    /// either never written or a leftover from an earlier lap. The caller
    /// advances its cursor by one exactly when `Some` is returned.
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
            // SAFETY: the snapshot may race the writer; it is discarded
            // unless the parity probe below says the region was quiescent.
            let entry = unsafe { slot.snapshot() };
            // The snapshot's loads must complete before the parity probe.
            fence(Ordering::Acquire);
            if !version.parity_busy() {
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

// SAFETY: Ring is shared by reference between the producer and consumer
// threads. Slot access is governed by the version counter protocol, the
// cursor cell by the single-producer contract.
unsafe impl<T: Record, const LEN: usize, const GRAN: usize> Send for Ring<T, LEN, GRAN> {}
unsafe impl<T: Record, const LEN: usize, const GRAN: usize> Sync for Ring<T, LEN, GRAN> {}
