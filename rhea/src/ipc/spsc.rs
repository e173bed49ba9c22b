//! Lock-free SPSC overwrite channel over POSIX shared memory.
//!
//! The heap channel from [`crate::sync::spsc`], relocated into a `shm_open`
//! mapping so producer and consumer can live in different processes. The
//! writer stays wait-free and infallible; a lapped consumer loses the
//! overwritten records.
//!
//! # Creator vs Opener
//!
//! Either end may create the object; the other opens it. The creator unlinks
//! the name on drop, openers only unmap:
//!
//! ```no_run
//! use rhea::ipc::spsc::{Consumer, Producer};
//!
//! // Daemon publishes telemetry into a ring it owns
//! let producer = Producer::<u64, 1024, 64, _>::create("/telemetry")?;
//!
//! // An observer process attaches
//! let consumer = Consumer::<u64, 1024, 64, _>::open("/telemetry")?;
//!
//! producer.push(42);
//! assert_eq!(consumer.pop(), Some(42));
//! # Ok::<(), rhea::ipc::shmem::ShmError>(())
//! ```
//!
//! # Memory Layout
//!
//! ```text
//! Ring in Shared Memory (/dev/shm):
//! ┌──────────────────────────────────────────┐
//! │ InitMarker (128-byte aligned)            │
//! │  - magic: AtomicU64                      │
//! ├──────────────────────────────────────────┤
//! │ WriterState (128-byte aligned)           │
//! │  - cursor: u64 (producer-owned)          │
//! ├──────────────────────────────────────────┤
//! │ [VersionCounter; GRAN] (128 bytes each)  │
//! ├──────────────────────────────────────────┤
//! │ [VersionedSlot<T>; LEN] (128-byte pairs) │
//! ├──────────────────────────────────────────┤
//! │ Tail padding (128 bytes)                 │
//! └──────────────────────────────────────────┘
//! ```
//!
//! The consumer's read cursor is process-local, not part of the mapping: a
//! consumer that reopens the ring starts at cursor 0 and observes the
//! current lap as fresh, which is the intended behavior for a feed where
//! only the newest records matter.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};

use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode, ShmSafe};
use crate::Record;
use crate::spsc::ring::Ring;
use crate::trace;

const INIT_MAGIC: u64 = 0x5248_4541_5350_5343; // "RHEASPSC" in ASCII
const INIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Readiness flag for the cross-process initialization handshake.
#[repr(C)]
#[repr(align(128))]
struct InitMarker(AtomicU64);

/// Shared-memory layout: readiness marker, the core ring, and tail padding
/// against false sharing with whatever the allocator maps next.
#[repr(C)]
struct IpcRing<T: Record, const LEN: usize, const GRAN: usize> {
    init: InitMarker,
    ring: Ring<T, LEN, GRAN>,
    _padding_tail: [u8; 128],
}

// SAFETY: repr(C); the marker is an atomic, the ring is atomics plus
// protocol-guarded slot cells, the padding is inert bytes. Nothing holds a
// process-local pointer and nothing relies on Drop.
unsafe impl<T: Record, const LEN: usize, const GRAN: usize> ShmSafe for IpcRing<T, LEN, GRAN> {}

impl<T: Record, const LEN: usize, const GRAN: usize> IpcRing<T, LEN, GRAN> {
    /// Initializes the mapping in place and publishes readiness last.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null, aligned, writable for `size_of::<Self>()`
    /// bytes, and exclusive during initialization.
    unsafe fn init_shared(ptr: *mut Self) {
        // SAFETY: caller guarantees validity and exclusivity.
        unsafe {
            addr_of_mut!((*ptr).init).write(InitMarker(AtomicU64::new(0)));
            Ring::init_shared(addr_of_mut!((*ptr).ring));
            // Release publishes every initialization store to openers that
            // acquire-poll the marker.
            (*ptr).init.0.store(INIT_MAGIC, Ordering::Release);
        }
    }

    /// Polls the readiness marker until the creator finishes or the timeout
    /// expires.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a mapped object of this type (initialized or not)
    /// that stays mapped for the duration of the call.
    unsafe fn wait_for_init(ptr: *const Self, timeout: std::time::Duration) -> bool {
        let start = std::time::Instant::now();
        loop {
            // SAFETY: reading an atomic is valid for any bit pattern, so an
            // unfinished initialization is observable but harmless.
            if unsafe { (*ptr).init.0.load(Ordering::Acquire) } == INIT_MAGIC {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            std::hint::spin_loop();
        }
    }
}

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the shared-memory ring.
///
/// `Send` but not `Sync`, and not `Clone`: one producer per process is
/// enforced in the type system. The type system cannot see other processes,
/// though—deployments must ensure only one process opens the producer end.
pub struct Producer<T: Record, const LEN: usize, const GRAN: usize, Mode: ShmMode> {
    shm: Shm<IpcRing<T, LEN, GRAN>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: Record, const LEN: usize, const GRAN: usize> Producer<T, LEN, GRAN, Creator> {
    /// Creates the shared-memory object and returns the producer end.
    ///
    /// # Errors
    ///
    /// Fails when the object already exists, permissions are lacking, or
    /// system limits are hit.
    pub fn create(path: &str) -> Result<Self, ShmError> {
        let shm = Shm::<IpcRing<T, LEN, GRAN>, Creator>::create(path, |ptr| unsafe {
            IpcRing::init_shared(ptr);
        })?;
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: Record, const LEN: usize, const GRAN: usize> Producer<T, LEN, GRAN, Opener> {
    /// Opens an existing ring as the producer end, waiting up to one second
    /// for the creator to finish initialization.
    ///
    /// # Errors
    ///
    /// Fails when the object is missing, sized differently (parameter
    /// mismatch between the processes), or never becomes initialized.
    pub fn open(path: &str) -> Result<Self, ShmError> {
        let shm = Shm::<IpcRing<T, LEN, GRAN>, Opener>::open(path)?;
        // SAFETY: Shm::open mapped exactly size_of::<IpcRing>() bytes that
        // stay valid for shm's lifetime.
        if !unsafe { IpcRing::wait_for_init(&raw const *shm, INIT_TIMEOUT) } {
            trace::warn!(%path, "ring initialization timed out");
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            });
        }
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: Record, const LEN: usize, const GRAN: usize, Mode: ShmMode> Producer<T, LEN, GRAN, Mode> {
    /// Writes a record into the ring. Wait-free and infallible; a full lap
    /// overwrites the oldest unread slot silently.
    #[inline]
    pub fn push(&self, record: T) {
        // SAFETY: unique producer per the handle contract; the ring was
        // initialized before the handle existed.
        unsafe { self.shm.ring.push(&record) }
    }
}

/// Read end of the shared-memory ring.
///
/// Holds the process-local read cursor; `Send` but not `Sync`, not `Clone`.
/// As with [`Producer`], single-consumer across processes is a deployment
/// obligation.
pub struct Consumer<T: Record, const LEN: usize, const GRAN: usize, Mode: ShmMode> {
    shm: Shm<IpcRing<T, LEN, GRAN>, Mode>,
    cursor: Cell<u64>,
    _unsync: PhantomUnsync,
}

impl<T: Record, const LEN: usize, const GRAN: usize> Consumer<T, LEN, GRAN, Creator> {
    /// Creates the shared-memory object and returns the consumer end.
    ///
    /// Useful when the consuming daemon owns the ring and producers attach
    /// to it.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Producer::create`].
    pub fn create(path: &str) -> Result<Self, ShmError> {
        let shm = Shm::<IpcRing<T, LEN, GRAN>, Creator>::create(path, |ptr| unsafe {
            IpcRing::init_shared(ptr);
        })?;
        Ok(Self {
            shm,
            cursor: Cell::new(0),
            _unsync: PhantomData,
        })
    }
}

impl<T: Record, const LEN: usize, const GRAN: usize> Consumer<T, LEN, GRAN, Opener> {
    /// Opens an existing ring as the consumer end, waiting up to one second
    /// for the creator to finish initialization.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`Producer::open`].
    pub fn open(path: &str) -> Result<Self, ShmError> {
        let shm = Shm::<IpcRing<T, LEN, GRAN>, Opener>::open(path)?;
        // SAFETY: Shm::open mapped exactly size_of::<IpcRing>() bytes that
        // stay valid for shm's lifetime.
        if !unsafe { IpcRing::wait_for_init(&raw const *shm, INIT_TIMEOUT) } {
            trace::warn!(%path, "ring initialization timed out");
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            });
        }
        Ok(Self {
            shm,
            cursor: Cell::new(0),
            _unsync: PhantomData,
        })
    }
}

impl<T: Record, const LEN: usize, const GRAN: usize, Mode: ShmMode> Consumer<T, LEN, GRAN, Mode> {
    /// Attempts to read the next fresh record; `None` leaves the cursor
    /// unmoved. Spins only while the producer is mid-write in the checked
    /// region.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let cursor = self.cursor.get();
        // SAFETY: unique consumer per the handle contract; the ring was
        // initialized before the handle existed.
        let record = unsafe { self.shm.ring.pop(cursor) }?;
        self.cursor.set(cursor + 1);
        Some(record)
    }
}
