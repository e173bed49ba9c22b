//! Lock-free MPSC overwrite channel over POSIX shared memory.
//!
//! Any number of processes (or threads) may hold producer ends of the same
//! ring; slot ownership is decided by a CAS race on the shared cursor.
//! Producers never block and never fail, ordering between concurrent
//! producers follows CAS outcomes, and a lapped consumer loses the
//! overwritten records.
//!
//! # Example
//!
//! ```no_run
//! use rhea::ipc::mpsc::{Consumer, Producer};
//!
//! // The consuming daemon owns the inbox
//! let consumer = Consumer::<u64, 1024, 64, _>::create("/events")?;
//!
//! // Client processes attach as producers - multiple allowed
//! let producer1 = Producer::<u64, 1024, 64, _>::open("/events")?;
//! let producer2 = Producer::<u64, 1024, 64, _>::open("/events")?;
//!
//! producer1.push(1);
//! producer2.push(2);
//!
//! assert!(consumer.pop().is_some());
//! assert!(consumer.pop().is_some());
//! # Ok::<(), rhea::ipc::shmem::ShmError>(())
//! ```
//!
//! The memory layout matches [`crate::ipc::spsc`] except that the cursor is
//! the producers' shared CAS word and the version counters are refcounts
//! instead of parity flags.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicU64, Ordering};

use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode, ShmSafe};
use crate::Record;
use crate::mpsc::ring::Ring;
use crate::trace;

const INIT_MAGIC: u64 = 0x5248_4541_4D50_5343; // "RHEAMPSC" in ASCII
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

// SAFETY: repr(C); the marker and cursor are atomics, the slots are
// protocol-guarded cells, the padding is inert bytes. Nothing holds a
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
/// Unlike the SPSC producer this handle is `Sync`: `push` is safe under any
/// amount of concurrency, so a process may share one producer across threads
/// or open several.
pub struct Producer<T: Record, const LEN: usize, const GRAN: usize, Mode: ShmMode> {
    shm: Shm<IpcRing<T, LEN, GRAN>, Mode>,
}

impl<T: Record, const LEN: usize, const GRAN: usize> Producer<T, LEN, GRAN, Creator> {
    /// Creates the shared-memory object and returns a producer end.
    ///
    /// # Errors
    ///
    /// Fails when the object already exists, permissions are lacking, or
    /// system limits are hit.
    pub fn create(path: &str) -> Result<Self, ShmError> {
        let shm = Shm::<IpcRing<T, LEN, GRAN>, Creator>::create(path, |ptr| unsafe {
            IpcRing::init_shared(ptr);
        })?;
        Ok(Self { shm })
    }
}

impl<T: Record, const LEN: usize, const GRAN: usize> Producer<T, LEN, GRAN, Opener> {
    /// Opens an existing ring as a producer end, waiting up to one second
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
        Ok(Self { shm })
    }
}

impl<T: Record, const LEN: usize, const GRAN: usize, Mode: ShmMode> Producer<T, LEN, GRAN, Mode> {
    /// Writes a record into the next claimed slot. Lock-free and infallible;
    /// a full lap overwrites the oldest unread slot silently.
    #[inline]
    pub fn push(&self, record: T) {
        // SAFETY: mpsc push is safe for any number of concurrent producers;
        // the ring was initialized before the handle existed.
        unsafe { self.shm.ring.push(&record) }
    }
}

/// Read end of the shared-memory ring.
///
/// Holds the process-local read cursor; `Send` but not `Sync`, not `Clone`.
/// Single-consumer across processes is a deployment obligation the type
/// system cannot check.
pub struct Consumer<T: Record, const LEN: usize, const GRAN: usize, Mode: ShmMode> {
    shm: Shm<IpcRing<T, LEN, GRAN>, Mode>,
    cursor: Cell<u64>,
    _unsync: PhantomUnsync,
}

impl<T: Record, const LEN: usize, const GRAN: usize> Consumer<T, LEN, GRAN, Creator> {
    /// Creates the shared-memory object and returns the consumer end. The
    /// usual arrangement for an inbox: the consuming daemon owns the ring.
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
    /// unmoved. Spins only while some producer holds a claim on the checked
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
