//! Lock-free MPSC overwrite channel for in-process communication.
//!
//! Any number of producers share one ring; the consumer is unique. Producers
//! never block and never fail—slot ownership is decided by a CAS race, so
//! ordering between concurrent producers follows CAS outcomes, not call
//! order, and a lapped consumer loses the overwritten records.
//!
//! # Example
//!
//! ```
//! use rhea::sync::mpsc;
//!
//! let (producer, consumer) = mpsc::channel::<u64, 1024, 64>();
//! let second = producer.clone();
//!
//! producer.push(1);
//! second.push(2);
//!
//! assert!(consumer.pop().is_some());
//! assert!(consumer.pop().is_some());
//! assert_eq!(consumer.pop(), None);
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use minstant::Instant;

use crate::Record;
use crate::mpsc::ring::Ring;
use crate::sync::Timeout;

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the channel.
///
/// Clone one per producer thread, or share a reference—`push` is safe under
/// any amount of concurrency.
pub struct Producer<T: Record, const LEN: usize, const GRAN: usize> {
    ring: Arc<Ring<T, LEN, GRAN>>,
}

impl<T: Record, const LEN: usize, const GRAN: usize> Clone for Producer<T, LEN, GRAN> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

/// Read end of the channel.
///
/// Only one consumer exists per channel; the read cursor lives in this
/// handle, so `Consumer` is deliberately neither `Clone` nor `Sync`.
pub struct Consumer<T: Record, const LEN: usize, const GRAN: usize> {
    ring: Arc<Ring<T, LEN, GRAN>>,
    cursor: Cell<u64>,
    _unsync: PhantomUnsync,
}

/// Creates a new MPSC overwrite channel.
///
/// Parameter constraints are the same as for [`crate::sync::spsc::channel`]:
/// `LEN` and `GRAN` powers of two, `GRAN <= LEN`, checked at compile time.
#[must_use]
pub fn channel<T: Record, const LEN: usize, const GRAN: usize>()
-> (Producer<T, LEN, GRAN>, Consumer<T, LEN, GRAN>) {
    let ring = Arc::new(Ring::new());

    let producer = Producer {
        ring: Arc::clone(&ring),
    };

    let consumer = Consumer {
        ring,
        cursor: Cell::new(0),
        _unsync: PhantomData,
    };

    (producer, consumer)
}

impl<T: Record, const LEN: usize, const GRAN: usize> Producer<T, LEN, GRAN> {
    /// Writes a record into the next claimed slot. Lock-free and infallible;
    /// under contention a push may retry the claim but some producer always
    /// completes.
    #[inline]
    pub fn push(&self, record: T) {
        // SAFETY: mpsc push is safe for any number of concurrent producers;
        // the ring was initialized in channel().
        unsafe { self.ring.push(&record) }
    }
}

impl<T: Record, const LEN: usize, const GRAN: usize> Consumer<T, LEN, GRAN> {
    /// Attempts to read the next fresh record.
    ///
    /// Returns `None` when nothing newer than the read cursor is available;
    /// the cursor does not move in that case. Spins only while a producer
    /// holds a claim on the checked region.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let cursor = self.cursor.get();
        // SAFETY: this handle is the unique consumer (not Clone, not Sync),
        // and the ring was initialized in channel().
        let record = unsafe { self.ring.pop(cursor) }?;
        self.cursor.set(cursor + 1);
        Some(record)
    }

    /// Spins until a fresh record arrives, then pops it.
    ///
    /// Returns `None` on timeout.
    #[inline]
    #[must_use]
    pub fn pop_blocking(&self, timeout: Timeout) -> Option<T> {
        let deadline = match timeout {
            Timeout::Infinite => None,
            Timeout::Duration(d) => Some(Instant::now() + d),
        };
        loop {
            if let Some(record) = self.pop() {
                return Some(record);
            }
            if let Some(dl) = deadline
                && Instant::now() > dl
            {
                return None;
            }
            std::hint::spin_loop();
        }
    }
}
