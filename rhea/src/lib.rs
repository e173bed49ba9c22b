//! Lock-free versioned ring buffers for single- and multi-producer,
//! single-consumer data exchange.
//!
//! The producer side never blocks and never fails: a ring that wraps simply
//! overwrites its oldest slots, and the consumer detects stale or in-progress
//! slots through a per-region version counter and a per-slot sequence number.
//! This trades completeness for latency - the right trade for telemetry,
//! market data snapshots, and other feeds where the newest record matters
//! more than every record.
//!
//! Two transports share the same core algorithms:
//!
//! - [`sync`] - heap-allocated channels between threads of one process
//! - [`ipc`] - the same rings laid out in POSIX shared memory, across processes

// Allow the crate to reference itself as ::rhea for derive macro usage
extern crate self as rhea;

pub mod ipc;
pub mod mpsc;
pub(crate) mod slot;
pub mod spsc;
pub mod sync;
pub mod trace;

#[doc(inline)]
pub use rhea_derive::ShmSafe;

#[doc(inline)]
pub use ipc::shmem::ShmSafe;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use ipc::shmem::ShmSafe as __ShmSafePrivate;

/// Fixed-size, byte-copyable payload record.
///
/// This is the payload contract for every ring in the crate: the record is
/// copied in and out of slots as raw bytes, so it must be `Copy`, carry no
/// process-local pointers, and have a stable layout. All of that is exactly
/// what [`ShmSafe`] certifies, so `Record` is a blanket over it.
///
/// ```
/// use rhea::ShmSafe;
///
/// #[derive(ShmSafe, Clone, Copy)]
/// #[repr(C)]
/// struct Tick {
///     instrument: u32,
///     price: f64,
/// }
/// ```
pub trait Record: Copy + ShmSafe + 'static {}

impl<T: Copy + ShmSafe + 'static> Record for T {}
