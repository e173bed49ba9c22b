//! Cross-process channels over POSIX shared memory.
//!
//! The same ring algorithms as [`crate::sync`], laid out in a `shm_open`
//! mapping instead of the heap:
//!
//! - [`shmem`] - typed shared-memory smart pointer and the [`shmem::ShmSafe`]
//!   plain-data marker
//! - [`spsc`] - single-producer overwrite channel
//! - [`mpsc`] - multi-producer overwrite channel

pub mod mpsc;
pub mod shmem;
pub mod spsc;
