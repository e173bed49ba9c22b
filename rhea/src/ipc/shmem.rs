//! POSIX shared memory wrapper with type safety and automatic cleanup.
//!
//! [`Shm<T, Mode>`] is a typed smart pointer over a `shm_open` + `mmap`
//! mapping. The `Mode` parameter is a typestate: a [`Creator`] made the
//! object and unlinks its name on drop, an [`Opener`] attached to an existing
//! object and only unmaps. [`ShmSafe`] marks the types allowed inside a
//! mapping.
//!
//! # Basic Usage
//!
//! ```no_run
//! use rhea::ShmSafe;
//! use rhea::ipc::shmem::{Creator, Opener, Shm};
//! use std::sync::atomic::{AtomicU64, Ordering};
//!
//! #[derive(ShmSafe)]
//! #[repr(C)]
//! struct Counter {
//!     value: AtomicU64,
//! }
//!
//! // Process A: create and initialize in place
//! let counter = Shm::<Counter, Creator>::create("/my-counter", |ptr| unsafe {
//!     std::ptr::addr_of_mut!((*ptr).value).write(AtomicU64::new(0));
//! })?;
//! counter.value.store(42, Ordering::Release);
//!
//! // Process B: open and read
//! let counter = Shm::<Counter, Opener>::open("/my-counter")?;
//! assert_eq!(counter.value.load(Ordering::Acquire), 42);
//! # Ok::<(), rhea::ipc::shmem::ShmError>(())
//! ```
//!
//! # Cleanup and Crash Handling
//!
//! Cleanup is RAII: dropping a mapping unmaps it, and the creator's drop also
//! unlinks the name. A crashed creator leaks the name; remove it with
//! `rustix::shm::unlink` on the next startup before creating afresh.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};
use thiserror::Error;

use crate::trace;

/// Result alias for shared memory operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Contextual errors produced by [`Shm`].
#[derive(Debug, Error)]
pub enum ShmError {
    /// The provided POSIX shared memory name is invalid.
    #[error("invalid shared memory path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    /// `shm_open`, `mmap`, `ftruncate`, etc. failed with an errno.
    #[error("{op} failed for `{path}`: {source}")]
    Posix {
        op: &'static str,
        path: String,
        #[source]
        source: io::Errno,
    },

    /// The existing shared memory object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },

    /// The creator did not finish initializing the object in time.
    #[error("shared memory `{path}` was not initialized in time")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

/// Cleanup behavior selector for [`Shm`]. Implemented by the [`Creator`] and
/// [`Opener`] typestate markers; not meant for user impls.
pub trait ShmMode {
    /// Whether dropping the mapping also unlinks the object's name.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker: this handle created the object and owns its name.
/// Dropping it unmaps the memory and unlinks the name.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker: this handle attached to an existing object. Dropping it
/// only unmaps; the creator remains responsible for the name.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in shared memory and access from several processes.
///
/// Implementers certify plain data: stable `#[repr(C)]`/`#[repr(transparent)]`
/// layout, no pointers or references (virtual addresses are process-local),
/// every field recursively `ShmSafe`, concurrent access mediated by atomics,
/// and no reliance on `Drop` ever running (a killed process never drops).
///
/// Provided for primitives, atomics, and arrays of `ShmSafe` elements. For
/// custom records use the derive macro, which checks the layout and
/// pointer-freedom requirements at compile time:
///
/// ```
/// use rhea::ShmSafe;
///
/// #[derive(ShmSafe, Clone, Copy)]
/// #[repr(C)]
/// struct Sample {
///     channel: u32,
///     value: f64,
/// }
/// ```
///
/// # Safety
///
/// All requirements above are the implementer's obligation; the derive
/// verifies the mechanical ones and leaves the concurrency obligations to
/// the implementer.
pub unsafe trait ShmSafe: Send + Sync {}

macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl ShmSafe for $t {}
        )*
    };
}

impl_shm_safe! {
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64,
    bool,
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

// SAFETY: an array is plain data exactly when its elements are.
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

/// Typed smart pointer to a POSIX shared memory mapping.
///
/// Derefs to `T`. The `Mode` typestate decides drop behavior; see [`Creator`]
/// and [`Opener`].
///
/// # Safety Invariants
///
/// - `ptr` points to a live mapping of exactly `size_of::<T>()` bytes
/// - the mapping stays valid for the lifetime of this value
/// - `ptr` satisfies `T`'s alignment (mmap returns page-aligned addresses)
pub struct Shm<T: ShmSafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: String,
    _mode: PhantomData<Mode>,
}

// SAFETY: the pointer targets shared memory, not thread-local state, and
// T: ShmSafe already requires Send + Sync.
unsafe impl<T: ShmSafe, Mode: ShmMode> Send for Shm<T, Mode> {}
unsafe impl<T: ShmSafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

const POSIX_NAME_MAX: usize = 255;

/// Validates a name against the portable `shm_open` requirements: leading
/// `/`, no further `/`, at most 255 bytes.
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }
    if path[1..].contains('/') {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }
    if path.len() > POSIX_NAME_MAX {
        return Err(ShmError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }
    Ok(())
}

impl<T: ShmSafe> Shm<T, Creator> {
    /// Creates a new shared memory object sized for `T`, maps it, and runs
    /// `init` on the raw mapping before returning.
    ///
    /// `init` receives a pointer to uninitialized (kernel-zeroed) memory and
    /// must bring it to a valid `T`, typically by writing fields through
    /// `addr_of_mut!` and finishing with a release store on a readiness flag
    /// that openers poll. If `init` panics, the mapping and the name are
    /// cleaned up before the panic continues.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid, the object already exists, permissions
    /// are lacking, or the system is out of memory/descriptors.
    pub fn create(path: &str, init: impl FnOnce(*mut T)) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", path, err))?;

        if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(ShmError::posix("ftruncate", path, err));
        }

        // SAFETY: fresh mapping of a correctly sized object; page alignment
        // satisfies any T; READ|WRITE for interior mutability via atomics.
        let mapped = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match mapped {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path);
                return Err(ShmError::posix("mmap", path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        // Constructed before init so an unwinding init still unmaps and
        // unlinks through Drop.
        let shm = Self {
            ptr,
            size: size_of::<T>(),
            path: path.to_string(),
            _mode: PhantomData,
        };
        init(shm.ptr.as_ptr());

        trace::info!(%path, bytes = shm.size, "created shared memory object");
        Ok(shm)
    }
}

impl<T: ShmSafe> Shm<T, Opener> {
    /// Opens an existing shared memory object and maps it.
    ///
    /// The object's size must match `size_of::<T>()` exactly; a mismatch
    /// almost always means the two processes disagree on the ring parameters.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid, the object does not exist, permissions
    /// are lacking, or the size check fails.
    pub fn open(path: &str) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(path, shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", path, err))?;

        let stat = fstat(&fd).map_err(|err| ShmError::posix("fstat", path, err))?;
        if stat.st_size != size_of::<T>() as i64 {
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // SAFETY: object exists with the verified size; fresh mapping, page
        // aligned, READ|WRITE shared.
        let mapped = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = mapped.map_err(|err| ShmError::posix("mmap", path, err))?;

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        trace::debug!(%path, bytes = size_of::<T>(), "opened shared memory object");
        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path: path.to_string(),
            _mode: PhantomData,
        })
    }
}

impl<T: ShmSafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: ptr is valid and aligned for the lifetime of self per the
        // struct invariants.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: ShmSafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: unmapping the exact region this value mapped; the pointer
        // is never used again.
        if let Err(_err) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            trace::warn!(path = %self.path, err = %_err, "munmap failed");
        }
        if Mode::SHOULD_UNLINK
            && let Err(_err) = shm::unlink(&self.path)
        {
            trace::warn!(path = %self.path, err = %_err, "shm_unlink failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_paths() {
        assert!(matches!(
            validate_shm_path("no-slash"),
            Err(ShmError::InvalidPath { .. })
        ));
    }

    #[test]
    fn rejects_nested_paths() {
        assert!(matches!(
            validate_shm_path("/a/b"),
            Err(ShmError::InvalidPath { .. })
        ));
    }

    #[test]
    fn rejects_overlong_paths() {
        let long = format!("/{}", "x".repeat(POSIX_NAME_MAX));
        assert!(matches!(
            validate_shm_path(&long),
            Err(ShmError::InvalidPath { .. })
        ));
    }

    #[test]
    fn accepts_flat_names() {
        assert!(validate_shm_path("/rhea-test").is_ok());
    }

    #[test]
    fn create_open_roundtrip() {
        #[repr(C)]
        struct Flag {
            ready: AtomicU64,
        }
        // SAFETY: repr(C), a single atomic, no pointers.
        unsafe impl ShmSafe for Flag {}

        let path = format!("/rhea-shmem-roundtrip-{}", std::process::id());

        let created = Shm::<Flag, Creator>::create(&path, |ptr| unsafe {
            std::ptr::addr_of_mut!((*ptr).ready).write(AtomicU64::new(11));
        });
        let created = match created {
            Ok(shm) => shm,
            Err(ShmError::Posix { source, .. }) if source == io::Errno::ACCESS => {
                eprintln!("Skipping test due to shared memory permission denial");
                return;
            }
            Err(err) => panic!("Unexpected shared memory error: {err}"),
        };

        let opened = Shm::<Flag, Opener>::open(&path).unwrap();
        assert_eq!(opened.ready.load(Ordering::Acquire), 11);

        opened.ready.store(23, Ordering::Release);
        assert_eq!(created.ready.load(Ordering::Acquire), 23);
    }

    #[test]
    fn open_rejects_size_mismatch() {
        #[repr(C)]
        struct Small {
            value: AtomicU64,
        }
        // SAFETY: repr(C), a single atomic, no pointers.
        unsafe impl ShmSafe for Small {}

        #[repr(C)]
        struct Large {
            value: AtomicU64,
            extra: [u8; 64],
        }
        // SAFETY: repr(C), atomic plus inline bytes, no pointers.
        unsafe impl ShmSafe for Large {}

        let path = format!("/rhea-shmem-mismatch-{}", std::process::id());

        let created = Shm::<Small, Creator>::create(&path, |ptr| unsafe {
            std::ptr::addr_of_mut!((*ptr).value).write(AtomicU64::new(0));
        });
        let _created = match created {
            Ok(shm) => shm,
            Err(ShmError::Posix { source, .. }) if source == io::Errno::ACCESS => {
                eprintln!("Skipping test due to shared memory permission denial");
                return;
            }
            Err(err) => panic!("Unexpected shared memory error: {err}"),
        };

        assert!(matches!(
            Shm::<Large, Opener>::open(&path),
            Err(ShmError::SizeMismatch { .. })
        ));
    }
}
