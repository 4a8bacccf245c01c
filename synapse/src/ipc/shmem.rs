//! POSIX shared memory wrapper with type safety and automatic cleanup.
//!
//! Provides a typed smart pointer over `shm_open` + `mmap` with
//! compile-time guarantees about cleanup behavior:
//!
//! - [`Shm<T, Mode>`] - Smart pointer to shared memory with typestate-based
//!   cleanup
//! - [`ShmSafe`] - Trait marking types safe for cross-process sharing
//! - [`Creator`] - Typestate marker: creates new shared memory, unlinks on
//!   drop
//! - [`Opener`] - Typestate marker: opens existing shared memory, no unlink
//!   on drop
//!
//! The creator initializes the mapping in place through a closure, so
//! multi-step structures (e.g. a ring whose init marker must be written
//! last) control their own publication order.
//!
//! # Cleanup and crash handling
//!
//! | Mode | On drop |
//! |------|---------|
//! | [`Creator`] | `munmap()` + `shm_unlink()` |
//! | [`Opener`]  | `munmap()` only |
//!
//! A crashed creator leaks the name; daemons should `shm_unlink` any stale
//! object for their well-known paths before creating a fresh one.

use std::fmt;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::ops::Deref;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::ptr::{NonNull, null_mut};
use std::sync::atomic::*;

use rustix::fs::{Mode, fstat, ftruncate};
use rustix::io::Errno;
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::shm;
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
        source: Errno,
    },

    /// The existing shared memory object has a different size than `T`.
    #[error("shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        path: String,
        expected: usize,
        actual: i64,
    },

    /// The creator did not finish initializing the object in time.
    #[error("timed out waiting for `{path}` to be initialized")]
    InitTimeout { path: String },
}

impl ShmError {
    fn posix(op: &'static str, path: &ShmPath, source: Errno) -> Self {
        Self::Posix {
            op,
            path: path.to_string(),
            source,
        }
    }
}

const POSIX_NAME_MAX: usize = 255;

/// A validated POSIX shared memory object name.
///
/// For portable use, POSIX requires the name to start with `/`, contain no
/// further slashes, and stay within `NAME_MAX` bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShmPath(String);

impl ShmPath {
    /// Validates and wraps a shared memory object name.
    ///
    /// # Errors
    ///
    /// Returns [`ShmError::InvalidPath`] when the name doesn't meet the
    /// POSIX `shm_open` requirements.
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();

        if !path.starts_with('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path must start with '/'",
            });
        }

        if path[1..].contains('/') {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path must not contain additional '/' characters",
            });
        }

        if path.len() > POSIX_NAME_MAX {
            return Err(ShmError::InvalidPath {
                path,
                reason: "path length must be <= 255 bytes",
            });
        }

        Ok(Self(path))
    }

    /// Returns the validated name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShmPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trait defining cleanup behavior for shared memory modes.
///
/// Implemented by the [`Creator`] and [`Opener`] typestate markers; users
/// never implement it themselves.
pub trait ShmMode {
    /// Whether to unlink the shared memory name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for processes that create shared memory.
///
/// On drop the mapping is unmapped **and the name is unlinked**.
pub struct Creator;
impl ShmMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for processes that open existing shared memory.
///
/// On drop the mapping is unmapped; the name persists for the creator to
/// clean up.
pub struct Opener;
impl ShmMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// Types safe to place in POSIX shared memory and access from multiple
/// processes.
///
/// # Safety
///
/// Implementers must guarantee:
///
/// - **Layout**: `#[repr(C)]` or `#[repr(transparent)]` (processes may be
///   compiled separately; the default Rust layout is unstable)
/// - **Pointers**: no heap/stack pointers or references (virtual addresses
///   don't transfer across processes)
/// - **Drop**: the type stays sound if `Drop` never runs (crashes bypass
///   destructors)
/// - **Concurrency**: shared mutable state goes through atomics; process-local
///   primitives like `std::sync::Mutex` don't work across processes
pub unsafe trait ShmSafe: Send + Sync {}

macro_rules! impl_shm_safe {
    ($($t:ty),* $(,)?) => {
        $(
            unsafe impl ShmSafe for $t {}
        )*
    };
}

impl_shm_safe! {
    // Signed integers
    i8, i16, i32, i64, i128, isize,
    // Unsigned integers
    u8, u16, u32, u64, u128, usize,
    // Floats
    f32, f64,
    // Bool
    bool,
    // Atomics
    AtomicBool,
    AtomicI8, AtomicI16, AtomicI32, AtomicI64, AtomicIsize,
    AtomicU8, AtomicU16, AtomicU32, AtomicU64, AtomicUsize,
}

// Arrays are ShmSafe if their elements are.
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

/// Smart pointer to POSIX shared memory with typestate-based cleanup.
///
/// Both processes access the same physical pages through their own virtual
/// addresses; `T: ShmSafe` guarantees the bits mean the same thing on both
/// sides.
pub struct Shm<T: ShmSafe, Mode: ShmMode> {
    ptr: NonNull<T>,
    size: usize,
    path: ShmPath,
    _mode: PhantomData<Mode>,
}

// SAFETY: the raw pointer targets shared memory, not thread-local data, and
// T: ShmSafe already requires Send + Sync.
unsafe impl<T: ShmSafe, Mode: ShmMode> Send for Shm<T, Mode> {}
unsafe impl<T: ShmSafe, Mode: ShmMode> Sync for Shm<T, Mode> {}

impl<T: ShmSafe> Shm<T, Creator> {
    /// Creates a new shared memory object sized for `T`, maps it, and
    /// initializes it in place through `init`.
    ///
    /// The closure receives the uninitialized mapping exactly once; after it
    /// returns, the memory is treated as a valid `T`. Initialization order is
    /// the closure's responsibility (write any "ready" marker last).
    ///
    /// # Errors
    ///
    /// `EEXIST` (path exists), `EACCES` (permissions), `ENOMEM` (resources),
    /// and other errno values from `shm_open`/`ftruncate`/`mmap`.
    pub fn create(path: ShmPath, init: impl FnOnce(&mut MaybeUninit<T>)) -> Result<Self> {
        let fd = shm::open(
            path.as_str(),
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        if let Err(err) = ftruncate(&fd, size_of::<T>() as u64) {
            drop(fd);
            let _ = shm::unlink(path.as_str());
            return Err(ShmError::posix("ftruncate", &path, err));
        }

        // SAFETY: fresh mapping of a correctly sized object; mmap returns
        // page-aligned addresses, which satisfies any T's alignment, and the
        // mapping aliases no existing Rust object.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                let _ = shm::unlink(path.as_str());
                return Err(ShmError::posix("mmap", &path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        trace::info!(path = %path, size = size_of::<T>(), "shared memory created");

        let shm = Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        };

        // Run the initializer; if it panics, unmap and unlink before
        // propagating so the name isn't leaked.
        let init_result = catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: the mapping is exclusive until this constructor
            // returns, so handing out &mut MaybeUninit<T> aliases nothing.
            init(unsafe { &mut *shm.ptr.as_ptr().cast::<MaybeUninit<T>>() });
        }));

        match init_result {
            Ok(()) => Ok(shm),
            Err(payload) => {
                drop(shm);
                resume_unwind(payload);
            }
        }
    }
}

impl<T: ShmSafe> Shm<T, Opener> {
    /// Opens an existing shared memory object and maps it.
    ///
    /// # Errors
    ///
    /// `ENOENT` (doesn't exist), `EACCES` (permissions), size mismatch
    /// against `size_of::<T>()`, and other errno values.
    pub fn open(path: ShmPath) -> Result<Self> {
        let fd = shm::open(path.as_str(), shm::OFlags::RDWR, Mode::empty())
            .map_err(|err| ShmError::posix("shm_open", &path, err))?;

        let stat = match fstat(&fd) {
            Ok(stat) => stat,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("fstat", &path, err));
            }
        };
        let expected_size = size_of::<T>() as i64;
        if stat.st_size != expected_size {
            drop(fd);
            return Err(ShmError::SizeMismatch {
                path: path.to_string(),
                expected: size_of::<T>(),
                actual: stat.st_size,
            });
        }

        // SAFETY: object exists with the validated size; the mapping aliases
        // no existing Rust object in this process, and T: ShmSafe covers the
        // concurrent-access requirements.
        let ptr_result = unsafe {
            mmap(
                null_mut(),
                size_of::<T>(),
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                &fd,
                0,
            )
        };
        let ptr = match ptr_result {
            Ok(p) => p,
            Err(err) => {
                drop(fd);
                return Err(ShmError::posix("mmap", &path, err));
            }
        };

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr.cast::<T>()) };

        trace::info!(path = %path, size = size_of::<T>(), "shared memory opened");

        Ok(Self {
            ptr,
            size: size_of::<T>(),
            path,
            _mode: PhantomData,
        })
    }
}

impl<T: ShmSafe, Mode: ShmMode> Shm<T, Mode> {
    /// Returns the validated name of the underlying object.
    #[must_use]
    pub fn path(&self) -> &ShmPath {
        &self.path
    }
}

impl<T: ShmSafe, Mode: ShmMode> Drop for Shm<T, Mode> {
    fn drop(&mut self) {
        // SAFETY: ptr/size describe the mapping established in the
        // constructor; after this point the pointer is never used again.
        if let Err(_err) = unsafe { munmap(self.ptr.as_ptr().cast(), self.size) } {
            trace::error!(path = %self.path, err = %_err, "munmap failed");
        }

        if Mode::SHOULD_UNLINK {
            let _ = shm::unlink(self.path.as_str());
        }
    }
}

impl<T: ShmSafe, Mode: ShmMode> Deref for Shm<T, Mode> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the mapping is valid for the lifetime of Shm (established
        // by the constructor, released only in Drop).
        unsafe { &*self.ptr.as_ptr() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    struct Counter {
        value: AtomicU64,
    }

    unsafe impl ShmSafe for Counter {}

    fn init_counter(uninit: &mut MaybeUninit<Counter>) {
        uninit.write(Counter {
            value: AtomicU64::new(0),
        });
    }

    #[test]
    fn create_write_read_drop() -> Result<()> {
        let path = ShmPath::new("/synapse-test-counter")?;
        let _ = shm::unlink(path.as_str());

        let counter = match Shm::<Counter, Creator>::create(path, init_counter) {
            Ok(counter) => counter,
            Err(err @ ShmError::Posix { source, .. }) if source == Errno::ACCESS => {
                eprintln!("skipping create_write_read_drop: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        counter.value.store(42, Ordering::SeqCst);
        assert_eq!(counter.value.load(Ordering::SeqCst), 42);
        Ok(())
    }

    #[test]
    fn opener_sees_creator_writes() -> Result<()> {
        let path = ShmPath::new("/synapse-test-shared")?;
        let _ = shm::unlink(path.as_str());

        let data = match Shm::<Counter, Creator>::create(path.clone(), init_counter) {
            Ok(data) => data,
            Err(err @ ShmError::Posix { source, .. }) if source == Errno::ACCESS => {
                eprintln!("skipping opener_sees_creator_writes: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        data.value.store(100, Ordering::SeqCst);

        {
            let opened = Shm::<Counter, Opener>::open(path)?;
            assert_eq!(opened.value.load(Ordering::SeqCst), 100);
            opened.value.store(200, Ordering::SeqCst);
        } // Opener drops: unmap only

        assert_eq!(data.value.load(Ordering::SeqCst), 200);
        Ok(())
    }

    #[test]
    fn open_rejects_size_mismatch() -> Result<()> {
        #[repr(C)]
        struct Larger {
            a: AtomicU64,
            b: AtomicU64,
            c: AtomicU64,
        }
        unsafe impl ShmSafe for Larger {}

        let path = ShmPath::new("/synapse-test-size-mismatch")?;
        let _ = shm::unlink(path.as_str());

        let _small = match Shm::<Counter, Creator>::create(path.clone(), init_counter) {
            Ok(shm) => shm,
            Err(err @ ShmError::Posix { source, .. }) if source == Errno::ACCESS => {
                eprintln!("skipping open_rejects_size_mismatch: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        match Shm::<Larger, Opener>::open(path) {
            Err(ShmError::SizeMismatch {
                expected, actual, ..
            }) => {
                assert_eq!(expected, size_of::<Larger>());
                assert_eq!(actual, size_of::<Counter>() as i64);
            }
            Err(err) => panic!("expected SizeMismatch, got: {err}"),
            Ok(_) => panic!("expected SizeMismatch, but open() succeeded"),
        }
        Ok(())
    }

    #[test]
    fn path_validation() {
        assert!(ShmPath::new("/valid").is_ok());
        assert!(ShmPath::new("/valid-name_123").is_ok());

        assert!(matches!(
            ShmPath::new("no-slash"),
            Err(ShmError::InvalidPath { reason, .. }) if reason == "path must start with '/'"
        ));
        assert!(matches!(
            ShmPath::new("/foo/bar"),
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path must not contain additional '/' characters"
        ));

        let too_long = format!("/{}", "a".repeat(255));
        assert!(matches!(
            ShmPath::new(too_long),
            Err(ShmError::InvalidPath { reason, .. })
                if reason == "path length must be <= 255 bytes"
        ));

        // 255 bytes total including the leading slash is the maximum.
        let max_len = format!("/{}", "a".repeat(254));
        assert!(ShmPath::new(max_len).is_ok());
    }
}
