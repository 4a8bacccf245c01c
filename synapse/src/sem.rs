//! Counting semaphores for blocking composition.
//!
//! The queues themselves never block; callers wanting wake-up semantics pair
//! a queue with one of these semaphores (post after a successful push, wait
//! before polling). Two flavors:
//!
//! - [`Semaphore`] - process-local counting semaphore
//! - [`NamedSemaphore`] - named, cross-process counting semaphore, the
//!   natural companion of the [`crate::ipc`] queues
//!
//! Both surface the same small result taxonomy: [`SemError::Timeout`] for an
//! expired timed wait, [`SemError::WouldBlock`] for a failed try-wait, and
//! [`SemError::Sys`] carrying the errno for everything unexpected. All are
//! synchronous, recoverable, and never logged here.
//!
//! The backend is selected at build time; only the POSIX implementation
//! exists in this tree.

use rustix::io::Errno;
use thiserror::Error;

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::{NamedSemaphore, SemName, Semaphore};

#[cfg(not(unix))]
compile_error!("synapse semaphores require a POSIX platform");

/// Result alias for semaphore operations.
pub type Result<T> = std::result::Result<T, SemError>;

/// Errors produced by [`Semaphore`] and [`NamedSemaphore`].
#[derive(Debug, Error)]
pub enum SemError {
    /// The provided semaphore name is invalid.
    #[error("invalid semaphore name `{name}`: {reason}")]
    InvalidName { name: String, reason: &'static str },

    /// A timed wait expired before the semaphore was posted.
    #[error("timed out waiting on semaphore")]
    Timeout,

    /// A try-wait found the count at zero.
    #[error("semaphore would block")]
    WouldBlock,

    /// A post would exceed the configured maximum count.
    #[error("semaphore is at its maximum count")]
    MaxCount,

    /// An underlying semaphore call failed with an errno.
    #[error("{op} failed: {source}")]
    Sys { op: &'static str, source: Errno },
}

impl SemError {
    pub(crate) fn sys(op: &'static str) -> Self {
        let raw = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or_default();
        Self::Sys {
            op,
            source: Errno::from_raw_os_error(raw),
        }
    }
}
