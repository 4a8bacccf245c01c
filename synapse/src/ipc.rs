//! Cross-process communication primitives.
//!
//! The queue frontends here place the same ring cores used by [`crate::sync`]
//! into POSIX shared memory, so a producer in one process can feed consumers
//! in others. Role claims live inside the shared ring, so producer/consumer
//! exclusivity holds across process boundaries exactly as it does between
//! threads.

use thiserror::Error;

use crate::claim::ClaimError;

pub mod shmem;
pub mod spmc;
pub mod spsc;

use shmem::ShmError;

/// Errors from creating or opening a shared-memory queue endpoint.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The shared memory object could not be created, opened, or validated.
    #[error(transparent)]
    Shm(#[from] ShmError),

    /// The requested role is already held by another handle, possibly in
    /// another process.
    #[error(transparent)]
    Claim(#[from] ClaimError),
}
