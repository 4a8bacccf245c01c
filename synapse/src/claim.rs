//! Role claim arbitration errors.
//!
//! Producer and consumer roles are claimed through single CAS gates rather
//! than locks: a losing claim returns one of these errors immediately instead
//! of waiting. All variants are expected, recoverable conditions; retrying
//! after the current holder drops its handle succeeds.

use thiserror::Error;

/// A queue role could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// The single producer role is already held by a live handle.
    #[error("producer role is already claimed")]
    ProducerClaimed,

    /// The single consumer role is already held by a live handle (SPSC).
    #[error("consumer role is already claimed")]
    ConsumerClaimed,

    /// Every consumer slot is occupied by a live handle (SPMC).
    #[error("all consumer slots are occupied")]
    NoFreeSlot,
}
