//! Core SPMC (Single-Producer Multiple-Consumer) broadcast queue primitives.
//!
//! Unlike the SPSC ring, every attached consumer observes the full published
//! sequence; the producer is gated by the slowest active consumer.
//!
//! Used by:
//! - [`crate::sync::spmc`] - In-process broadcast queues over heap memory
//! - [`crate::ipc::spmc`] - Cross-process broadcast queues over shared memory

pub(crate) mod ring;
