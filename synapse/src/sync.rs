//! Synchronization primitives for in-process communication.
//!
//! This module provides the heap-backed queue frontends for communication
//! between threads within the same process.

pub mod spmc;
pub mod spsc;
