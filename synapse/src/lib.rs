//! Lock-free queues and IPC building blocks for low-latency pipelines.
//!
//! The core of the crate is a pair of bounded, lock-free ring queues over
//! fixed power-of-two storage:
//!
//! - [`sync::spsc`] / [`ipc::spsc`] - single-producer single-consumer
//! - [`sync::spmc`] / [`ipc::spmc`] - single-producer broadcast to multiple
//!   independent consumers, gated by the slowest active reader
//!
//! The `sync` frontends live on the heap for inter-thread use; the `ipc`
//! frontends place the identical ring in POSIX shared memory for
//! inter-process use. Queue roles are claimed through atomic gates and
//! released by dropping the move-only handles; no operation in the queue
//! core blocks, allocates, or takes a lock.
//!
//! Around the queues:
//!
//! - [`event`] - mutex-guarded publish/subscribe bus with RAII subscriptions
//! - [`sem`] - local and named counting semaphores for composing blocking
//!   wake-up with the non-blocking queues
//! - [`net`] - thin non-blocking TCP/UDP (incl. multicast) socket wrappers
//! - [`platform`] - CPU pinning and timestamp helpers
//!
//! Queue item types implement [`payload::Payload`] (bitwise-copyable,
//! pointer-free), typically via `#[derive(Payload)]`.

// Allow the crate to reference itself as ::synapse for derive macro usage
extern crate self as synapse;

pub mod claim;
pub mod event;
#[cfg(unix)]
pub mod ipc;
pub mod net;
pub mod payload;
pub mod platform;
pub mod sem;
pub mod spmc;
pub mod spsc;
pub mod sync;
pub mod trace;

pub use claim::ClaimError;
pub use payload::Payload;

#[doc(inline)]
pub use synapse_derive::Payload;

// Hidden re-export for the derive macro
#[doc(hidden)]
pub use payload::Payload as __PayloadPrivate;
