//! Lock-free SPSC queue for in-process (inter-thread) communication.
//!
//! A wait-free bounded queue over a heap-allocated ring buffer with atomic
//! cursors. The queue object hands out at most one producer and one consumer
//! handle at a time; dropping a handle releases its role for re-claiming.
//!
//! # Example
//!
//! ```
//! use synapse::sync::spsc::SpscQueue;
//!
//! let queue = SpscQueue::<u64, 1024>::new();
//! let producer = queue.make_producer().unwrap();
//! let consumer = queue.make_consumer().unwrap();
//!
//! producer.push(42).expect("queue full");
//! assert_eq!(consumer.pop(), Some(42));
//!
//! // A second claim fails while the first handle is alive.
//! assert!(queue.make_producer().is_err());
//! ```
//!
//! Handles hold a strong reference to the ring, so the storage always
//! outlives them; there is no way to use a handle against a freed queue.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::claim::ClaimError;
use crate::payload::Payload;
use crate::spsc::ring::Ring;
use crate::trace;

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

struct CapacityCheck<const N: usize>;

impl<const N: usize> CapacityCheck<N> {
    /// Compile-time assertion that the capacity is a nonzero power of two.
    const OK: () = assert!(
        N > 0 && N.is_power_of_two(),
        "queue capacity must be a nonzero power of two"
    );
}

/// Bounded single-producer single-consumer queue.
///
/// Cloning the queue object is cheap (it clones an `Arc`); all clones share
/// the same ring and the same two role gates.
pub struct SpscQueue<T: Payload, const N: usize> {
    ring: Arc<Ring<T, N>>,
}

impl<T: Payload, const N: usize> SpscQueue<T, N> {
    /// Creates a new queue with zeroed cursors and unclaimed roles.
    ///
    /// Fails to compile if `N` is zero or not a power of two.
    #[must_use]
    pub fn new() -> Self {
        let () = CapacityCheck::<N>::OK;
        Self {
            ring: Arc::new(Ring::new()),
        }
    }

    /// Claims the producer role.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::ProducerClaimed`] while another producer handle
    /// is alive. Retrying after that handle drops succeeds.
    pub fn make_producer(&self) -> Result<Producer<T, N>, ClaimError> {
        if !self.ring.try_claim_producer() {
            return Err(ClaimError::ProducerClaimed);
        }
        trace::debug!("spsc producer claimed");
        Ok(Producer {
            ring: Arc::clone(&self.ring),
            _unsync: PhantomData,
        })
    }

    /// Claims the consumer role.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::ConsumerClaimed`] while another consumer handle
    /// is alive.
    pub fn make_consumer(&self) -> Result<Consumer<T, N>, ClaimError> {
        if !self.ring.try_claim_consumer() {
            return Err(ClaimError::ConsumerClaimed);
        }
        trace::debug!("spsc consumer claimed");
        Ok(Consumer {
            ring: Arc::clone(&self.ring),
            _unsync: PhantomData,
        })
    }
}

impl<T: Payload, const N: usize> Clone for SpscQueue<T, N> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Payload, const N: usize> Default for SpscQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write end of the SPSC queue.
///
/// Move-only: cloning would violate the single-producer invariant.
///
/// # Thread Safety
///
/// `Producer` is [`Send`] but **not** [`Sync`]:
/// - Can transfer ownership to another thread
/// - Cannot share `&Producer` (no concurrent `push()`)
pub struct Producer<T: Payload, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

impl<T: Payload, const N: usize> Producer<T, N> {
    /// Attempts to push an item onto the queue (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full, allowing retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: the claim gate guarantees this is the only producer handle,
        // and the handle is !Sync, so no concurrent push is possible.
        unsafe { self.ring.push(item) }
    }

    /// Best-effort count of queued items, clamped to `[0, N]`.
    #[inline]
    #[must_use]
    pub fn count_snapshot(&self) -> usize {
        self.ring.count_snapshot()
    }
}

impl<T: Payload, const N: usize> Drop for Producer<T, N> {
    fn drop(&mut self) {
        self.ring.release_producer();
        trace::trace!("spsc producer released");
    }
}

/// Read end of the SPSC queue.
///
/// Move-only: cloning would violate the single-consumer invariant.
/// See [`Producer`] for thread safety details (same semantics apply).
pub struct Consumer<T: Payload, const N: usize> {
    ring: Arc<Ring<T, N>>,
    _unsync: PhantomUnsync,
}

impl<T: Payload, const N: usize> Consumer<T, N> {
    /// Attempts to pop an item from the queue (wait-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: the claim gate guarantees this is the only consumer handle,
        // and the handle is !Sync, so no concurrent pop is possible.
        unsafe { self.ring.pop() }
    }

    /// Pops into caller-supplied storage, avoiding the `Option` wrapper for
    /// bulk-polling callers.
    ///
    /// Returns `false` and leaves `out` untouched if the queue is empty.
    #[inline]
    pub fn try_pop(&self, out: &mut T) -> bool {
        // SAFETY: as for pop.
        unsafe { self.ring.try_pop(out) }
    }

    /// Reads the next item without consuming it.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        // SAFETY: as for pop.
        unsafe { self.ring.peek() }
    }

    /// Like [`Consumer::peek`], but writes into caller-supplied storage.
    #[inline]
    pub fn peek_into(&self, out: &mut T) -> bool {
        match self.peek() {
            Some(item) => {
                *out = item;
                true
            }
            None => false,
        }
    }

    /// Best-effort count of queued items, clamped to `[0, N]`.
    #[inline]
    #[must_use]
    pub fn count_snapshot(&self) -> usize {
        self.ring.count_snapshot()
    }
}

impl<T: Payload, const N: usize> Drop for Consumer<T, N> {
    fn drop(&mut self) {
        self.ring.release_consumer();
        trace::trace!("spsc consumer released");
    }
}
