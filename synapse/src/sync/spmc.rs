//! Lock-free SPMC broadcast queue for in-process communication.
//!
//! One producer fans a sequence of items out to up to `C` independent
//! consumers; every attached consumer observes the identical sequence from
//! its attach point onward. The producer refuses to overwrite storage that
//! the slowest active consumer has not yet read, so no live consumer ever
//! silently misses an item.
//!
//! # Example
//!
//! ```
//! use synapse::sync::spmc::SpmcQueue;
//!
//! let queue = SpmcQueue::<u64, 1024, 16>::new();
//! let producer = queue.make_producer().unwrap();
//! let a = queue.make_consumer().unwrap();
//! let b = queue.make_consumer().unwrap();
//!
//! producer.push(1).expect("queue full");
//! assert_eq!(a.pop(), Some(1));
//! assert_eq!(b.pop(), Some(1));
//! ```
//!
//! A consumer that attaches after an item is pushed never sees it: its
//! cursor starts at the producer's current position, not at the beginning of
//! history.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::claim::ClaimError;
use crate::payload::Payload;
use crate::spmc::ring::BroadcastRing;
use crate::trace;

/// Marker type to opt-out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

struct ParamsCheck<const N: usize, const C: usize>;

impl<const N: usize, const C: usize> ParamsCheck<N, C> {
    /// Compile-time assertion on capacity and consumer-table size.
    const OK: () = {
        assert!(
            N > 0 && N.is_power_of_two(),
            "queue capacity must be a nonzero power of two"
        );
        assert!(C > 0, "queue must allow at least one consumer slot");
    };
}

/// Bounded single-producer broadcast queue with `C` consumer slots.
///
/// Cloning the queue object is cheap (it clones an `Arc`); all clones share
/// the same ring, producer gate, and consumer table.
pub struct SpmcQueue<T: Payload, const N: usize, const C: usize> {
    ring: Arc<BroadcastRing<T, N, C>>,
}

impl<T: Payload, const N: usize, const C: usize> SpmcQueue<T, N, C> {
    /// Creates a new queue with a zeroed cursor and all consumer slots free.
    ///
    /// Fails to compile if `N` is zero or not a power of two, or if `C` is
    /// zero.
    #[must_use]
    pub fn new() -> Self {
        let () = ParamsCheck::<N, C>::OK;
        Self {
            ring: Arc::new(BroadcastRing::new()),
        }
    }

    /// Claims the producer role.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::ProducerClaimed`] while another producer handle
    /// is alive.
    pub fn make_producer(&self) -> Result<Producer<T, N, C>, ClaimError> {
        if !self.ring.try_claim_producer() {
            return Err(ClaimError::ProducerClaimed);
        }
        trace::debug!("spmc producer claimed");
        Ok(Producer {
            ring: Arc::clone(&self.ring),
            _unsync: PhantomData,
        })
    }

    /// Attaches a new consumer in a free slot.
    ///
    /// The consumer's cursor starts at the producer's *current* position: it
    /// will observe only items pushed after this call.
    ///
    /// # Errors
    ///
    /// Returns [`ClaimError::NoFreeSlot`] when all `C` slots are held by live
    /// handles.
    pub fn make_consumer(&self) -> Result<Consumer<T, N, C>, ClaimError> {
        let Some(slot) = self.ring.attach_consumer() else {
            return Err(ClaimError::NoFreeSlot);
        };
        trace::debug!(slot, "spmc consumer attached");
        Ok(Consumer {
            ring: Arc::clone(&self.ring),
            slot,
            _unsync: PhantomData,
        })
    }
}

impl<T: Payload, const N: usize, const C: usize> Clone for SpmcQueue<T, N, C> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
        }
    }
}

impl<T: Payload, const N: usize, const C: usize> Default for SpmcQueue<T, N, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Write end of the broadcast queue.
///
/// Move-only: cloning would violate the single-producer invariant.
/// `Send` but not `Sync`, like its SPSC counterpart.
pub struct Producer<T: Payload, const N: usize, const C: usize> {
    ring: Arc<BroadcastRing<T, N, C>>,
    _unsync: PhantomUnsync,
}

impl<T: Payload, const N: usize, const C: usize> Producer<T, N, C> {
    /// Attempts to push an item to every active consumer (wait-free apart
    /// from the bounded scan over the consumer table).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when the slowest active consumer is a full
    /// capacity behind. With zero active consumers the push always succeeds
    /// (and the item is never read).
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: the claim gate guarantees this is the only producer handle,
        // and the handle is !Sync, so no concurrent push is possible.
        unsafe { self.ring.push(item) }
    }

    /// Best-effort count of items not yet read by the slowest active
    /// consumer, clamped to `[0, N]`.
    #[inline]
    #[must_use]
    pub fn count_snapshot(&self) -> usize {
        self.ring.count_snapshot()
    }
}

impl<T: Payload, const N: usize, const C: usize> Drop for Producer<T, N, C> {
    fn drop(&mut self) {
        self.ring.release_producer();
        trace::trace!("spmc producer released");
    }
}

/// Read end of the broadcast queue, bound to one consumer slot.
///
/// Fully decoupled from other consumers: popping here never affects what
/// they observe. Dropping the handle frees the slot for reuse and removes it
/// from the producer's backpressure computation.
pub struct Consumer<T: Payload, const N: usize, const C: usize> {
    ring: Arc<BroadcastRing<T, N, C>>,
    slot: usize,
    _unsync: PhantomUnsync,
}

impl<T: Payload, const N: usize, const C: usize> Consumer<T, N, C> {
    /// Attempts to pop the next unread item for this consumer (wait-free).
    ///
    /// Returns `None` when this consumer has observed everything published
    /// so far.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: this handle exclusively owns `self.slot` (attach gave it
        // out once), and the handle is !Sync.
        unsafe { self.ring.pop(self.slot) }
    }

    /// Pops into caller-supplied storage.
    ///
    /// Returns `false` and leaves `out` untouched when nothing is unread.
    #[inline]
    pub fn try_pop(&self, out: &mut T) -> bool {
        // SAFETY: as for pop.
        unsafe { self.ring.try_pop(out, self.slot) }
    }

    /// Reads the next unread item without consuming it.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        // SAFETY: as for pop.
        unsafe { self.ring.peek(self.slot) }
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

    /// Best-effort count of items this consumer has not yet popped, clamped
    /// to `[0, N]`.
    #[inline]
    #[must_use]
    pub fn count_snapshot(&self) -> usize {
        self.ring.count_snapshot_for(self.slot)
    }
}

impl<T: Payload, const N: usize, const C: usize> Drop for Consumer<T, N, C> {
    fn drop(&mut self) {
        self.ring.detach_consumer(self.slot);
        trace::trace!(slot = self.slot, "spmc consumer detached");
    }
}
