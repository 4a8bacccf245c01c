//! Core lock-free SPMC broadcast ring buffer algorithm.
//!
//! One producer publishes into fixed power-of-two storage; up to `C`
//! consumers read the same sequence independently, each through its own slot
//! in a fixed consumer table. A message stays readable until every *active*
//! consumer has passed it: the producer refuses to overwrite storage still
//! referenced by the slowest active cursor, so one stalled consumer throttles
//! the queue rather than losing data.
//!
//! Consumer slots move through a tri-state lifecycle:
//!
//! ```text
//! Free --CAS--> Initializing --publish--> Active --detach--> Free
//! ```
//!
//! `Free` slots are invisible to the backpressure scan. `Initializing` covers
//! the window where the slot's cursor is being seeded and must not be
//! trusted. Only `Active` slots participate in the minimum-cursor
//! computation.
//!
//! # Safety
//!
//! Producer-side methods require the single-producer invariant; per-slot
//! consumer methods require that only the owning consumer uses that slot
//! index. The safe frontends enforce both through the claim gates and
//! move-only handles.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Slot is unowned and excluded from backpressure.
pub const STATE_FREE: u8 = 0;
/// Slot is mid-attach; its cursor is not yet trustworthy.
pub const STATE_INITIALIZING: u8 = 1;
/// Slot participates in the slowest-consumer computation.
pub const STATE_ACTIVE: u8 = 2;

/// Per-consumer bookkeeping: lifecycle state plus a private read cursor.
///
/// Each slot sits on its own cache line so independent consumers don't
/// false-share cursor updates.
#[repr(C)]
#[repr(align(64))]
pub struct ConsumerSlot {
    /// Lifecycle state: one of the `STATE_*` constants.
    pub state: AtomicU8,

    /// Read cursor (count of items this consumer has popped).
    /// Advanced only by the owning consumer, read by the producer.
    pub tail: AtomicU64,
}

impl ConsumerSlot {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_FREE),
            tail: AtomicU64::new(0),
        }
    }
}

impl Default for ConsumerSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer-side state: head cursor and the producer claim gate.
#[repr(C)]
#[repr(align(64))]
pub struct ProducerState {
    /// Write cursor (count of items ever pushed).
    /// Advanced only by the producer, read by every consumer.
    pub head: AtomicU64,

    /// Whether a producer handle currently holds this role.
    pub claimed: AtomicBool,
}

impl ProducerState {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            claimed: AtomicBool::new(false),
        }
    }
}

impl Default for ProducerState {
    fn default() -> Self {
        Self::new()
    }
}

/// A single storage slot.
#[repr(C)]
pub struct Slot<T> {
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: access to the value is governed by the broadcast protocol: the
// producer writes a slot only while no active consumer's cursor references
// it, and consumers only read slots the head cursor has published.
unsafe impl<T: Send> Sync for Slot<T> {}
unsafe impl<T: Send> Send for Slot<T> {}

/// Core SPMC broadcast ring structure.
///
/// `N` is the storage capacity (power of two), `C` the maximum number of
/// concurrently attached consumers.
#[repr(C)]
pub struct BroadcastRing<T, const N: usize, const C: usize> {
    /// Producer state (head cursor + claim gate).
    pub producer: ProducerState,

    /// Fixed consumer table, one cache-line-aligned slot per consumer.
    pub slots: [ConsumerSlot; C],

    /// Prevent false sharing between the consumer table and the buffer.
    pub _padding: [u8; 64],

    /// Ring buffer storage.
    pub buffer: [Slot<T>; N],
}

impl<T, const N: usize, const C: usize> BroadcastRing<T, N, C> {
    /// Compile-time assertion on the capacity and consumer-table parameters.
    pub const PARAMS_OK: () = {
        assert!(
            N > 0 && N.is_power_of_two(),
            "queue capacity must be a nonzero power of two"
        );
        assert!(C > 0, "queue must allow at least one consumer slot");
    };

    const MASK: u64 = N as u64 - 1;

    /// Translates a monotonic cursor to a physical slot index.
    #[inline]
    pub const fn slot_index(cursor: u64) -> usize {
        (cursor & Self::MASK) as usize
    }

    /// Creates a new ring with zeroed cursors, all consumer slots `Free`,
    /// and uninitialized storage.
    pub fn new() -> Self {
        let () = Self::PARAMS_OK;
        Self {
            producer: ProducerState::new(),
            slots: std::array::from_fn(|_| ConsumerSlot::new()),
            _padding: [0u8; 64],
            // SAFETY: the buffer holds MaybeUninit slots, which don't require
            // initialization.
            buffer: unsafe { MaybeUninit::<[Slot<T>; N]>::uninit().assume_init() },
        }
    }

    /// Attempts to claim the producer role. Fails fast if already held.
    #[inline]
    pub fn try_claim_producer(&self) -> bool {
        self.producer
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the producer role so a future handle can claim it.
    #[inline]
    pub fn release_producer(&self) {
        self.producer.claimed.store(false, Ordering::Release);
    }

    /// Attaches a consumer: finds a `Free` slot, seeds its cursor at the
    /// current head (late joiners see only future messages), and publishes it
    /// `Active`. Returns the claimed slot index, or `None` when all `C` slots
    /// are occupied.
    pub fn attach_consumer(&self) -> Option<usize> {
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(
                    STATE_FREE,
                    STATE_INITIALIZING,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let head = self.producer.head.load(Ordering::Acquire);
                slot.tail.store(head, Ordering::Relaxed);
                // Publish: the release store orders the cursor seed before
                // the slot becomes visible to the backpressure scan.
                slot.state.store(STATE_ACTIVE, Ordering::Release);
                return Some(idx);
            }
        }
        None
    }

    /// Detaches a consumer: resets the slot cursor and returns the slot to
    /// `Free`, removing it from the backpressure minimum and making it
    /// reusable.
    pub fn detach_consumer(&self, idx: usize) {
        let slot = &self.slots[idx];
        slot.tail.store(0, Ordering::Relaxed);
        slot.state.store(STATE_FREE, Ordering::Release);
    }

    /// Minimum cursor across `Active` slots, falling back to `head` when no
    /// consumer is active (broadcasting into the void is allowed).
    fn min_active_tail(&self, head: u64) -> u64 {
        let mut min_tail = head;
        for slot in &self.slots {
            if slot.state.load(Ordering::Acquire) == STATE_ACTIVE {
                let tail = slot.tail.load(Ordering::Acquire);
                if tail < min_tail {
                    min_tail = tail;
                }
            }
        }
        min_tail
    }

    /// Attempts to push an item, gated by the slowest active consumer.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread/process calls this method (single producer)
    /// - The ring has been properly initialized
    #[inline]
    pub unsafe fn push(&self, item: T) -> Result<(), T> {
        // Own cursor: relaxed is fine, the producer alone writes it.
        let head = self.producer.head.load(Ordering::Relaxed);
        let min_tail = self.min_active_tail(head);

        if head.wrapping_sub(min_tail) >= N as u64 {
            return Err(item); // slowest active consumer hasn't caught up
        }

        // SAFETY: head - min_active_tail < N, so no active consumer's cursor
        // still references the physical slot at `head & MASK`; the producer
        // owns it until the head store below publishes it.
        unsafe {
            let slot_ptr = self.buffer[Self::slot_index(head)].value.get();
            std::ptr::write(slot_ptr, MaybeUninit::new(item));
        }

        // Publish the item: release pairs with consumers' acquire head loads.
        self.producer
            .head
            .store(head.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Attempts to pop the next item for the consumer owning `idx`.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - `idx` was returned by [`BroadcastRing::attach_consumer`] and has not
    ///   been detached
    /// - Only the owning consumer calls per-slot methods for `idx`
    #[inline]
    pub unsafe fn pop(&self, idx: usize) -> Option<T>
    where
        T: Copy,
    {
        let head = self.producer.head.load(Ordering::Acquire);
        let tail = self.slots[idx].tail.load(Ordering::Relaxed);

        if tail >= head {
            return None; // queue is empty for this consumer
        }

        // SAFETY: tail < head, so the producer published this slot (acquire
        // pairs with its release store), and the backpressure rule keeps it
        // from being overwritten while this cursor still references it.
        // T: Copy makes the duplicating read sound across the fan-out.
        let item = unsafe {
            let slot_ptr = self.buffer[Self::slot_index(tail)].value.get();
            std::ptr::read(slot_ptr).assume_init()
        };

        // Publish the advance: release pairs with the producer's acquire
        // scan of this cursor.
        self.slots[idx]
            .tail
            .store(tail.wrapping_add(1), Ordering::Release);

        Some(item)
    }

    /// Like [`BroadcastRing::pop`], but writes into caller-supplied storage.
    ///
    /// # Safety
    ///
    /// Same contract as [`BroadcastRing::pop`].
    #[inline]
    pub unsafe fn try_pop(&self, out: &mut T, idx: usize) -> bool
    where
        T: Copy,
    {
        match unsafe { self.pop(idx) } {
            Some(item) => {
                *out = item;
                true
            }
            None => false,
        }
    }

    /// Reads the next item for `idx` without advancing its cursor.
    ///
    /// # Safety
    ///
    /// Same contract as [`BroadcastRing::pop`].
    #[inline]
    pub unsafe fn peek(&self, idx: usize) -> Option<T>
    where
        T: Copy,
    {
        let head = self.producer.head.load(Ordering::Acquire);
        let tail = self.slots[idx].tail.load(Ordering::Relaxed);

        if tail >= head {
            return None;
        }

        // SAFETY: same slot-ownership argument as pop; the cursor is not
        // advanced, so the slot stays protected.
        let item = unsafe {
            let slot_ptr = self.buffer[Self::slot_index(tail)].value.get();
            std::ptr::read(slot_ptr).assume_init()
        };
        Some(item)
    }

    /// Best-effort count of items the consumer owning `idx` has not yet
    /// popped, clamped to `[0, N]`.
    #[inline]
    pub fn count_snapshot_for(&self, idx: usize) -> usize {
        let head = self.producer.head.load(Ordering::Acquire);
        let tail = self.slots[idx].tail.load(Ordering::Relaxed);

        let diff = head.wrapping_sub(tail);
        if diff > N as u64 {
            return N;
        }
        diff as usize
    }

    /// Best-effort count of items still unread by the slowest active
    /// consumer, clamped to `[0, N]`.
    #[inline]
    pub fn count_snapshot(&self) -> usize {
        let head = self.producer.head.load(Ordering::Acquire);
        let min_tail = self.min_active_tail(head);

        let diff = head.wrapping_sub(min_tail);
        if diff > N as u64 {
            return N;
        }
        diff as usize
    }
}

impl<T, const N: usize, const C: usize> Default for BroadcastRing<T, N, C> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: BroadcastRing is Send because all fields are Send.
unsafe impl<T: Send, const N: usize, const C: usize> Send for BroadcastRing<T, N, C> {}

// SAFETY: BroadcastRing is Sync because concurrent access is mediated by
// atomics: the head cursor and per-slot state/tail pairs carry the
// Release/Acquire edges described in the module docs.
unsafe impl<T: Send, const N: usize, const C: usize> Sync for BroadcastRing<T, N, C> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_seeds_cursor_at_head() {
        let ring: BroadcastRing<u64, 8, 4> = BroadcastRing::new();
        unsafe {
            ring.push(1).unwrap();
            ring.push(2).unwrap();
        }

        let idx = ring.attach_consumer().unwrap();
        assert_eq!(ring.slots[idx].tail.load(Ordering::Relaxed), 2);
        // Late joiner sees nothing from the backlog.
        assert_eq!(unsafe { ring.pop(idx) }, None);

        unsafe { ring.push(3).unwrap() };
        assert_eq!(unsafe { ring.pop(idx) }, Some(3));
    }

    #[test]
    fn attach_exhausts_slot_table() {
        let ring: BroadcastRing<u64, 8, 2> = BroadcastRing::new();
        let a = ring.attach_consumer().unwrap();
        let b = ring.attach_consumer().unwrap();
        assert_ne!(a, b);
        assert_eq!(ring.attach_consumer(), None);

        ring.detach_consumer(a);
        let c = ring.attach_consumer().unwrap();
        assert_eq!(c, a); // freed slot index is reused
    }

    #[test]
    fn every_consumer_sees_the_same_sequence() {
        let ring: BroadcastRing<u64, 8, 3> = BroadcastRing::new();
        let a = ring.attach_consumer().unwrap();
        let b = ring.attach_consumer().unwrap();

        unsafe {
            for i in 0..5 {
                ring.push(i).unwrap();
            }
            for i in 0..5 {
                assert_eq!(ring.pop(a), Some(i));
            }
            assert_eq!(ring.pop(a), None);
            for i in 0..5 {
                assert_eq!(ring.pop(b), Some(i));
            }
            assert_eq!(ring.pop(b), None);
        }
    }

    #[test]
    fn slowest_consumer_gates_the_producer() {
        let ring: BroadcastRing<u64, 4, 2> = BroadcastRing::new();
        let slow = ring.attach_consumer().unwrap();
        let fast = ring.attach_consumer().unwrap();

        unsafe {
            for i in 0..4 {
                ring.push(i).unwrap();
            }
            // The fast consumer drains everything.
            for i in 0..4 {
                assert_eq!(ring.pop(fast), Some(i));
            }
            // The stalled consumer still pins the storage.
            assert_eq!(ring.push(4), Err(4));

            assert_eq!(ring.pop(slow), Some(0));
            assert!(ring.push(4).is_ok());
        }
    }

    #[test]
    fn detach_releases_backpressure() {
        let ring: BroadcastRing<u64, 4, 2> = BroadcastRing::new();
        let stalled = ring.attach_consumer().unwrap();

        unsafe {
            for i in 0..4 {
                ring.push(i).unwrap();
            }
            assert_eq!(ring.push(4), Err(4));

            ring.detach_consumer(stalled);
            assert!(ring.push(4).is_ok());
        }
    }

    #[test]
    fn push_without_consumers_never_fills() {
        let ring: BroadcastRing<u64, 4, 2> = BroadcastRing::new();
        unsafe {
            for i in 0..100 {
                assert!(ring.push(i).is_ok(), "push {i} failed with no consumers");
            }
        }
        assert_eq!(ring.count_snapshot(), 0);
    }

    #[test]
    fn peek_and_try_pop_per_slot() {
        let ring: BroadcastRing<u64, 4, 1> = BroadcastRing::new();
        let idx = ring.attach_consumer().unwrap();

        unsafe {
            assert_eq!(ring.peek(idx), None);
            ring.push(11).unwrap();
            assert_eq!(ring.peek(idx), Some(11));
            assert_eq!(ring.peek(idx), Some(11));

            let mut out = 0u64;
            assert!(ring.try_pop(&mut out, idx));
            assert_eq!(out, 11);
            assert!(!ring.try_pop(&mut out, idx));
        }
    }

    #[test]
    fn count_snapshots_track_slowest_and_per_slot() {
        let ring: BroadcastRing<u64, 8, 2> = BroadcastRing::new();
        let a = ring.attach_consumer().unwrap();
        let b = ring.attach_consumer().unwrap();

        unsafe {
            for i in 0..6 {
                ring.push(i).unwrap();
            }
            assert_eq!(ring.count_snapshot(), 6);

            for _ in 0..4 {
                ring.pop(a).unwrap();
            }
            assert_eq!(ring.count_snapshot_for(a), 2);
            assert_eq!(ring.count_snapshot_for(b), 6);
            assert_eq!(ring.count_snapshot(), 6); // b is the slowest
        }
    }
}
