//! Core lock-free SPSC ring buffer algorithm.
//!
//! This module provides the fundamental ring buffer used by both the
//! in-process ([`crate::sync::spsc`]) and shared-memory ([`crate::ipc::spsc`])
//! SPSC queues.
//!
//! Cursors are monotonically increasing `u64` counters; the physical slot for
//! a cursor is `cursor & (N - 1)`, which requires `N` to be a power of two.
//! `head - tail` is therefore the exact number of unread items without any
//! wrap handling short of 2^64 pushes.
//!
//! # Safety
//!
//! The push/pop/peek methods are unsafe because they require the caller to
//! uphold the SPSC invariant: exactly one producer and one consumer, with no
//! concurrent access to either role. The safe frontends enforce this through
//! the atomic claim gates ([`Ring::try_claim_producer`] and friends) plus
//! move-only handle types.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Role marker: fields with this role are owned exclusively by the producer.
pub struct ProducerRole;

/// Role marker: fields with this role are owned exclusively by the consumer.
pub struct ConsumerRole;

/// Role marker: buffer slots whose ownership transfers via the SPSC protocol.
pub struct SlotRole;

/// Interior-mutable cell with a role marker for nominal type safety.
///
/// The `Role` parameter doesn't affect runtime behavior; it exists purely to
/// make different logical "kinds" of cells into distinct types at compile
/// time.
#[repr(transparent)]
pub struct RingCell<T, Role>(UnsafeCell<T>, PhantomData<Role>);

impl<T, Role> RingCell<T, Role> {
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value), PhantomData)
    }

    pub const fn get(&self) -> &UnsafeCell<T> {
        &self.0
    }
}

// SAFETY: RingCell is Sync because the SPSC protocol guarantees each cell is
// accessed by exactly one role at a time; the Release/Acquire cursor stores
// provide the synchronization barrier between writer and reader.
unsafe impl<T: Send, Role> Sync for RingCell<T, Role> {}
unsafe impl<T: Send, Role> Send for RingCell<T, Role> {}

/// Cache cell owned exclusively by the producer.
pub type ProducerCache<T> = RingCell<T, ProducerRole>;

/// Cache cell owned exclusively by the consumer.
pub type ConsumerCache<T> = RingCell<T, ConsumerRole>;

/// Buffer slot cell with ownership governed by the SPSC protocol.
pub type SlotCell<T> = RingCell<T, SlotRole>;

/// Producer-side state: head cursor, cached tail, and the producer claim gate.
#[repr(C)]
#[repr(align(64))]
pub struct ProducerState {
    /// Write cursor (count of items ever pushed).
    /// Advanced only by the producer, read by the consumer.
    pub head: AtomicU64,

    /// Cached copy of the consumer's tail cursor, refreshed only when the
    /// ring looks full. Avoids touching the consumer's cache line on every
    /// push.
    pub cached_tail: ProducerCache<u64>,

    /// Whether a producer handle currently holds this role.
    pub claimed: AtomicBool,
}

impl ProducerState {
    pub const fn new() -> Self {
        Self {
            head: AtomicU64::new(0),
            cached_tail: ProducerCache::new(0),
            claimed: AtomicBool::new(false),
        }
    }
}

impl Default for ProducerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Consumer-side state: tail cursor, cached head, and the consumer claim gate.
#[repr(C)]
#[repr(align(64))]
pub struct ConsumerState {
    /// Read cursor (count of items ever popped).
    /// Advanced only by the consumer, read by the producer.
    pub tail: AtomicU64,

    /// Cached copy of the producer's head cursor, refreshed only when the
    /// ring looks empty.
    pub cached_head: ConsumerCache<u64>,

    /// Whether a consumer handle currently holds this role.
    pub claimed: AtomicBool,
}

impl ConsumerState {
    pub const fn new() -> Self {
        Self {
            tail: AtomicU64::new(0),
            cached_head: ConsumerCache::new(0),
            claimed: AtomicBool::new(false),
        }
    }
}

impl Default for ConsumerState {
    fn default() -> Self {
        Self::new()
    }
}

/// A single slot in the ring buffer.
#[repr(C)]
pub struct Slot<T> {
    pub value: SlotCell<MaybeUninit<T>>,
}

/// Core SPSC ring buffer structure.
///
/// Contains only the algorithm state; frontends wrap it in heap or
/// shared-memory storage.
#[repr(C)]
pub struct Ring<T, const N: usize> {
    /// Producer state (head cursor + cached tail + claim gate).
    pub producer: ProducerState,

    /// Consumer state (tail cursor + cached head + claim gate).
    pub consumer: ConsumerState,

    /// Prevent false sharing between consumer state and buffer.
    pub _padding: [u8; 64],

    /// Ring buffer slots.
    pub buffer: [Slot<T>; N],
}

impl<T, const N: usize> Ring<T, N> {
    /// Compile-time assertion that the capacity is a nonzero power of two,
    /// which makes the `& MASK` index translation exact.
    pub const CAPACITY_OK: () = assert!(
        N > 0 && N.is_power_of_two(),
        "queue capacity must be a nonzero power of two"
    );

    const MASK: u64 = N as u64 - 1;

    /// Translates a monotonic cursor to a physical slot index.
    #[inline]
    pub const fn slot_index(cursor: u64) -> usize {
        (cursor & Self::MASK) as usize
    }

    /// Creates a new ring with zeroed cursors and uninitialized slots.
    pub fn new() -> Self {
        let () = Self::CAPACITY_OK;
        Self {
            producer: ProducerState::new(),
            consumer: ConsumerState::new(),
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

    /// Attempts to claim the consumer role. Fails fast if already held.
    #[inline]
    pub fn try_claim_consumer(&self) -> bool {
        self.consumer
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Releases the consumer role so a future handle can claim it.
    #[inline]
    pub fn release_consumer(&self) {
        self.consumer.claimed.store(false, Ordering::Release);
    }

    /// Attempts to push an item onto the queue.
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

        // SAFETY: Producer has exclusive access to its cached_tail field.
        let mut cached_tail = unsafe { *self.producer.cached_tail.get().get() };

        // Check fullness against the cached value first.
        if head.wrapping_sub(cached_tail) >= N as u64 {
            // Refresh from the real tail (acquire to pair with the consumer's
            // release advance).
            cached_tail = self.consumer.tail.load(Ordering::Acquire);
            // SAFETY: Producer has exclusive write access to cached_tail.
            unsafe {
                *self.producer.cached_tail.get().get() = cached_tail;
            }

            if head.wrapping_sub(cached_tail) >= N as u64 {
                return Err(item); // Queue is full
            }
        }

        // SAFETY: The producer owns the slot at `head & MASK` because:
        // - head hasn't been published yet (the store below happens after)
        // - head - tail < N, so the consumer isn't reading this slot
        unsafe {
            let slot_ptr = self.buffer[Self::slot_index(head)].value.get().get();
            std::ptr::write(slot_ptr, MaybeUninit::new(item));
        }

        // Publish the item: release pairs with the consumer's acquire load.
        self.producer
            .head
            .store(head.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Attempts to pop an item from the queue.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - Only one thread/process calls this method (single consumer)
    /// - The ring has been properly initialized
    #[inline]
    pub unsafe fn pop(&self) -> Option<T> {
        // Own cursor: relaxed is fine, the consumer alone writes it.
        let tail = self.consumer.tail.load(Ordering::Relaxed);

        // SAFETY: Consumer has exclusive access to its cached_head field.
        let mut cached_head = unsafe { *self.consumer.cached_head.get().get() };

        if cached_head <= tail {
            // Refresh from the real head (acquire so the slot write below is
            // visible before we read it).
            cached_head = self.producer.head.load(Ordering::Acquire);
            // SAFETY: Consumer has exclusive write access to cached_head.
            unsafe {
                *self.consumer.cached_head.get().get() = cached_head;
            }

            if cached_head <= tail {
                return None; // Queue is empty
            }
        }

        // SAFETY: tail < head, so the producer has fully written this slot
        // (the acquire load above synchronizes with its release store), and
        // it won't overwrite it until tail advances past it.
        let item = unsafe {
            let slot_ptr = self.buffer[Self::slot_index(tail)].value.get().get();
            std::ptr::read(slot_ptr).assume_init()
        };

        // Publish the advance: release pairs with the producer's acquire
        // refresh of its cached tail.
        self.consumer
            .tail
            .store(tail.wrapping_add(1), Ordering::Release);

        Some(item)
    }

    /// Like [`Ring::pop`], but writes into caller-supplied storage.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ring::pop`].
    #[inline]
    pub unsafe fn try_pop(&self, out: &mut T) -> bool {
        match unsafe { self.pop() } {
            Some(item) => {
                *out = item;
                true
            }
            None => false,
        }
    }

    /// Reads the next item without advancing the tail cursor.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ring::pop`].
    #[inline]
    pub unsafe fn peek(&self) -> Option<T>
    where
        T: Copy,
    {
        let tail = self.consumer.tail.load(Ordering::Relaxed);
        let head = self.producer.head.load(Ordering::Acquire);

        if tail >= head {
            return None;
        }

        // SAFETY: same slot-ownership argument as pop; T: Copy makes the
        // duplicating read sound (no double-drop is possible).
        let item = unsafe {
            let slot_ptr = self.buffer[Self::slot_index(tail)].value.get().get();
            std::ptr::read(slot_ptr).assume_init()
        };
        Some(item)
    }

    /// Best-effort count of queued items, clamped to `[0, N]`.
    ///
    /// The two cursors are read at slightly different instants, so the raw
    /// difference can momentarily exceed the capacity; the clamp keeps the
    /// estimate inside the legal range.
    #[inline]
    pub fn count_snapshot(&self) -> usize {
        let head = self.producer.head.load(Ordering::Acquire);
        let tail = self.consumer.tail.load(Ordering::Acquire);

        let diff = head.wrapping_sub(tail);
        if diff > N as u64 {
            return N;
        }
        diff as usize
    }
}

impl<T, const N: usize> Default for Ring<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: Ring is Send because all fields are Send (AtomicU64, AtomicBool,
// RingCell).
unsafe impl<T: Send, const N: usize> Send for Ring<T, N> {}

// SAFETY: Ring is Sync because concurrent access is mediated by atomics:
// - head/tail are AtomicU64 with Release/Acquire ordering
// - Buffer slots are protected by the SPSC invariant (see RingCell)
unsafe impl<T: Send, const N: usize> Sync for Ring<T, N> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_to_index_masks() {
        assert_eq!(Ring::<u64, 8>::slot_index(0), 0);
        assert_eq!(Ring::<u64, 8>::slot_index(7), 7);
        assert_eq!(Ring::<u64, 8>::slot_index(8), 0);
        assert_eq!(Ring::<u64, 8>::slot_index(13), 5);
        assert_eq!(Ring::<u64, 8>::slot_index(u64::MAX), 7);
    }

    #[test]
    fn state_blocks_on_separate_cache_lines() {
        assert_eq!(std::mem::align_of::<ProducerState>(), 64);
        assert_eq!(std::mem::align_of::<ConsumerState>(), 64);
        assert!(std::mem::size_of::<ProducerState>() <= 64);
        assert!(std::mem::size_of::<ConsumerState>() <= 64);

        // ProducerState(64) + ConsumerState(64) + padding(64) precede the buffer.
        assert_eq!(std::mem::offset_of!(Ring<u64, 16>, buffer), 192);
    }

    #[test]
    fn push_pop_round_trip() {
        let ring: Ring<u64, 8> = Ring::new();
        unsafe {
            assert!(ring.push(1).is_ok());
            assert!(ring.push(2).is_ok());
            assert_eq!(ring.pop(), Some(1));
            assert_eq!(ring.pop(), Some(2));
            assert_eq!(ring.pop(), None);
        }
    }

    #[test]
    fn full_then_pop_frees_a_slot() {
        let ring: Ring<u64, 4> = Ring::new();
        unsafe {
            for i in 0..4 {
                assert!(ring.push(i).is_ok());
            }
            assert_eq!(ring.push(99), Err(99));
            assert_eq!(ring.pop(), Some(0));
            assert!(ring.push(4).is_ok());
            assert_eq!(ring.push(100), Err(100));
        }
    }

    #[test]
    fn peek_does_not_advance() {
        let ring: Ring<u64, 4> = Ring::new();
        unsafe {
            assert_eq!(ring.peek(), None);
            ring.push(7).unwrap();
            assert_eq!(ring.peek(), Some(7));
            assert_eq!(ring.peek(), Some(7));
            assert_eq!(ring.pop(), Some(7));
            assert_eq!(ring.peek(), None);
        }
    }

    #[test]
    fn try_pop_writes_out_param() {
        let ring: Ring<u64, 4> = Ring::new();
        let mut out = 0u64;
        unsafe {
            assert!(!ring.try_pop(&mut out));
            ring.push(41).unwrap();
            assert!(ring.try_pop(&mut out));
            assert_eq!(out, 41);
            assert!(!ring.try_pop(&mut out));
        }
    }

    #[test]
    fn count_snapshot_stays_in_range() {
        let ring: Ring<u64, 4> = Ring::new();
        assert_eq!(ring.count_snapshot(), 0);
        unsafe {
            ring.push(1).unwrap();
            ring.push(2).unwrap();
            assert_eq!(ring.count_snapshot(), 2);
            ring.push(3).unwrap();
            ring.push(4).unwrap();
            assert_eq!(ring.count_snapshot(), 4);
            ring.pop().unwrap();
            assert_eq!(ring.count_snapshot(), 3);
        }
    }

    #[test]
    fn claim_gates_are_exclusive() {
        let ring: Ring<u64, 4> = Ring::new();
        assert!(ring.try_claim_producer());
        assert!(!ring.try_claim_producer());
        ring.release_producer();
        assert!(ring.try_claim_producer());

        assert!(ring.try_claim_consumer());
        assert!(!ring.try_claim_consumer());
        ring.release_consumer();
        assert!(ring.try_claim_consumer());
    }

    #[test]
    fn wraps_across_many_rounds() {
        let ring: Ring<u64, 4> = Ring::new();
        unsafe {
            for round in 0..10 {
                for i in 0..4 {
                    assert!(ring.push(round * 10 + i).is_ok());
                }
                for i in 0..4 {
                    assert_eq!(ring.pop(), Some(round * 10 + i));
                }
                assert_eq!(ring.pop(), None);
            }
        }
    }
}
