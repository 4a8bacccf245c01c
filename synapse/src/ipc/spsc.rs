//! Lock-free SPSC queue over POSIX shared memory.
//!
//! The same ring algorithm as [`crate::sync::spsc`], placed in a shared
//! memory mapping so the producer and consumer may live in different
//! processes. Role claims are stored inside the shared ring, so "one
//! producer, one consumer" is enforced across process boundaries: a second
//! process attempting to open the producer end gets
//! [`ClaimError::ProducerClaimed`].
//!
//! # Example
//!
//! ```no_run
//! use synapse::ipc::shmem::ShmPath;
//! use synapse::ipc::spsc::{Consumer, Producer};
//!
//! let path = ShmPath::new("/my-queue")?;
//!
//! // Process A: create the queue and take the producer end
//! let producer = Producer::<u64, 1024, _>::create(path.clone())?;
//! producer.push(42).expect("queue full");
//!
//! // Process B: open the queue and take the consumer end
//! let consumer = Consumer::<u64, 1024, _>::open(path)?;
//! assert_eq!(consumer.pop(), Some(42));
//! # Ok::<(), synapse::ipc::QueueError>(())
//! ```
//!
//! Either endpoint can be the [`Creator`] (unlinks on drop) or [`Opener`]
//! (no unlink). See [`shmem`](super::shmem) for cleanup semantics.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │ InitMarker      (64-byte aligned)      │
//! ├────────────────────────────────────────┤
//! │ ProducerState   (head, cache, claim)   │
//! ├────────────────────────────────────────┤
//! │ ConsumerState   (tail, cache, claim)   │
//! ├────────────────────────────────────────┤
//! │ Padding         (false sharing guard)  │
//! ├────────────────────────────────────────┤
//! │ Buffer: [Slot<T>; N]                   │
//! ├────────────────────────────────────────┤
//! │ Padding         (false sharing guard)  │
//! └────────────────────────────────────────┘
//! ```

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use super::QueueError;
use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode, ShmPath, ShmSafe};
use crate::claim::ClaimError;
use crate::payload::Payload;
use crate::spsc::ring::{ConsumerState, ProducerState, Ring, RingCell, Slot};

const INIT_MAGIC: u64 = 0x5359_4E53_5053_4331; // "SYNSPSC1" in ASCII
const INIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

// SAFETY: RingCell is repr(transparent) around UnsafeCell<T>; the Role
// phantom doesn't affect layout, and access safety comes from the SPSC
// protocol, not the type system.
unsafe impl<T: ShmSafe, Role> ShmSafe for RingCell<T, Role> {}

// SAFETY: repr(C), cache-line aligned, all fields atomics or role cells of
// primitives.
unsafe impl ShmSafe for ProducerState {}

// SAFETY: as for ProducerState.
unsafe impl ShmSafe for ConsumerState {}

// SAFETY: repr(C); the payload bound guarantees the cell contents are plain
// pointer-free bytes.
unsafe impl<T: Payload> ShmSafe for Slot<T> {}

// SAFETY: repr(C) aggregate of ShmSafe parts.
unsafe impl<T: Payload, const N: usize> ShmSafe for Ring<T, N> {}

/// Initialization marker for cross-process synchronization.
#[repr(C)]
#[repr(align(64))]
struct InitMarker(AtomicU64);

// SAFETY: repr(C), single atomic field.
unsafe impl ShmSafe for InitMarker {}

/// IPC-specific queue layout with init marker and trailing padding.
#[repr(C)]
struct IpcQueue<T: Payload, const N: usize> {
    /// Magic value indicating initialization is complete.
    init: InitMarker,

    /// The core ring buffer.
    ring: Ring<T, N>,

    /// Prevent false sharing with adjacent shared memory regions.
    _padding_tail: [u8; 64],
}

// SAFETY: repr(C) aggregate of ShmSafe parts.
unsafe impl<T: Payload, const N: usize> ShmSafe for IpcQueue<T, N> {}

/// Zero-sized proof that initialization succeeded.
///
/// Can only be constructed by successfully waiting for init, providing
/// evidence that the ring is ready for use.
#[derive(Debug, Clone, Copy)]
struct InitProof(());

impl<T: Payload, const N: usize> IpcQueue<T, N> {
    /// Initializes the queue directly inside shared memory.
    ///
    /// The buffer slots stay uninitialized (they hold `MaybeUninit`), and the
    /// init magic is stored last with release ordering so openers never
    /// observe a half-initialized ring.
    fn init_shared(uninit: &mut std::mem::MaybeUninit<Self>) {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: `uninit` is an exclusive reference to the mapping; field
        // projections through addr_of_mut never materialize references to
        // uninitialized data.
        unsafe {
            std::ptr::addr_of_mut!((*ptr).init).write(InitMarker(AtomicU64::new(0)));
            std::ptr::addr_of_mut!((*ptr).ring.producer).write(ProducerState::new());
            std::ptr::addr_of_mut!((*ptr).ring.consumer).write(ConsumerState::new());

            (*ptr).init.0.store(INIT_MAGIC, Ordering::Release);
        }
    }

    /// Spins until the queue is initialized or the timeout expires.
    ///
    /// # Safety
    ///
    /// `ptr` must point to mapped shared memory that stays mapped for the
    /// duration of this call.
    unsafe fn wait_for_init(ptr: *const Self, timeout: std::time::Duration) -> Option<InitProof> {
        let start = std::time::Instant::now();
        loop {
            if unsafe { (*ptr).init.0.load(Ordering::Acquire) } == INIT_MAGIC {
                return Some(InitProof(()));
            }
            if start.elapsed() >= timeout {
                return None;
            }
            std::hint::spin_loop();
        }
    }
}

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

/// Write end of the shared-memory SPSC queue.
///
/// Holds the producer claim inside the shared ring; dropping the handle
/// releases the claim so another process (or a later handle) can take over.
pub struct Producer<T: Payload, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: Payload, const N: usize, Mode: ShmMode> core::fmt::Debug for Producer<T, N, Mode> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Producer").finish_non_exhaustive()
    }
}

impl<T: Payload, const N: usize> Producer<T, N, Creator> {
    /// Creates a new queue in fresh shared memory and claims the producer
    /// role. Unlinks the object on drop.
    ///
    /// # Errors
    ///
    /// `EEXIST` (path exists), `EACCES` (permissions), `ENOMEM` (resources).
    pub fn create(path: ShmPath) -> Result<Self, QueueError> {
        let () = CapacityCheck::<N>::OK;

        let shm = Shm::<IpcQueue<T, N>, Creator>::create(path, IpcQueue::<T, N>::init_shared)?;
        claim_producer(shm)
    }
}

impl<T: Payload, const N: usize> Producer<T, N, Opener> {
    /// Opens an existing queue and claims the producer role. Does not unlink
    /// on drop. Waits up to 1 s for the creator to finish initialization.
    ///
    /// # Errors
    ///
    /// `ENOENT` (doesn't exist), size mismatch, init timeout, or
    /// [`ClaimError::ProducerClaimed`] when another live handle holds the
    /// role.
    pub fn open(path: ShmPath) -> Result<Self, QueueError> {
        let () = CapacityCheck::<N>::OK;

        let shm = Shm::<IpcQueue<T, N>, Opener>::open(path.clone())?;
        // SAFETY: Shm::open guarantees the pointer is valid and mapped.
        let Some(_proof) =
            (unsafe { IpcQueue::<T, N>::wait_for_init(&raw const *shm, INIT_TIMEOUT) })
        else {
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            }
            .into());
        };
        claim_producer(shm)
    }
}

fn claim_producer<T: Payload, const N: usize, Mode: ShmMode>(
    shm: Shm<IpcQueue<T, N>, Mode>,
) -> Result<Producer<T, N, Mode>, QueueError> {
    if !shm.ring.try_claim_producer() {
        return Err(ClaimError::ProducerClaimed.into());
    }
    Ok(Producer {
        shm,
        _unsync: PhantomData,
    })
}

impl<T: Payload, const N: usize, Mode: ShmMode> Producer<T, N, Mode> {
    /// Attempts to push an item onto the queue (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full, allowing retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: the claim inside the shared ring guarantees this is the
        // only producer handle in any process, and the handle is !Sync.
        unsafe { self.shm.ring.push(item) }
    }

    /// Best-effort count of queued items, clamped to `[0, N]`.
    #[inline]
    #[must_use]
    pub fn count_snapshot(&self) -> usize {
        self.shm.ring.count_snapshot()
    }
}

impl<T: Payload, const N: usize, Mode: ShmMode> Drop for Producer<T, N, Mode> {
    fn drop(&mut self) {
        self.shm.ring.release_producer();
    }
}

/// Read end of the shared-memory SPSC queue.
///
/// Same claim semantics as [`Producer`], for the consumer role.
pub struct Consumer<T: Payload, const N: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: Payload, const N: usize> Consumer<T, N, Creator> {
    /// Creates a new queue in fresh shared memory and claims the consumer
    /// role. Useful for daemons creating an "inbox".
    ///
    /// # Errors
    ///
    /// See [`Producer::create`].
    pub fn create(path: ShmPath) -> Result<Self, QueueError> {
        let () = CapacityCheck::<N>::OK;

        let shm = Shm::<IpcQueue<T, N>, Creator>::create(path, IpcQueue::<T, N>::init_shared)?;
        claim_consumer(shm)
    }
}

impl<T: Payload, const N: usize> Consumer<T, N, Opener> {
    /// Opens an existing queue and claims the consumer role.
    ///
    /// # Errors
    ///
    /// See [`Producer::open`]; reports [`ClaimError::ConsumerClaimed`] when
    /// the role is taken.
    pub fn open(path: ShmPath) -> Result<Self, QueueError> {
        let () = CapacityCheck::<N>::OK;

        let shm = Shm::<IpcQueue<T, N>, Opener>::open(path.clone())?;
        // SAFETY: Shm::open guarantees the pointer is valid and mapped.
        let Some(_proof) =
            (unsafe { IpcQueue::<T, N>::wait_for_init(&raw const *shm, INIT_TIMEOUT) })
        else {
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            }
            .into());
        };
        claim_consumer(shm)
    }
}

fn claim_consumer<T: Payload, const N: usize, Mode: ShmMode>(
    shm: Shm<IpcQueue<T, N>, Mode>,
) -> Result<Consumer<T, N, Mode>, QueueError> {
    if !shm.ring.try_claim_consumer() {
        return Err(ClaimError::ConsumerClaimed.into());
    }
    Ok(Consumer {
        shm,
        _unsync: PhantomData,
    })
}

impl<T: Payload, const N: usize, Mode: ShmMode> Consumer<T, N, Mode> {
    /// Attempts to pop an item from the queue (wait-free).
    ///
    /// Returns `None` if the queue is empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: the claim inside the shared ring guarantees this is the
        // only consumer handle in any process, and the handle is !Sync.
        unsafe { self.shm.ring.pop() }
    }

    /// Pops into caller-supplied storage.
    ///
    /// Returns `false` and leaves `out` untouched if the queue is empty.
    #[inline]
    pub fn try_pop(&self, out: &mut T) -> bool {
        // SAFETY: as for pop.
        unsafe { self.shm.ring.try_pop(out) }
    }

    /// Reads the next item without consuming it.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        // SAFETY: as for pop.
        unsafe { self.shm.ring.peek() }
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
        self.shm.ring.count_snapshot()
    }
}

impl<T: Payload, const N: usize, Mode: ShmMode> Drop for Consumer<T, N, Mode> {
    fn drop(&mut self) {
        self.shm.ring.release_consumer();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustix::shm;

    fn fresh(path: &str) -> ShmPath {
        let path = ShmPath::new(path).unwrap();
        let _ = shm::unlink(path.as_str());
        path
    }

    #[test]
    fn basic_push_pop_across_endpoints() {
        let path = fresh("/synapse-ipc-spsc-basic");
        let producer = Producer::<u64, 8, _>::create(path.clone()).unwrap();
        let consumer = Consumer::<u64, 8, _>::open(path).unwrap();

        assert!(producer.push(42).is_ok());
        assert_eq!(consumer.pop(), Some(42));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn full_and_refill() {
        let path = fresh("/synapse-ipc-spsc-full");
        let producer = Producer::<u64, 4, _>::create(path.clone()).unwrap();
        let consumer = Consumer::<u64, 4, _>::open(path).unwrap();

        for i in 0..4 {
            assert!(producer.push(i).is_ok(), "failed to push item {i}");
        }
        assert_eq!(producer.push(999), Err(999));

        assert_eq!(consumer.pop(), Some(0));
        assert!(producer.push(4).is_ok());
        assert_eq!(producer.push(1000), Err(1000));
    }

    #[test]
    fn producer_role_is_exclusive_across_handles() {
        let path = fresh("/synapse-ipc-spsc-claim");
        let producer = Producer::<u64, 8, _>::create(path.clone()).unwrap();

        match Producer::<u64, 8, _>::open(path.clone()) {
            Err(QueueError::Claim(ClaimError::ProducerClaimed)) => {}
            other => panic!("expected ProducerClaimed, got {other:?}"),
        }

        drop(producer);
        // The creator unlinked the object on drop; nothing left to open.
        assert!(matches!(
            Producer::<u64, 8, _>::open(path),
            Err(QueueError::Shm(ShmError::Posix { .. }))
        ));
    }

    #[test]
    fn consumer_creates_producer_opens() {
        let path = fresh("/synapse-ipc-spsc-inbox");
        let consumer = Consumer::<u64, 8, _>::create(path.clone()).unwrap();
        let producer = Producer::<u64, 8, _>::open(path).unwrap();

        producer.push(100).unwrap();
        producer.push(200).unwrap();

        assert_eq!(consumer.pop(), Some(100));
        assert_eq!(consumer.peek(), Some(200));
        assert_eq!(consumer.pop(), Some(200));
        assert_eq!(consumer.pop(), None);
    }

    #[test]
    fn released_role_is_reclaimable() {
        let path = fresh("/synapse-ipc-spsc-reclaim");
        let _producer = Producer::<u64, 8, _>::create(path.clone()).unwrap();

        let consumer = Consumer::<u64, 8, _>::open(path.clone()).unwrap();
        assert!(matches!(
            Consumer::<u64, 8, _>::open(path.clone()),
            Err(QueueError::Claim(ClaimError::ConsumerClaimed))
        ));

        drop(consumer);
        assert!(Consumer::<u64, 8, _>::open(path).is_ok());
    }

    #[test]
    fn struct_payload_round_trip() {
        #[derive(Clone, Copy, PartialEq, Debug, crate::Payload)]
        #[repr(C)]
        struct Sample {
            seq: u64,
            value: f64,
        }

        let path = fresh("/synapse-ipc-spsc-struct");
        let producer = Producer::<Sample, 8, _>::create(path.clone()).unwrap();
        let consumer = Consumer::<Sample, 8, _>::open(path).unwrap();

        let sample = Sample {
            seq: 1,
            value: 2.5,
        };
        producer.push(sample).unwrap();
        assert_eq!(consumer.pop(), Some(sample));
    }
}
