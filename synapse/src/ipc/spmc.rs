//! Lock-free SPMC broadcast queue over POSIX shared memory.
//!
//! The broadcast ring from [`crate::sync::spmc`] placed in a shared memory
//! mapping: one producer process fans items out to up to `C` consumer
//! processes. Consumer attachment claims a slot in the shared consumer
//! table, so slot exclusivity and the slowest-active-consumer backpressure
//! rule hold across process boundaries.
//!
//! # Example
//!
//! ```no_run
//! use synapse::ipc::shmem::ShmPath;
//! use synapse::ipc::spmc::{Consumer, Producer};
//!
//! let path = ShmPath::new("/market-data")?;
//!
//! // Publisher process
//! let producer = Producer::<u64, 1024, 16, _>::create(path.clone())?;
//! producer.push(42).expect("queue full");
//!
//! // Subscriber processes (each claims its own slot)
//! let consumer = Consumer::<u64, 1024, 16, _>::open(path)?;
//! # Ok::<(), synapse::ipc::QueueError>(())
//! ```
//!
//! A consumer that attaches after items were pushed starts at the producer's
//! current position and never sees the backlog.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use super::QueueError;
use super::shmem::{Creator, Opener, Shm, ShmError, ShmMode, ShmPath, ShmSafe};
use crate::claim::ClaimError;
use crate::payload::Payload;
use crate::spmc::ring::{BroadcastRing, ConsumerSlot, ProducerState, Slot};

const INIT_MAGIC: u64 = 0x5359_4E53_504D_4331; // "SYNSPMC1" in ASCII
const INIT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

// SAFETY: repr(C), cache-line aligned, atomics only.
unsafe impl ShmSafe for ConsumerSlot {}

// SAFETY: as for ConsumerSlot.
unsafe impl ShmSafe for ProducerState {}

// SAFETY: repr(C); the payload bound guarantees the cell contents are plain
// pointer-free bytes.
unsafe impl<T: Payload> ShmSafe for Slot<T> {}

// SAFETY: repr(C) aggregate of ShmSafe parts.
unsafe impl<T: Payload, const N: usize, const C: usize> ShmSafe for BroadcastRing<T, N, C> {}

/// Initialization marker for cross-process synchronization.
#[repr(C)]
#[repr(align(64))]
struct InitMarker(AtomicU64);

// SAFETY: repr(C), single atomic field.
unsafe impl ShmSafe for InitMarker {}

/// IPC-specific queue layout with init marker and trailing padding.
#[repr(C)]
struct IpcQueue<T: Payload, const N: usize, const C: usize> {
    /// Magic value indicating initialization is complete.
    init: InitMarker,

    /// The core broadcast ring.
    ring: BroadcastRing<T, N, C>,

    /// Prevent false sharing with adjacent shared memory regions.
    _padding_tail: [u8; 64],
}

// SAFETY: repr(C) aggregate of ShmSafe parts.
unsafe impl<T: Payload, const N: usize, const C: usize> ShmSafe for IpcQueue<T, N, C> {}

/// Zero-sized proof that initialization succeeded.
#[derive(Debug, Clone, Copy)]
struct InitProof(());

impl<T: Payload, const N: usize, const C: usize> IpcQueue<T, N, C> {
    /// Initializes the queue directly inside shared memory.
    ///
    /// Producer state and every consumer slot are written before the init
    /// magic is released, so openers never observe a half-built table.
    fn init_shared(uninit: &mut std::mem::MaybeUninit<Self>) {
        let ptr = uninit.as_mut_ptr();
        // SAFETY: `uninit` is an exclusive reference to the mapping; field
        // projections through addr_of_mut never materialize references to
        // uninitialized data.
        unsafe {
            std::ptr::addr_of_mut!((*ptr).init).write(InitMarker(AtomicU64::new(0)));
            std::ptr::addr_of_mut!((*ptr).ring.producer).write(ProducerState::new());

            let slots = std::ptr::addr_of_mut!((*ptr).ring.slots).cast::<ConsumerSlot>();
            for i in 0..C {
                slots.add(i).write(ConsumerSlot::new());
            }

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

/// Write end of the shared-memory broadcast queue.
pub struct Producer<T: Payload, const N: usize, const C: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N, C>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: Payload, const N: usize, const C: usize> Producer<T, N, C, Creator> {
    /// Creates a new queue in fresh shared memory and claims the producer
    /// role. Unlinks the object on drop.
    ///
    /// # Errors
    ///
    /// `EEXIST` (path exists), `EACCES` (permissions), `ENOMEM` (resources).
    pub fn create(path: ShmPath) -> Result<Self, QueueError> {
        let () = ParamsCheck::<N, C>::OK;

        let shm =
            Shm::<IpcQueue<T, N, C>, Creator>::create(path, IpcQueue::<T, N, C>::init_shared)?;
        claim_producer(shm)
    }
}

impl<T: Payload, const N: usize, const C: usize> Producer<T, N, C, Opener> {
    /// Opens an existing queue and claims the producer role. Waits up to 1 s
    /// for the creator to finish initialization.
    ///
    /// # Errors
    ///
    /// `ENOENT`, size mismatch, init timeout, or
    /// [`ClaimError::ProducerClaimed`].
    pub fn open(path: ShmPath) -> Result<Self, QueueError> {
        let () = ParamsCheck::<N, C>::OK;

        let shm = Shm::<IpcQueue<T, N, C>, Opener>::open(path.clone())?;
        // SAFETY: Shm::open guarantees the pointer is valid and mapped.
        let Some(_proof) =
            (unsafe { IpcQueue::<T, N, C>::wait_for_init(&raw const *shm, INIT_TIMEOUT) })
        else {
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            }
            .into());
        };
        claim_producer(shm)
    }
}

fn claim_producer<T: Payload, const N: usize, const C: usize, Mode: ShmMode>(
    shm: Shm<IpcQueue<T, N, C>, Mode>,
) -> Result<Producer<T, N, C, Mode>, QueueError> {
    if !shm.ring.try_claim_producer() {
        return Err(ClaimError::ProducerClaimed.into());
    }
    Ok(Producer {
        shm,
        _unsync: PhantomData,
    })
}

impl<T: Payload, const N: usize, const C: usize, Mode: ShmMode> Producer<T, N, C, Mode> {
    /// Attempts to push an item to every active consumer.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` when the slowest active consumer is a full
    /// capacity behind; succeeds unconditionally with zero active consumers.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        // SAFETY: the claim inside the shared ring guarantees this is the
        // only producer handle in any process, and the handle is !Sync.
        unsafe { self.shm.ring.push(item) }
    }

    /// Best-effort count of items unread by the slowest active consumer,
    /// clamped to `[0, N]`.
    #[inline]
    #[must_use]
    pub fn count_snapshot(&self) -> usize {
        self.shm.ring.count_snapshot()
    }
}

impl<T: Payload, const N: usize, const C: usize, Mode: ShmMode> Drop for Producer<T, N, C, Mode> {
    fn drop(&mut self) {
        self.shm.ring.release_producer();
    }
}

/// Read end of the shared-memory broadcast queue, bound to one slot of the
/// shared consumer table.
pub struct Consumer<T: Payload, const N: usize, const C: usize, Mode: ShmMode> {
    shm: Shm<IpcQueue<T, N, C>, Mode>,
    slot: usize,
    _unsync: PhantomUnsync,
}

impl<T: Payload, const N: usize, const C: usize> Consumer<T, N, C, Creator> {
    /// Creates a new queue in fresh shared memory and attaches the first
    /// consumer. Unlinks the object on drop.
    ///
    /// # Errors
    ///
    /// See [`Producer::create`].
    pub fn create(path: ShmPath) -> Result<Self, QueueError> {
        let () = ParamsCheck::<N, C>::OK;

        let shm =
            Shm::<IpcQueue<T, N, C>, Creator>::create(path, IpcQueue::<T, N, C>::init_shared)?;
        attach_consumer(shm)
    }
}

impl<T: Payload, const N: usize, const C: usize> Consumer<T, N, C, Opener> {
    /// Opens an existing queue and attaches a consumer in a free slot.
    ///
    /// The new consumer's cursor starts at the producer's current position.
    ///
    /// # Errors
    ///
    /// See [`Producer::open`]; reports [`ClaimError::NoFreeSlot`] when all
    /// `C` slots are occupied.
    pub fn open(path: ShmPath) -> Result<Self, QueueError> {
        let () = ParamsCheck::<N, C>::OK;

        let shm = Shm::<IpcQueue<T, N, C>, Opener>::open(path.clone())?;
        // SAFETY: Shm::open guarantees the pointer is valid and mapped.
        let Some(_proof) =
            (unsafe { IpcQueue::<T, N, C>::wait_for_init(&raw const *shm, INIT_TIMEOUT) })
        else {
            return Err(ShmError::InitTimeout {
                path: path.to_string(),
            }
            .into());
        };
        attach_consumer(shm)
    }
}

fn attach_consumer<T: Payload, const N: usize, const C: usize, Mode: ShmMode>(
    shm: Shm<IpcQueue<T, N, C>, Mode>,
) -> Result<Consumer<T, N, C, Mode>, QueueError> {
    let Some(slot) = shm.ring.attach_consumer() else {
        return Err(ClaimError::NoFreeSlot.into());
    };
    Ok(Consumer {
        shm,
        slot,
        _unsync: PhantomData,
    })
}

impl<T: Payload, const N: usize, const C: usize, Mode: ShmMode> Consumer<T, N, C, Mode> {
    /// Attempts to pop the next unread item for this consumer (wait-free).
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        // SAFETY: this handle exclusively owns `self.slot` across every
        // process (attach handed it out once), and the handle is !Sync.
        unsafe { self.shm.ring.pop(self.slot) }
    }

    /// Pops into caller-supplied storage.
    ///
    /// Returns `false` and leaves `out` untouched when nothing is unread.
    #[inline]
    pub fn try_pop(&self, out: &mut T) -> bool {
        // SAFETY: as for pop.
        unsafe { self.shm.ring.try_pop(out, self.slot) }
    }

    /// Reads the next unread item without consuming it.
    #[inline]
    #[must_use]
    pub fn peek(&self) -> Option<T> {
        // SAFETY: as for pop.
        unsafe { self.shm.ring.peek(self.slot) }
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
        self.shm.ring.count_snapshot_for(self.slot)
    }
}

impl<T: Payload, const N: usize, const C: usize, Mode: ShmMode> Drop for Consumer<T, N, C, Mode> {
    fn drop(&mut self) {
        self.shm.ring.detach_consumer(self.slot);
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
    fn broadcast_across_endpoints() {
        let path = fresh("/synapse-ipc-spmc-basic");
        let producer = Producer::<u64, 8, 4, _>::create(path.clone()).unwrap();
        let a = Consumer::<u64, 8, 4, _>::open(path.clone()).unwrap();
        let b = Consumer::<u64, 8, 4, _>::open(path).unwrap();

        for i in 0..5 {
            producer.push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(a.pop(), Some(i));
        }
        for i in 0..5 {
            assert_eq!(b.pop(), Some(i));
        }
        assert_eq!(a.pop(), None);
        assert_eq!(b.pop(), None);
    }

    #[test]
    fn late_joiner_skips_backlog() {
        let path = fresh("/synapse-ipc-spmc-late");
        let producer = Producer::<u64, 8, 4, _>::create(path.clone()).unwrap();
        let early = Consumer::<u64, 8, 4, _>::open(path.clone()).unwrap();

        producer.push(1).unwrap();

        let late = Consumer::<u64, 8, 4, _>::open(path).unwrap();
        assert_eq!(early.pop(), Some(1));
        assert_eq!(late.pop(), None);
    }

    #[test]
    fn slot_table_exhaustion() {
        let path = fresh("/synapse-ipc-spmc-slots");
        let _producer = Producer::<u64, 8, 2, _>::create(path.clone()).unwrap();
        let a = Consumer::<u64, 8, 2, _>::open(path.clone()).unwrap();
        let _b = Consumer::<u64, 8, 2, _>::open(path.clone()).unwrap();

        assert!(matches!(
            Consumer::<u64, 8, 2, _>::open(path.clone()),
            Err(QueueError::Claim(ClaimError::NoFreeSlot))
        ));

        drop(a);
        assert!(Consumer::<u64, 8, 2, _>::open(path).is_ok());
    }

    #[test]
    fn stalled_consumer_applies_backpressure() {
        let path = fresh("/synapse-ipc-spmc-stall");
        let producer = Producer::<u64, 4, 2, _>::create(path.clone()).unwrap();
        let stalled = Consumer::<u64, 4, 2, _>::open(path).unwrap();

        for i in 0..4 {
            producer.push(i).unwrap();
        }
        assert_eq!(producer.push(4), Err(4));

        assert_eq!(stalled.pop(), Some(0));
        assert!(producer.push(4).is_ok());
    }
}
