//! Cross-thread stress scenarios for the broadcast queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use synapse::ClaimError;
use synapse::sync::spmc::SpmcQueue;

#[derive(Clone, Copy, PartialEq, Eq, Debug, synapse::Payload)]
#[repr(C)]
struct Message {
    sequence: u64,
    origin: u32,
    body: [u8; 16],
}

fn message(sequence: u64) -> Message {
    let mut body = [0u8; 16];
    body[0] = sequence as u8;
    body[15] = (sequence >> 8) as u8;
    Message {
        sequence,
        origin: 7,
        body,
    }
}

#[test]
fn concurrent_fanout_is_gap_free_and_identical() {
    const COUNT: u64 = 50_000;
    const CONSUMERS: usize = 3;

    let queue = SpmcQueue::<Message, 256, 4>::new();
    let producer = queue.make_producer().unwrap();

    let mut handles = Vec::new();
    for _ in 0..CONSUMERS {
        let consumer = queue.make_consumer().unwrap();
        handles.push(std::thread::spawn(move || {
            let mut next = 0u64;
            while next < COUNT {
                if let Some(msg) = consumer.pop() {
                    assert_eq!(msg.sequence, next, "gap or reorder in fan-out");
                    assert_eq!(msg, message(next), "payload corruption");
                    next += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        }));
    }

    let producer_thread = std::thread::spawn(move || {
        for i in 0..COUNT {
            let mut item = message(i);
            while let Err(returned) = producer.push(item) {
                item = returned;
                std::hint::spin_loop();
            }
        }
    });

    producer_thread.join().unwrap();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn backpressure_stalls_producer_until_consumer_progresses() {
    let queue = SpmcQueue::<u64, 4, 2>::new();
    let producer = queue.make_producer().unwrap();
    let stalled = queue.make_consumer().unwrap();

    // Fill the ring, then prove the (capacity + 1)-th push fails while the
    // consumer sits still.
    for i in 0..4 {
        assert!(producer.push(i).is_ok());
    }
    assert_eq!(producer.push(4), Err(4));

    let unblocked = Arc::new(AtomicBool::new(false));

    let producer_thread = {
        let unblocked = Arc::clone(&unblocked);
        std::thread::spawn(move || {
            let mut item = 4u64;
            while let Err(returned) = producer.push(item) {
                item = returned;
                std::hint::spin_loop();
            }
            unblocked.store(true, Ordering::Release);
        })
    };

    // Give the producer a moment to spin against the full ring.
    std::thread::sleep(Duration::from_millis(20));
    assert!(!unblocked.load(Ordering::Acquire));

    assert_eq!(stalled.pop(), Some(0));
    producer_thread.join().unwrap();
    assert!(unblocked.load(Ordering::Acquire));
}

#[test]
fn consumers_attach_and_detach_under_load() {
    const ROUNDS: u64 = 200;

    let queue = SpmcQueue::<u64, 64, 4>::new();
    let producer = queue.make_producer().unwrap();

    // A long-lived consumer keeps draining so the producer never stalls for
    // long; short-lived consumers churn slots concurrently.
    let drainer = queue.make_consumer().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let drained = Arc::new(AtomicU64::new(0));

    let drain_thread = {
        let stop = Arc::clone(&stop);
        let drained = Arc::clone(&drained);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                if drainer.pop().is_some() {
                    drained.fetch_add(1, Ordering::Relaxed);
                } else {
                    std::hint::spin_loop();
                }
            }
        })
    };

    let churn_queue = queue.clone();
    let churn_stop = Arc::clone(&stop);
    let churn_thread = std::thread::spawn(move || {
        while !churn_stop.load(Ordering::Acquire) {
            match churn_queue.make_consumer() {
                Ok(consumer) => {
                    let _ = consumer.pop();
                    drop(consumer);
                }
                Err(ClaimError::NoFreeSlot) => std::thread::yield_now(),
                Err(err) => panic!("unexpected claim error: {err}"),
            }
        }
    });

    for i in 0..ROUNDS {
        let mut item = i;
        while let Err(returned) = producer.push(item) {
            item = returned;
            std::hint::spin_loop();
        }
    }

    // Let the drainer catch up before stopping.
    while drained.load(Ordering::Relaxed) < ROUNDS {
        std::hint::spin_loop();
    }
    stop.store(true, Ordering::Release);
    drain_thread.join().unwrap();
    churn_thread.join().unwrap();

    assert_eq!(drained.load(Ordering::Relaxed), ROUNDS);
}

#[test]
fn scripted_capacity_two_scenario() {
    // attach A; push X; attach B; A sees X; B does not.
    let queue = SpmcQueue::<u64, 2, 2>::new();
    let producer = queue.make_producer().unwrap();

    let a = queue.make_consumer().unwrap();
    producer.push(0xDEAD).unwrap();
    let b = queue.make_consumer().unwrap();

    assert_eq!(a.pop(), Some(0xDEAD));
    assert_eq!(b.pop(), None);
}
