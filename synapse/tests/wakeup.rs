//! Blocking wake-up composed from a non-blocking queue plus a semaphore.
//!
//! The queues never block by design; this is the intended composition for
//! callers that want to sleep instead of spin: post the semaphore after each
//! successful push, wait on it before each pop attempt.

use std::sync::Arc;
use std::time::Duration;

use synapse::sem::{SemError, Semaphore};
use synapse::sync::spsc::SpscQueue;

#[test]
fn semaphore_paced_consumer_receives_everything_in_order() {
    const COUNT: u64 = 1_000;

    let queue = SpscQueue::<u64, 128>::new();
    let producer = queue.make_producer().unwrap();
    let consumer = queue.make_consumer().unwrap();
    let items_ready = Arc::new(Semaphore::new(0, None).unwrap());

    let consumer_thread = {
        let items_ready = Arc::clone(&items_ready);
        std::thread::spawn(move || {
            for expected in 0..COUNT {
                items_ready
                    .wait(Some(Duration::from_secs(5)))
                    .expect("producer stopped posting");
                // A post guarantees an item is already visible.
                assert_eq!(consumer.pop(), Some(expected));
            }
            assert_eq!(consumer.pop(), None);
        })
    };

    for i in 0..COUNT {
        let mut item = i;
        while let Err(returned) = producer.push(item) {
            item = returned;
            std::thread::yield_now();
        }
        items_ready.post().unwrap();
    }

    consumer_thread.join().unwrap();
}

#[test]
fn try_wait_mirrors_queue_emptiness() {
    let queue = SpscQueue::<u64, 8>::new();
    let producer = queue.make_producer().unwrap();
    let consumer = queue.make_consumer().unwrap();
    let items_ready = Semaphore::new(0, None).unwrap();

    assert!(matches!(items_ready.try_wait(), Err(SemError::WouldBlock)));
    assert_eq!(consumer.pop(), None);

    producer.push(5).unwrap();
    items_ready.post().unwrap();

    items_ready.try_wait().unwrap();
    assert_eq!(consumer.pop(), Some(5));
    assert!(matches!(items_ready.try_wait(), Err(SemError::WouldBlock)));
}
