//! SPSC and SPMC queue throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin queue_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin first consumer to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use minstant::Instant;

use synapse::platform;
use synapse::sync::spmc::SpmcQueue;
use synapse::sync::spsc::SpscQueue;

const QUEUE_SIZE: usize = 1 << 16;
const ITERATIONS: u64 = 1 << 24;
const FANOUT_CONSUMERS: usize = 2;

type Payload = u64;

fn cpu_from_env(var: &str, default: usize) -> Option<usize> {
    env::var(var)
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(default))
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        platform::pin_current_thread(id);
    }
}

fn report(label: &str, items: u64, elapsed: std::time::Duration) {
    let rate = items as f64 / elapsed.as_secs_f64();
    println!(
        "{label}: {items} items in {:.3}s ({:.2} M items/s)",
        elapsed.as_secs_f64(),
        rate / 1e6
    );
}

fn bench_spsc(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let queue = SpscQueue::<Payload, QUEUE_SIZE>::new();
    let producer = queue.make_producer().unwrap();
    let consumer = queue.make_consumer().unwrap();

    let ready = Arc::new(AtomicBool::new(false));

    let consumer_thread = {
        let ready = Arc::clone(&ready);
        std::thread::spawn(move || {
            pin_to_cpu(consumer_cpu);
            ready.store(true, Ordering::Release);

            for expected in 0..ITERATIONS {
                loop {
                    if let Some(value) = consumer.pop() {
                        assert_eq!(value, expected, "data corruption");
                        break;
                    }
                    hint::spin_loop();
                }
            }
        })
    };

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }
    pin_to_cpu(producer_cpu);

    let start = Instant::now();
    for i in 0..ITERATIONS {
        let mut item = i;
        while let Err(returned) = producer.push(item) {
            item = returned;
            hint::spin_loop();
        }
    }
    consumer_thread.join().unwrap();
    report("spsc", ITERATIONS, start.elapsed());
}

fn bench_spmc(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let queue = SpmcQueue::<Payload, QUEUE_SIZE, 4>::new();
    let producer = queue.make_producer().unwrap();

    let ready = Arc::new(AtomicBool::new(false));
    let mut consumer_threads = Vec::new();

    for n in 0..FANOUT_CONSUMERS {
        let consumer = queue.make_consumer().unwrap();
        let ready = Arc::clone(&ready);
        consumer_threads.push(std::thread::spawn(move || {
            // Only the first consumer gets a dedicated pin.
            if n == 0 {
                pin_to_cpu(consumer_cpu);
            }
            if n == FANOUT_CONSUMERS - 1 {
                ready.store(true, Ordering::Release);
            }

            for expected in 0..ITERATIONS {
                loop {
                    if let Some(value) = consumer.pop() {
                        assert_eq!(value, expected, "fan-out corruption");
                        break;
                    }
                    hint::spin_loop();
                }
            }
        }));
    }

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }
    pin_to_cpu(producer_cpu);

    let start = Instant::now();
    for i in 0..ITERATIONS {
        let mut item = i;
        while let Err(returned) = producer.push(item) {
            item = returned;
            hint::spin_loop();
        }
    }
    for thread in consumer_threads {
        thread.join().unwrap();
    }
    report(
        &format!("spmc x{FANOUT_CONSUMERS}"),
        ITERATIONS,
        start.elapsed(),
    );
}

fn main() {
    synapse::trace::init_tracing();

    let topology = platform::CpuTopology::detect();
    println!(
        "cores: {} logical / {} physical (smt: {})",
        topology.logical_cores, topology.physical_cores, topology.has_smt
    );

    let producer_cpu = cpu_from_env("PRODUCER_CPU", 0);
    let consumer_cpu = cpu_from_env("CONSUMER_CPU", 2);

    bench_spsc(producer_cpu, consumer_cpu);
    bench_spmc(producer_cpu, consumer_cpu);
}
