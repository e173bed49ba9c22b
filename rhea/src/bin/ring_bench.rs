//! Ring throughput benchmark.
//!
//! Usage:
//!     cargo run --release --bin ring_bench
//!
//! Environment variables:
//!     PRODUCER_CPU=0  Pin the (first) producer to CPU 0 (default: 0)
//!     CONSUMER_CPU=2  Pin the consumer to CPU 2 (default: 2)

use std::env;
use std::hint;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use rhea::sync::{mpsc, spsc};

const RING_SIZE: usize = 1 << 14;
const GRANULARITY: usize = 1 << 8;
const ITERATIONS: u64 = 1 << 24;

type Payload = u64;

fn get_cpu_affinity() -> (Option<usize>, Option<usize>) {
    let producer_cpu = env::var("PRODUCER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(0));
    let consumer_cpu = env::var("CONSUMER_CPU")
        .ok()
        .and_then(|s| s.parse().ok())
        .or(Some(2));
    (producer_cpu, consumer_cpu)
}

fn pin_to_cpu(cpu: Option<usize>) {
    if let Some(id) = cpu {
        core_affinity::set_for_current(core_affinity::CoreId { id });
    }
}

/// Producer-side throughput: the writer never waits, so this measures the
/// raw cost of the versioned write while a consumer drains what it can.
fn bench_spsc_throughput(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    let (producer, consumer) = spsc::channel::<Payload, RING_SIZE, GRANULARITY>();

    let ready = Arc::new(AtomicBool::new(false));
    let ready_clone = ready.clone();

    let consumer_thread = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);
        ready_clone.store(true, Ordering::Release);

        let mut observed = 0u64;
        loop {
            if let Some(value) = consumer.pop() {
                observed += 1;
                if value == ITERATIONS {
                    break;
                }
            } else {
                hint::spin_loop();
            }
        }
        observed
    });

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    pin_to_cpu(producer_cpu);

    let start = Instant::now();
    for i in 1..=ITERATIONS {
        producer.push(i);
    }
    let observed = consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    let writes_per_ms = u128::from(ITERATIONS) * 1_000_000 / elapsed.as_nanos();
    println!(
        "spsc: {} writes/ms ({} of {} observed by the consumer)",
        writes_per_ms, observed, ITERATIONS
    );
}

/// Contended multi-producer throughput: every producer hammers the shared
/// cursor; the consumer drains until it has seen each producer's final
/// record.
fn bench_mpsc_throughput(producer_cpu: Option<usize>, consumer_cpu: Option<usize>) {
    const PRODUCERS: u64 = 3;
    let per_producer = ITERATIONS / PRODUCERS;

    let (producer, consumer) = mpsc::channel::<Payload, RING_SIZE, GRANULARITY>();

    let ready = Arc::new(AtomicBool::new(false));
    let done_producers = Arc::new(AtomicU64::new(0));

    let ready_clone = ready.clone();
    let done_clone = done_producers.clone();
    let consumer_thread = std::thread::spawn(move || {
        pin_to_cpu(consumer_cpu);
        ready_clone.store(true, Ordering::Release);

        let mut observed = 0u64;
        loop {
            if let Some(_value) = consumer.pop() {
                observed += 1;
            } else if done_clone.load(Ordering::Acquire) == PRODUCERS {
                // No fresh record and no producer left: the ring is drained.
                break;
            } else {
                hint::spin_loop();
            }
        }
        observed
    });

    while !ready.load(Ordering::Acquire) {
        hint::spin_loop();
    }

    let start = Instant::now();
    let mut handles = Vec::new();
    for p in 0..PRODUCERS {
        let producer = producer.clone();
        let done = done_producers.clone();
        let cpu = producer_cpu.map(|base| base + p as usize);
        handles.push(std::thread::spawn(move || {
            pin_to_cpu(cpu);
            for i in 1..=per_producer {
                producer.push(p * per_producer + i);
            }
            done.fetch_add(1, Ordering::Release);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let observed = consumer_thread.join().unwrap();
    let elapsed = start.elapsed();

    let writes_per_ms = u128::from(per_producer * PRODUCERS) * 1_000_000 / elapsed.as_nanos();
    println!(
        "mpsc: {} writes/ms across {} producers ({} observed by the consumer)",
        writes_per_ms, PRODUCERS, observed
    );
}

fn main() {
    rhea::trace::init_tracing();
    let (producer_cpu, consumer_cpu) = get_cpu_affinity();

    println!(
        "rhea rings (slots={}, granularity={}, iters={}):",
        RING_SIZE, GRANULARITY, ITERATIONS
    );
    bench_spsc_throughput(producer_cpu, consumer_cpu);
    bench_mpsc_throughput(producer_cpu, consumer_cpu);
}
