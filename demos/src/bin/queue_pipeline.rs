// demos/src/bin/queue_pipeline.rs
//
// Market-data producers feed a bounded pooled queue while a single consumer
// reserves, processes and commits entries. A SyncCounterSet tracks the
// outstanding ticks per symbol and an EarliestTimeTracker follows the
// oldest pending timestamp.
//
// Run this demo with:
//   cargo run --bin queue_pipeline
//   (from the demos directory)

use order_runtime::prelude::*;
use std::sync::Arc;
use std::thread;
use tracing::info;

const PRODUCERS: usize = 3;
const TICKS_PER_PRODUCER: usize = 2_000;
const SYMBOLS: [&str; 3] = ["ES", "NQ", "CL"];

#[derive(Debug, Clone)]
struct Tick {
    symbol: &'static str,
    price: u64,
}

fn main() {
    tracing_subscriber::fmt::init();
    info!("Queue pipeline demo");

    let queue: BoundedPooledQueue<Tick> =
        BoundedPooledQueue::new(QueueConfig::new(256).with_backing_up_watermark(192));
    let tracker = Arc::new(EarliestTimeTracker::new());
    let connection = queue.connect(tracker.clone());
    let counters = SyncCounterRegistry::new();

    thread::scope(|scope| {
        for producer in 0..PRODUCERS {
            let queue = &queue;
            let counters = &counters;
            scope.spawn(move || produce(producer, queue, counters));
        }

        let mut processed = 0usize;
        let mut retries = 0usize;
        while processed < PRODUCERS * TICKS_PER_PRODUCER {
            match queue.try_dequeue() {
                Ok(Some(reservation)) => {
                    let Ok(tick) = reservation.commit() else {
                        break;
                    };
                    if let Some(set) = counters.get(tick.symbol) {
                        set.remove_tick();
                    }
                    processed += 1;
                    if processed % 1_000 == 0 {
                        info!(
                            processed,
                            pending = queue.len(),
                            earliest = ?tracker.earliest_for(connection),
                            last_price = tick.price,
                            "consumer progress"
                        );
                    }
                }
                Ok(None) => {
                    retries += 1;
                    thread::yield_now();
                }
                Err(err) => {
                    info!(%err, "consumer stopping");
                    break;
                }
            }
        }
        info!(processed, retries, "consumer finished");
    });

    for symbol in SYMBOLS {
        if let Some(set) = counters.get(symbol) {
            info!(symbol, counters = %set.snapshot(), completed = set.is_completed(), "symbol state");
        }
    }
    info!(
        all_completed = counters.all_completed(),
        pooled_nodes = queue.pool().count(),
        activity = tracker.activity(connection),
        "pipeline drained"
    );
    queue.terminate();
}

fn produce(producer: usize, queue: &BoundedPooledQueue<Tick>, counters: &SyncCounterRegistry) {
    for i in 0..TICKS_PER_PRODUCER {
        let symbol = SYMBOLS[(producer + i) % SYMBOLS.len()];
        counters.get_or_create(symbol).add_tick();

        let mut tick = Tick {
            symbol,
            price: 4_500 + (i % 50) as u64,
        };
        loop {
            match queue.try_enqueue(tick, current_time_nanos()) {
                Ok(()) => break,
                Err(TryEnqueueError::Full(back)) => {
                    tick = back;
                    thread::yield_now();
                }
                Err(_) => return,
            }
        }
    }
    info!(producer, "producer done");
}
