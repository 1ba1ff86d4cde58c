use criterion::{criterion_group, criterion_main};


use counters::register_benchmarks as register_counter_benchmarks;
use list::register_benchmarks as register_list_benchmarks;
use queue::register_benchmarks as register_queue_benchmarks;

criterion_group!(
    benches,
    register_list_benchmarks,
    register_queue_benchmarks,
    register_counter_benchmarks,
);

criterion_main!(benches);
