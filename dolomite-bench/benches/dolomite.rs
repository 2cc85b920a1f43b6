use criterion::{criterion_group, criterion_main, Criterion};
use dolomite_bench::{run_all_benchmarks, BenchConfig};
use std::time::Duration;

fn benchmarks(c: &mut Criterion) {
    let config = BenchConfig::default();
    run_all_benchmarks(c, &config);
}

fn configured() -> Criterion {
    let config = BenchConfig::default();
    Criterion::default()
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(config.measurement_time)
        .sample_size(50)
}

criterion_group! {
    name = benches;
    config = configured();
    targets = benchmarks
}
criterion_main!(benches);
