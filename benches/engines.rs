use criterion::{black_box, criterion_group, criterion_main, Criterion};
use quotaguard::{Engine, EngineRegistry, Policy, SystemClock};
use std::sync::Arc;

// Generous quotas so the hot path measured is admit-and-allow, with window
// sizes small enough that eviction work is part of the loop.
fn admit_throughput(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = EngineRegistry::new(Arc::new(SystemClock::new()));

    let cases = [
        ("token_bucket", Policy::token_bucket(100_000, 50_000.0)),
        ("leaky_bucket", Policy::leaky_bucket(100_000, 50_000.0)),
        ("fixed_window", Policy::fixed_window(100_000, 1_000)),
        ("sliding_window_log", Policy::sliding_window_log(100_000, 1_000)),
        ("sliding_window_counter", Policy::sliding_window_counter(100_000, 1_000, 10)),
    ];

    let mut group = c.benchmark_group("admit");
    for (name, policy) in cases {
        let engine = registry.engine_for(&policy).unwrap();
        group.bench_function(name, |b| {
            b.iter(|| {
                rt.block_on(async {
                    black_box(engine.admit(black_box("bench")).await.unwrap());
                })
            })
        });
    }
    group.finish();
}

fn admit_across_keys(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = EngineRegistry::new(Arc::new(SystemClock::new()));
    let engine = registry.engine_for(&Policy::token_bucket(100_000, 50_000.0)).unwrap();
    let keys: Vec<String> = (0..1024).map(|i| format!("principal-{}", i)).collect();

    let mut index = 0usize;
    c.bench_function("admit/distinct_keys", |b| {
        b.iter(|| {
            let key = &keys[index % keys.len()];
            index = index.wrapping_add(1);
            rt.block_on(async {
                black_box(engine.admit(black_box(key)).await.unwrap());
            })
        })
    });
}

criterion_group!(benches, admit_throughput, admit_across_keys);
criterion_main!(benches);
