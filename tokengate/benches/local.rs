use std::hint::black_box;
use criterion::{criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;
use tokengate::{
    distributed::{DistributedBucketStore, MemoryStore},
    BucketPolicy,
    LocalBucketStore,
    RateLimiter,
};

fn benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let policy = BucketPolicy { capacity: u64::MAX, refill_rate: 1 };

    let local = LocalBucketStore::new(policy).unwrap();
    c.bench_function("local check (hot client)", |b| b.iter(
        || local.check(black_box("client-1"))
    ));

    let clients: Vec<String> = (0..10_000).map(|i| format!("client-{i}")).collect();
    let mut next = 0;
    c.bench_function("local check (10k clients)", |b| b.iter(|| {
        next = (next + 1) % clients.len();
        local.check(black_box(&clients[next]))
    }));

    c.bench_function("local status", |b| b.iter(
        || local.status(black_box("client-1"))
    ));

    let limiter = RateLimiter::local(policy).unwrap();
    c.bench_function("facade check (local)", |b| b.to_async(&rt).iter(
        || async { limiter.check(black_box("client-1")).await.unwrap() }
    ));

    let shared = RateLimiter::new(DistributedBucketStore::new(MemoryStore::new(), policy).unwrap());
    c.bench_function("facade check (distributed, memory)", |b| b.to_async(&rt).iter(
        || async { shared.check(black_box("client-1")).await.unwrap() }
    ));
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
