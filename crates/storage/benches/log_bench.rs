use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use keel_storage::LogStore;
use rand::Rng;
use tempfile::TempDir;

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_store_put");

    group.bench_function("put_64b_values", |b| {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::open(dir.path(), false).unwrap();
        let value = vec![0xabu8; 64];
        let mut ts = 0i64;
        b.iter(|| {
            ts += 1;
            let key = format!("bench-key-{}", ts % 10_000);
            store.put(key.as_bytes(), &value, ts).unwrap();
        });
    });

    group.bench_function("put_4k_values_sync", |b| {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::open(dir.path(), true).unwrap();
        let value = vec![0xcdu8; 4096];
        let mut ts = 0i64;
        b.iter(|| {
            ts += 1;
            let key = format!("bench-key-{}", ts % 1_000);
            store.put(key.as_bytes(), &value, ts).unwrap();
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("log_store_get");

    group.bench_function("get_hot_key", |b| {
        let dir = TempDir::new().unwrap();
        let mut store = LogStore::open(dir.path(), false).unwrap();
        for i in 0..10_000i64 {
            let key = format!("bench-key-{}", i);
            store.put(key.as_bytes(), b"benchmark-value", i).unwrap();
        }
        let mut rng = rand::thread_rng();
        b.iter_batched(
            || format!("bench-key-{}", rng.gen_range(0..10_000)),
            |key| store.get(key.as_bytes()).unwrap(),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_get);
criterion_main!(benches);
