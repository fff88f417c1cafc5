//! Performance benchmarks for replisync-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use replisync_engine::{
    KvRead, Mutation, Operation, Patch, PendingMutation, ReadTransaction, Replica, ScanOptions,
    Store,
};
use serde_json::{json, Value};

fn seeded_store(size: usize) -> Store {
    let mut store = Store::new();
    let patches: Vec<Patch> = (0..size)
        .map(|i| Patch::set(format!("todo/{i:06}"), json!({"text": "item", "n": i}), 1))
        .collect();
    store.apply_patches(&patches);
    store
}

fn pending(id: u64, key: String) -> PendingMutation {
    PendingMutation::new(Mutation {
        id,
        name: "bench".into(),
        args: Value::Null,
        operations: vec![Operation::set(key, json!(id))],
    })
}

fn bench_store_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_reads");

    for pending_count in [0usize, 10, 100].iter() {
        let mut store = seeded_store(10_000);
        for i in 0..*pending_count {
            store.push_pending(pending(i as u64, format!("todo/{:06}", i * 7)));
        }

        group.bench_with_input(
            BenchmarkId::new("get_through_overlays", pending_count),
            pending_count,
            |b, _| b.iter(|| store.get(black_box("todo/005000")).cloned()),
        );
    }

    group.bench_function("snapshot", |b| {
        let store = seeded_store(10_000);
        b.iter(|| black_box(store.snapshot()))
    });

    group.finish();
}

fn bench_scans(c: &mut Criterion) {
    let mut group = c.benchmark_group("scans");

    for size in [100usize, 1_000, 10_000].iter() {
        let store = seeded_store(*size);
        group.bench_with_input(BenchmarkId::new("scan_keys", size), size, |b, _| {
            b.iter(|| {
                let tx = ReadTransaction::new(store.snapshot(), "bench");
                tx.scan("todo/").keys().count()
            })
        });

        group.bench_with_input(BenchmarkId::new("scan_first_20_values", size), size, |b, _| {
            b.iter(|| {
                let tx = ReadTransaction::new(store.snapshot(), "bench");
                tx.scan(ScanOptions::new().prefix("todo/").limit(20))
                    .values()
                    .to_array()
            })
        });
    }

    group.finish();
}

fn bench_patches(c: &mut Criterion) {
    let mut group = c.benchmark_group("patches");

    for size in [10usize, 100, 1_000].iter() {
        let patches: Vec<Patch> = (0..*size)
            .map(|i| Patch::set(format!("todo/{i:06}"), json!(i), 2))
            .collect();

        group.bench_with_input(BenchmarkId::new("apply", size), size, |b, _| {
            let base = seeded_store(10_000);
            b.iter(|| {
                let mut store = base.clone();
                store.apply_patches(black_box(&patches))
            })
        });
    }

    group.finish();
}

fn bench_subscriptions(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscriptions");

    for count in [10usize, 100].iter() {
        let replica = Replica::new("bench");
        let handles: Vec<_> = (0..*count)
            .map(|i| {
                let key = format!("todo/{:06}", i);
                replica.subscribe(move |tx| Ok(tx.get(&key)), |_value: Option<Value>| {})
            })
            .collect();

        let mut id = 0u64;
        group.bench_with_input(BenchmarkId::new("commit_fan_out", count), count, |b, _| {
            b.iter(|| {
                id += 1;
                replica.commit(pending(id, format!("todo/{:06}", id % 10)));
            })
        });

        for handle in handles {
            handle.unsubscribe();
        }
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_store_reads,
    bench_scans,
    bench_patches,
    bench_subscriptions
);
criterion_main!(benches);
