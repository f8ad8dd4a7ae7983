//! Log tailing benchmarks
//!
//! - Appending into a partition
//! - Cursor reads at different positions of a large partition
//! - Draining a partition the way a stream session does

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use labrelay::logs::{Cursor, LogRecord, LogStore, MemoryLogStore, TailReader};
use labrelay::validate::PartitionName;
use tokio::runtime::Runtime;

/// Fill a fresh partition with `entries` lines.
fn filled_store(rt: &Runtime, name: &PartitionName, entries: usize) -> (Arc<MemoryLogStore>, Vec<Cursor>) {
    let store = Arc::new(MemoryLogStore::new());
    let cursors = rt.block_on(async {
        let mut cursors = Vec::with_capacity(entries);
        for i in 0..entries {
            let entry = store
                .append(name, LogRecord::info(format!("step {i}")).data(serde_json::json!({"i": i})))
                .await
                .unwrap();
            cursors.push(entry.cursor());
        }
        cursors
    });
    (store, cursors)
}

fn bench_append(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let name = PartitionName::new("bench_append").unwrap();
    let store = MemoryLogStore::new();

    c.bench_function("append_info", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(store.append(&name, LogRecord::info("tick")).await.unwrap());
        });
    });
}

fn bench_cursor_read(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let name = PartitionName::new("bench_read").unwrap();
    let (store, cursors) = filled_store(&rt, &name, 100_000);
    let tail = TailReader::new(store);

    let mut group = c.benchmark_group("cursor_read");
    for position in [0usize, 50_000, 99_000] {
        let cursor = cursors.get(position).copied();
        group.bench_with_input(BenchmarkId::from_parameter(position), &cursor, |b, cursor| {
            b.to_async(&rt)
                .iter(|| async { black_box(tail.read(&name, *cursor, 100).await.unwrap()) });
        });
    }
    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let name = PartitionName::new("bench_drain").unwrap();

    let mut group = c.benchmark_group("drain_partition");
    for size in [1_000usize, 10_000] {
        let (store, _) = filled_store(&rt, &name, size);
        let tail = TailReader::new(store);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.to_async(&rt).iter(|| async {
                let mut cursor = None;
                let mut delivered = 0usize;
                loop {
                    let batch = tail.read(&name, cursor, 100).await.unwrap();
                    delivered += batch.entries.len();
                    cursor = batch.last_cursor().or(cursor);
                    if !batch.has_more {
                        break;
                    }
                }
                black_box(delivered)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append, bench_cursor_read, bench_drain);
criterion_main!(benches);
