//! Index benchmarks.
//!
//! Point lookups as the tree deepens, batched inserts with commits, and
//! full or bounded iteration. Indices live in a file on disk unless the
//! benchmark name says otherwise.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use nacre_store::{Bound, Index, Key, KeyKind, Order, Storage, StorageConfig};
use tempfile::TempDir;

// =============================================================================
// Helpers
// =============================================================================

/// Opens a storage in `dir` with an I64 index holding `count` keys.
fn populated(dir: &TempDir, count: i64) -> (Storage, Index) {
    let storage = Storage::new(StorageConfig::default());
    storage.open(dir.path().join("bench.nacre")).expect("open storage");
    let index = storage.create_index(KeyKind::I64, true).expect("create index");
    for k in 0..count {
        index.insert(k * 2, (k + 1) as u32).expect("insert");
        if k % 1_000 == 999 {
            storage.commit().expect("commit");
        }
    }
    storage.commit().expect("commit");
    (storage, index)
}

// =============================================================================
// Lookups
// =============================================================================

/// Point lookups of present keys at growing index sizes.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000i64, 10_000, 100_000] {
        let dir = TempDir::new().expect("create temp dir");
        let (_storage, index) = populated(&dir, count);

        group.bench_with_input(BenchmarkId::new("present", format!("{}k", count / 1000)), &count, |b, &count| {
            let mut k = 0i64;
            b.iter(|| {
                k = (k + 7_919) % count;
                black_box(index.get(k * 2).expect("get"))
            });
        });
    }

    group.finish();
}

/// Lookups of keys between the stored ones.
fn bench_missing_key_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/missing_key");
    group.throughput(Throughput::Elements(1));

    let dir = TempDir::new().expect("create temp dir");
    let (_storage, index) = populated(&dir, 10_000);

    group.bench_function("10k_entries", |b| {
        let mut k = 0i64;
        b.iter(|| {
            k = (k + 7_919) % 10_000;
            black_box(index.get(k * 2 + 1).expect("get"))
        });
    });

    group.finish();
}

// =============================================================================
// Inserts
// =============================================================================

/// Inserts `batch` keys and commits once.
fn bench_batch_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/batch_insert");

    for batch in [10i64, 100, 1_000] {
        group.throughput(Throughput::Elements(batch as u64));
        let dir = TempDir::new().expect("create temp dir");
        let (storage, index) = populated(&dir, 0);
        let mut next = 0i64;

        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            b.iter(|| {
                for _ in 0..batch {
                    next += 1;
                    index.insert(next, 1).expect("insert");
                }
                storage.commit().expect("commit");
            });
        });
    }

    group.finish();
}

/// Uncommitted inserts into an in-memory storage.
fn bench_insert_in_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/insert_in_memory");
    group.throughput(Throughput::Elements(1));

    let storage = Storage::new(StorageConfig::default());
    storage.open_in_memory().expect("open storage");
    let index = storage.create_index(KeyKind::Str, false).expect("create index");

    group.bench_function("str_keys", |b| {
        let mut k = 0u64;
        b.iter(|| {
            k += 1;
            index.insert(format!("key-{:016x}", k.wrapping_mul(0x9E37_79B9_7F4A_7C15)), 1).expect("insert")
        });
    });

    group.finish();
}

// =============================================================================
// Iteration
// =============================================================================

/// Walks every entry in both directions.
fn bench_iteration(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/iteration");

    let dir = TempDir::new().expect("create temp dir");
    let (_storage, index) = populated(&dir, 50_000);
    group.throughput(Throughput::Elements(50_000));

    for order in [Order::Ascending, Order::Descending] {
        group.bench_function(format!("{order:?}"), |b| {
            b.iter(|| {
                let iter = index.range(Bound::Unbounded, Bound::Unbounded, order).expect("range");
                black_box(iter.map(|entry| entry.expect("entry").1).fold(0u64, |acc, oid| acc + u64::from(oid)))
            });
        });
    }

    group.finish();
}

/// Bounded range of 100 entries from a large index.
fn bench_range_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/range_scan");
    group.throughput(Throughput::Elements(100));

    let dir = TempDir::new().expect("create temp dir");
    let (_storage, index) = populated(&dir, 100_000);

    group.bench_function("100_of_100k", |b| {
        let mut start = 0i64;
        b.iter(|| {
            start = (start + 15_485) % 99_800;
            let from = Bound::Included(Key::I64(start * 2));
            let till = Bound::Excluded(Key::I64((start + 100) * 2));
            black_box(index.get_range(from, till).expect("range").len())
        });
    });

    group.finish();
}

criterion_group! {
    name = lookup_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup, bench_missing_key_lookup
}

criterion_group! {
    name = insert_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_batch_insert, bench_insert_in_memory
}

criterion_group! {
    name = scan_benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_iteration, bench_range_scan
}

criterion_main!(lookup_benches, insert_benches, scan_benches);
