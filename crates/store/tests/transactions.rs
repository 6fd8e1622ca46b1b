//! Concurrent transactions against one storage.
//!
//! Every test runs several threads that increment shared counters; the
//! final values show that no update was lost and that the last batch
//! reached the file.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{thread, time::Duration};

use nacre_store::{
    FieldDescriptor, FieldType, Handle, MemoryFile, Oid, Persistent, RecordReader, RecordWriter, Result, Storage,
    StorageConfig, TransactionMode,
};

const THREADS: usize = 6;
const ROUNDS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Counter {
    value: i64,
}

impl Persistent for Counter {
    const TYPE_NAME: &'static str = "it.Counter";

    fn fields() -> Vec<FieldDescriptor> {
        vec![FieldDescriptor::new("value", FieldType::I64)]
    }

    fn encode(&self, w: &mut RecordWriter<'_>) {
        w.write_i64(self.value);
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self> {
        Ok(Self { value: r.read_i64()? })
    }
}

fn setup() -> (Storage, MemoryFile, Oid) {
    let file = MemoryFile::new();
    let storage = Storage::new(StorageConfig::default());
    storage.open_file(Box::new(file.clone())).unwrap();
    let counter = storage.make_persistent(Counter { value: 0 }).unwrap();
    storage.set_root(&counter).unwrap();
    storage.commit().unwrap();
    (storage, file, counter.oid())
}

/// Runs `body` on `THREADS` threads and waits for all of them.
fn run_threads(storage: &Storage, body: impl Fn(Storage) + Send + Sync + Copy + 'static) {
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let storage = storage.clone();
            thread::spawn(move || body(storage))
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}

/// Value of the counter in the last committed state of `file`.
fn committed_value(file: &MemoryFile, oid: Oid) -> i64 {
    let storage = Storage::new(StorageConfig::default());
    storage.open_file(Box::new(MemoryFile::from_bytes(file.snapshot()))).unwrap();
    storage.load_object::<Counter>(oid).unwrap().value
}

fn increment(tx: &mut nacre_store::Transaction, oid: Oid) {
    tx.lock_exclusive(oid).unwrap();
    let current = tx.load::<Counter>(oid).unwrap().value;
    let mut handle = Handle::from_oid(oid);
    tx.store(&mut handle, Counter { value: current + 1 }).unwrap();
}

// ============================================================================
// Modes under contention
// ============================================================================

#[test]
fn test_exclusive_transactions_serialize_updates() {
    let (storage, file, oid) = setup();
    run_threads(&storage, move |storage| {
        for _ in 0..ROUNDS {
            let mut tx = storage.begin_transaction(TransactionMode::Exclusive).unwrap();
            let current = storage.load_object::<Counter>(oid).unwrap().value;
            let mut handle = Handle::from_oid(oid);
            tx.store(&mut handle, Counter { value: current + 1 }).unwrap();
            tx.end(None).unwrap();
        }
    });
    assert_eq!(committed_value(&file, oid), (THREADS * ROUNDS) as i64);
}

#[test]
fn test_cooperative_batches_commit_every_update() {
    let (storage, file, oid) = setup();
    run_threads(&storage, move |storage| {
        for _ in 0..ROUNDS {
            let mut tx = storage.begin_transaction(TransactionMode::Cooperative).unwrap();
            increment(&mut tx, oid);
            tx.end(Some(Duration::ZERO)).unwrap();
        }
    });
    assert_eq!(storage.stats().unwrap().dirty_index_pages, 0);
    assert_eq!(committed_value(&file, oid), (THREADS * ROUNDS) as i64);
}

#[test]
fn test_cooperative_delayed_commits_drain() {
    let (storage, file, oid) = setup();
    run_threads(&storage, move |storage| {
        for _ in 0..ROUNDS {
            let mut tx = storage.begin_transaction(TransactionMode::Cooperative).unwrap();
            increment(&mut tx, oid);
            tx.end(Some(Duration::from_millis(5))).unwrap();
        }
    });
    // The last transaction to leave commits whatever is left.
    assert_eq!(storage.stats().unwrap().dirty_index_pages, 0);
    assert_eq!(committed_value(&file, oid), (THREADS * ROUNDS) as i64);
}

#[test]
fn test_serializable_transactions_with_locks() {
    let (storage, file, oid) = setup();
    run_threads(&storage, move |storage| {
        for _ in 0..ROUNDS {
            let mut tx = storage.begin_transaction(TransactionMode::Serializable).unwrap();
            increment(&mut tx, oid);
            assert_eq!(tx.pending(), 1);
            tx.end(None).unwrap();
        }
    });
    assert_eq!(committed_value(&file, oid), (THREADS * ROUNDS) as i64);
}

#[test]
fn test_serializable_rollbacks_leave_no_trace() {
    let (storage, file, oid) = setup();
    run_threads(&storage, move |storage| {
        for round in 0..ROUNDS {
            let mut tx = storage.begin_transaction(TransactionMode::Serializable).unwrap();
            increment(&mut tx, oid);
            if round % 2 == 0 {
                tx.rollback().unwrap();
            } else {
                tx.end(None).unwrap();
            }
        }
    });
    assert_eq!(committed_value(&file, oid), (THREADS * ROUNDS / 2) as i64);
}
