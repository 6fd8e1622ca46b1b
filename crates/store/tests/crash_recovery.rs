//! Crash recovery tests for the root-flip commit.
//!
//! Each test commits a baseline, changes it, then crashes the next commit
//! at a chosen point through a page file that stops persisting anything
//! once the injector fires. Reopening the surviving bytes must yield
//! exactly one of the two states:
//!
//! ```text
//! commit_index():
//!   1. Write dirty pages + header with new working root  ← DuringPageWrite
//!   2. SYNC (first)                                       ← BeforeFirstSync
//!   3. Write header with flipped selector                 ← BeforeRootFlip
//!   4. SYNC (second)                                      ← DuringSecondSync
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use nacre_store::{
    Error, FieldDescriptor, FieldType, Handle, KeyKind, MemoryFile, Oid, PageFile, Persistent,
    RecordReader, RecordWriter, Result, Storage, StorageConfig, StorageListener,
};
use nacre_test_utils::{CrashInjector, CrashPoint, IoEvent};

#[derive(Debug, Clone, PartialEq)]
struct Item {
    label: String,
}

impl Persistent for Item {
    const TYPE_NAME: &'static str = "it.Item";

    fn fields() -> Vec<FieldDescriptor> {
        vec![FieldDescriptor::new("label", FieldType::String)]
    }

    fn encode(&self, w: &mut RecordWriter<'_>) {
        w.write_string(Some(&self.label));
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self> {
        Ok(Self { label: r.read_string()?.unwrap_or_default() })
    }
}

fn item(label: &str) -> Item {
    Item { label: label.to_owned() }
}

/// Memory file that goes silent once the injector reports a crash.
struct CrashFile {
    inner: MemoryFile,
    injector: Arc<CrashInjector>,
}

fn crashed() -> Error {
    io::Error::other("simulated crash").into()
}

impl PageFile for CrashFile {
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.read(pos, buf)
    }

    fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let event = if pos == 0 { IoEvent::HeaderWrite } else { IoEvent::PageWrite };
        if self.injector.has_crashed() || self.injector.observe(event) {
            return Err(crashed());
        }
        self.inner.write(pos, buf)
    }

    fn sync(&self) -> Result<()> {
        if self.injector.has_crashed() || self.injector.on_sync() {
            return Err(crashed());
        }
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        self.inner.length()
    }
}

#[derive(Default)]
struct Recoveries(AtomicUsize);

impl StorageListener for Recoveries {
    fn recovery_completed(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Scenario {
    file: MemoryFile,
    injector: Arc<CrashInjector>,
    baseline: Handle<Item>,
    added: Oid,
    index: Oid,
}

/// Commits a baseline, changes it and crashes the next commit at `point`.
fn crash_commit(point: CrashPoint) -> Scenario {
    let file = MemoryFile::new();
    let injector = CrashInjector::new(point);
    let storage = Storage::new(StorageConfig::default());
    storage.open_file(Box::new(CrashFile { inner: file.clone(), injector: Arc::clone(&injector) })).unwrap();

    let mut baseline = storage.make_persistent(item("baseline")).unwrap();
    let index = storage.create_index(KeyKind::I64, true).unwrap();
    for k in 0..200i64 {
        index.insert(k, baseline.oid()).unwrap();
    }
    storage.set_root(&baseline).unwrap();
    storage.commit().unwrap();

    storage.store_object(&mut baseline, item("changed")).unwrap();
    let added = storage.make_persistent(item("added")).unwrap();
    for k in 200..400i64 {
        index.insert(k, added.oid()).unwrap();
    }
    index.remove(0i64, baseline.oid()).unwrap();
    storage.set_root(&added).unwrap();

    injector.arm();
    assert!(storage.commit().is_err(), "{:?}", injector.crash_point());
    assert!(injector.has_crashed());
    drop(storage);

    Scenario { file, injector, baseline, added: added.oid(), index: index.oid() }
}

fn reopen(file: &MemoryFile) -> (Storage, Arc<Recoveries>) {
    let recoveries = Arc::new(Recoveries::default());
    let storage = Storage::new(StorageConfig::default());
    storage.set_listener(Some(recoveries.clone()));
    storage.open_file(Box::new(MemoryFile::from_bytes(file.snapshot()))).unwrap();
    (storage, recoveries)
}

fn assert_previous_commit(scenario: &Scenario) {
    let (storage, recoveries) = reopen(&scenario.file);
    assert_eq!(recoveries.0.load(Ordering::SeqCst), 1);

    let root = storage.root::<Item>().unwrap().unwrap();
    assert_eq!(root.oid(), scenario.baseline.oid());
    assert_eq!(storage.load_object::<Item>(root.oid()).unwrap().label, "baseline");
    assert!(storage.load_object::<Item>(scenario.added).is_err());

    let index = storage.open_index(scenario.index).unwrap();
    index.verify().unwrap();
    assert_eq!(index.len().unwrap(), 200);
    assert_eq!(index.get(0i64).unwrap(), Some(scenario.baseline.oid()));
    assert_eq!(index.get(300i64).unwrap(), None);

    // The recovered database takes new work.
    let fresh = storage.make_persistent(item("after recovery")).unwrap();
    storage.commit().unwrap();
    assert_eq!(storage.load_object::<Item>(fresh.oid()).unwrap().label, "after recovery");
}

fn assert_new_commit(scenario: &Scenario) {
    let (storage, recoveries) = reopen(&scenario.file);
    assert_eq!(recoveries.0.load(Ordering::SeqCst), 1);

    let root = storage.root::<Item>().unwrap().unwrap();
    assert_eq!(root.oid(), scenario.added);
    assert_eq!(storage.load_object::<Item>(scenario.baseline.oid()).unwrap().label, "changed");

    let index = storage.open_index(scenario.index).unwrap();
    index.verify().unwrap();
    assert_eq!(index.len().unwrap(), 399);
    assert_eq!(index.get(0i64).unwrap(), None);
    assert_eq!(index.get(300i64).unwrap(), Some(scenario.added));
}

// ============================================================================
// Crash points
// ============================================================================

#[test]
fn test_crash_during_page_write_keeps_previous_commit() {
    assert_previous_commit(&crash_commit(CrashPoint::DuringPageWrite { after: 2 }));
}

#[test]
fn test_crash_at_first_page_write_keeps_previous_commit() {
    assert_previous_commit(&crash_commit(CrashPoint::DuringPageWrite { after: 0 }));
}

#[test]
fn test_crash_before_first_sync_keeps_previous_commit() {
    let scenario = crash_commit(CrashPoint::BeforeFirstSync);
    assert_eq!(scenario.injector.sync_count(), 1);
    assert_eq!(scenario.injector.header_write_count(), 1);
    assert_previous_commit(&scenario);
}

#[test]
fn test_crash_before_root_flip_keeps_previous_commit() {
    let scenario = crash_commit(CrashPoint::BeforeRootFlip);
    // The working root went out with the pages; the flip is the second.
    assert_eq!(scenario.injector.sync_count(), 1);
    assert_eq!(scenario.injector.header_write_count(), 2);
    assert_previous_commit(&scenario);
}

#[test]
fn test_crash_after_root_flip_exposes_new_commit() {
    let scenario = crash_commit(CrashPoint::DuringSecondSync);
    assert_eq!(scenario.injector.sync_count(), 2);
    assert_eq!(scenario.injector.header_write_count(), 2);
    assert_new_commit(&scenario);
}

#[test]
fn test_disarmed_commit_goes_through() {
    let file = MemoryFile::new();
    let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
    let storage = Storage::new(StorageConfig::default());
    storage.open_file(Box::new(CrashFile { inner: file.clone(), injector: Arc::clone(&injector) })).unwrap();

    let kept = storage.make_persistent(item("kept")).unwrap();
    storage.set_root(&kept).unwrap();
    injector.arm();
    injector.disarm();
    storage.commit().unwrap();
    assert!(!injector.has_crashed());
    assert_eq!(injector.sync_count(), 0);
    drop(storage);

    let (storage, _) = reopen(&file);
    assert_eq!(storage.root::<Item>().unwrap().unwrap().oid(), kept.oid());
}

// ============================================================================
// Clean paths
// ============================================================================

#[test]
fn test_uncommitted_work_is_dropped_without_close() {
    let file = MemoryFile::new();
    let storage = Storage::new(StorageConfig::default());
    storage.open_file(Box::new(file.clone())).unwrap();
    let kept = storage.make_persistent(item("kept")).unwrap();
    storage.set_root(&kept).unwrap();
    storage.commit().unwrap();
    storage.make_persistent(item("lost")).unwrap();
    drop(storage);

    let (storage, recoveries) = reopen(&file);
    assert_eq!(recoveries.0.load(Ordering::SeqCst), 1);
    assert_eq!(storage.root::<Item>().unwrap().unwrap().oid(), kept.oid());
    assert_eq!(storage.stats().unwrap().index_used, kept.oid() + 1);
}

#[test]
fn test_clean_close_needs_no_recovery() {
    let file = MemoryFile::new();
    let storage = Storage::new(StorageConfig::default());
    storage.open_file(Box::new(file.clone())).unwrap();
    let kept = storage.make_persistent(item("kept")).unwrap();
    storage.set_root(&kept).unwrap();
    storage.close().unwrap();

    let (storage, recoveries) = reopen(&file);
    assert_eq!(recoveries.0.load(Ordering::SeqCst), 0);
    assert_eq!(storage.root::<Item>().unwrap().unwrap().oid(), kept.oid());
}
