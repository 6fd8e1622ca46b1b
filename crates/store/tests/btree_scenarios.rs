//! Index scenarios over a populated storage.
//!
//! Records carry an integer and a string key and are indexed twice. The
//! keys come from a fixed pseudo-random sequence so failures reproduce.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;

use nacre_store::{
    Bound, Error, FieldDescriptor, FieldType, Index, Key, KeyKind, MAX_KEY_SIZE, Order, Persistent,
    RecordReader, RecordWriter, Result, Storage, StorageConfig,
};
use nacre_test_utils::{
    lcg_keys,
    strategies::{IndexOp, arb_byte_key, arb_index_ops, arb_key, arb_unicode_key},
};
use proptest::{prelude::*, sample::Index as Pick, test_runner::TestCaseError};

#[derive(Debug, Clone, PartialEq)]
struct Record {
    int_key: i64,
    str_key: String,
}

impl Persistent for Record {
    const TYPE_NAME: &'static str = "it.Record";

    fn fields() -> Vec<FieldDescriptor> {
        vec![FieldDescriptor::new("int_key", FieldType::I64), FieldDescriptor::new("str_key", FieldType::String)]
    }

    fn encode(&self, w: &mut RecordWriter<'_>) {
        w.write_i64(self.int_key);
        w.write_string(Some(&self.str_key));
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self> {
        Ok(Self { int_key: r.read_i64()?, str_key: r.read_string()?.unwrap_or_default() })
    }
}

struct Indices {
    by_int: Index,
    by_str: Index,
}

fn storage() -> Storage {
    let storage = Storage::new(StorageConfig::default());
    storage.open_in_memory().unwrap();
    storage
}

fn populate(storage: &Storage, n: usize) -> Indices {
    let by_int = storage.create_index(KeyKind::I64, true).unwrap();
    let by_str = storage.create_index(KeyKind::Str, true).unwrap();
    for (i, key) in lcg_keys(1999, n).enumerate() {
        let record = storage.make_persistent(Record { int_key: key, str_key: key.to_string() }).unwrap();
        assert!(by_int.insert(key, record.oid()).unwrap());
        assert!(by_str.insert(key.to_string(), record.oid()).unwrap());
        if i % 5_000 == 4_999 {
            storage.commit().unwrap();
        }
    }
    storage.commit().unwrap();
    Indices { by_int, by_str }
}

fn run_scenario(n: usize) {
    let storage = storage();
    let Indices { by_int, by_str } = populate(&storage, n);
    assert_eq!(by_int.len().unwrap(), n as u64);
    assert_eq!(by_str.len().unwrap(), n as u64);
    by_int.verify().unwrap();
    by_str.verify().unwrap();

    for key in lcg_keys(1999, n) {
        let oid = by_int.get(key).unwrap().expect("int key indexed");
        assert_eq!(by_str.get(key.to_string()).unwrap(), Some(oid));
        let record = storage.load_object::<Record>(oid).unwrap();
        assert_eq!(record.int_key, key);
        assert_eq!(record.str_key, key.to_string());
    }

    let ascending: Vec<i64> = by_int
        .iter()
        .unwrap()
        .map(|entry| match entry.unwrap().0 {
            Key::I64(k) => k,
            other => panic!("unexpected key {other:?}"),
        })
        .collect();
    assert_eq!(ascending.len(), n);
    assert!(ascending.windows(2).all(|w| w[0] < w[1]));

    let descending: Vec<String> = by_str
        .range(Bound::Unbounded, Bound::Unbounded, Order::Descending)
        .unwrap()
        .map(|entry| match entry.unwrap().0 {
            Key::Str(s) => s,
            other => panic!("unexpected key {other:?}"),
        })
        .collect();
    assert_eq!(descending.len(), n);
    assert!(descending.windows(2).all(|w| w[0] > w[1]));

    for key in lcg_keys(1999, n) {
        let oid = by_int.remove_key(key).unwrap();
        by_str.remove(key.to_string(), oid).unwrap();
        storage.deallocate_object(oid).unwrap();
    }
    storage.commit().unwrap();
    assert!(by_int.is_empty().unwrap());
    assert!(by_str.is_empty().unwrap());
    assert!(by_int.iter().unwrap().next().is_none());
    by_int.verify().unwrap();
    by_str.verify().unwrap();
}

// ============================================================================
// Populate, look up, iterate, remove
// ============================================================================

#[test]
fn test_twenty_thousand_records() {
    run_scenario(20_000);
}

#[test]
#[ignore = "full-size run, takes minutes in debug builds"]
fn test_hundred_thousand_records() {
    run_scenario(100_000);
}

#[test]
fn test_indices_survive_reopen() {
    let file = nacre_store::MemoryFile::new();
    let (int_oid, str_oid) = {
        let storage = Storage::new(StorageConfig::default());
        storage.open_file(Box::new(file.clone())).unwrap();
        let indices = populate(&storage, 2_000);
        storage.close().unwrap();
        (indices.by_int.oid(), indices.by_str.oid())
    };

    let storage = Storage::new(StorageConfig::default());
    storage.open_file(Box::new(file)).unwrap();
    let by_int = storage.open_index(int_oid).unwrap();
    let by_str = storage.open_index(str_oid).unwrap();
    by_int.verify().unwrap();
    assert_eq!(by_str.len().unwrap(), 2_000);
    for key in lcg_keys(1999, 2_000).step_by(97) {
        assert_eq!(by_int.get(key).unwrap(), by_str.get(key.to_string()).unwrap());
    }
}

#[test]
fn test_range_bounds_on_large_index() {
    let storage = storage();
    let index = storage.create_index(KeyKind::I64, true).unwrap();
    for k in 0..10_000i64 {
        index.insert(k * 2, (k + 1) as u32).unwrap();
    }

    let inside = index.get_range(Bound::Included(Key::I64(100)), Bound::Excluded(Key::I64(200))).unwrap();
    assert_eq!(inside.len(), 50);
    assert_eq!(inside.first(), Some(&51));

    let odd = index.get_range(Bound::Excluded(Key::I64(101)), Bound::Included(Key::I64(105))).unwrap();
    assert_eq!(odd, vec![52, 53]);

    let tail: Vec<Key> = index
        .range(Bound::Included(Key::I64(19_990)), Bound::Unbounded, Order::Descending)
        .unwrap()
        .map(|entry| entry.unwrap().0)
        .collect();
    assert_eq!(tail, vec![Key::I64(19_998), Key::I64(19_996), Key::I64(19_994), Key::I64(19_992), Key::I64(19_990)]);
}

#[test]
fn test_iterator_fails_after_change() {
    let storage = storage();
    let index = storage.create_index(KeyKind::I64, true).unwrap();
    for k in 0..1_000i64 {
        index.insert(k, 1).unwrap();
    }
    let mut iter = index.iter().unwrap();
    assert!(iter.next().unwrap().is_ok());
    index.insert(5_000i64, 1).unwrap();
    assert!(matches!(iter.next(), Some(Err(Error::ConcurrentModification))));
}

// ============================================================================
// Property: an index behaves like an ordered map
// ============================================================================

fn oid_for(key: i64) -> u32 {
    (key + 1_000) as u32
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_index_matches_btreemap(ops in arb_index_ops(600)) {
        let storage = storage();
        let index = storage.create_index(KeyKind::I64, true).unwrap();
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                IndexOp::Insert(k) => {
                    let inserted = index.insert(k, oid_for(k)).unwrap();
                    prop_assert_eq!(inserted, model.insert(k, oid_for(k)).is_none());
                },
                IndexOp::Remove(k) => match model.remove(&k) {
                    Some(oid) => prop_assert_eq!(index.remove_key(k).unwrap(), oid),
                    None => prop_assert!(matches!(index.remove_key(k), Err(Error::KeyNotFound))),
                },
            }
        }

        index.verify().unwrap();
        prop_assert_eq!(index.len().unwrap(), model.len() as u64);
        let entries = index.entries().unwrap();
        let expected: Vec<(Key, u32)> = model.iter().map(|(&k, &oid)| (Key::I64(k), oid)).collect();
        prop_assert_eq!(entries, expected);
    }
}

// ============================================================================
// Property: mixed key sizes keep variable-key trees balanced
// ============================================================================

/// `Some(key)` inserts, `None` removes the live key picked by the index.
type KeyScript = Vec<(Option<Vec<u8>>, Pick)>;

fn key_script(key: impl Strategy<Value = Vec<u8>>) -> impl Strategy<Value = KeyScript> {
    let step = prop_oneof![2 => key.prop_map(Some), 1 => Just(None)];
    prop::collection::vec((step, any::<Pick>()), 1..300)
}

/// String keys: short identifiers, or unicode text padded close to the
/// maximum key size.
fn arb_sized_str_key() -> impl Strategy<Value = Vec<u8>> {
    let padded = (arb_unicode_key(), MAX_KEY_SIZE - 200..MAX_KEY_SIZE - 96)
        .prop_map(|(text, pad)| format!("{text}{}", "~".repeat(pad)));
    prop_oneof![arb_key(), padded].prop_map(String::into_bytes)
}

/// Runs `script` against an index of `kind`, verifying the tree after every
/// change, then drains it.
fn run_key_script(
    kind: KeyKind,
    script: KeyScript,
    to_key: impl Fn(&[u8]) -> Key,
) -> std::result::Result<(), TestCaseError> {
    let storage = storage();
    let index = storage.create_index(kind, true).unwrap();
    let mut model: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
    let mut next_oid = 1u32;

    for (step, pick) in script {
        match step {
            Some(bytes) => {
                let inserted = index.insert(to_key(&bytes), next_oid).unwrap();
                prop_assert_eq!(inserted, !model.contains_key(&bytes));
                model.entry(bytes).or_insert(next_oid);
                next_oid += 1;
            },
            None if model.is_empty() => continue,
            None => {
                let bytes = model.keys().nth(pick.index(model.len())).cloned().unwrap();
                let oid = model.remove(&bytes).unwrap();
                prop_assert_eq!(index.remove_key(to_key(&bytes)).unwrap(), oid);
            },
        }
        index.verify().unwrap();
    }

    let expected: Vec<(Key, u32)> = model.iter().map(|(k, &oid)| (to_key(k), oid)).collect();
    prop_assert_eq!(index.entries().unwrap(), expected);

    // Drain from the middle outwards so merges hit both neighbours.
    let mut keys: Vec<Vec<u8>> = model.keys().cloned().collect();
    while !keys.is_empty() {
        let bytes = keys.remove(keys.len() / 2);
        prop_assert_eq!(index.remove_key(to_key(&bytes)).unwrap(), model[&bytes]);
        index.verify().unwrap();
    }
    prop_assert_eq!(index.len().unwrap(), 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_mixed_size_byte_keys(script in key_script(arb_byte_key(MAX_KEY_SIZE))) {
        run_key_script(KeyKind::Bytes, script, |b| Key::Bytes(b.to_vec()))?;
    }

    #[test]
    fn prop_mixed_size_string_keys(script in key_script(arb_sized_str_key())) {
        run_key_script(KeyKind::Str, script, |b| Key::Str(String::from_utf8(b.to_vec()).unwrap()))?;
    }
}
