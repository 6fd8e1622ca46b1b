//! Proptest strategies for store tests.
//!
//! Generators produce plain values (keys, payloads, operation scripts) so
//! this crate stays independent of the store itself.
//!
//! # Usage
//!
//! ```no_run
//! use nacre_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn my_property(ops in strategies::arb_index_ops(64)) {
//!         // apply ops to an index and to a model, then compare
//!     }
//! }
//! ```

use proptest::prelude::*;

/// Generates a string key of 1-32 characters matching `[a-z][a-z0-9]{0,31}`.
pub fn arb_key() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,31}"
}

/// Generates a string key that may contain multi-byte characters.
pub fn arb_unicode_key() -> impl Strategy<Value = String> {
    "[a-zäöüß€0-9]{1,24}"
}

/// Generates a byte-string key of at most `max_len` bytes: mostly short
/// ones, with about a third close to `max_len` so that pages hold only a
/// handful of keys.
pub fn arb_byte_key(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    let long = (max_len * 3 / 4).max(1)..=max_len.max(1);
    prop_oneof![
        2 => proptest::collection::vec(any::<u8>(), 1..24),
        1 => proptest::collection::vec(any::<u8>(), long),
    ]
}

/// Generates a record payload of 0-511 random bytes.
pub fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..512)
}

/// Generates a sequence of allocation sizes, skewed towards small records.
pub fn arb_allocation_sizes(max_len: usize) -> impl Strategy<Value = Vec<u64>> {
    proptest::collection::vec(prop_oneof![4 => 8u64..256, 1 => 256u64..20_000], 1..max_len)
}

/// One step of an index script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOp {
    /// Insert the key (no-op on a unique index if present).
    Insert(i64),
    /// Remove the key if present.
    Remove(i64),
}

/// Generates up to `max_len` operations over a small key space so that
/// inserts and removes collide often.
pub fn arb_index_ops(max_len: usize) -> impl Strategy<Value = Vec<IndexOp>> {
    let key = -500i64..500;
    proptest::collection::vec(
        prop_oneof![3 => key.clone().prop_map(IndexOp::Insert), 1 => key.prop_map(IndexOp::Remove)],
        1..max_len,
    )
}

/// Generates an object graph as adjacency lists: node `i` links to the
/// listed nodes. Node 0 is meant as the root.
pub fn arb_graph(max_nodes: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..max_nodes).prop_flat_map(|n| proptest::collection::vec(proptest::collection::vec(0..n, 0..4), n))
}
