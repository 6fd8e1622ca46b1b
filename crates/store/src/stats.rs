//! Space and cache accounting snapshots.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{cache::CacheStats, pool::PoolStats};

/// Pseudo type name under which B-tree pages are reported.
pub const BTREE_PAGE_TYPE: &str = "nacre.BTreePage";

/// Space held by the reachable objects of one type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TypeMemoryUsage {
    /// Reachable instances.
    pub count: usize,
    /// Sum of record sizes, headers included.
    pub total_size: u64,
    /// Sum of sizes rounded up to the allocation quantum.
    pub allocated_size: u64,
}

impl TypeMemoryUsage {
    pub(crate) fn add(&mut self, size: u64, allocated: u64) {
        self.count += 1;
        self.total_size += size;
        self.allocated_size += allocated;
    }
}

/// Per-type breakdown of the reachable object graph.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    /// Usage keyed by registered type name.
    pub by_type: BTreeMap<String, TypeMemoryUsage>,
}

impl MemoryUsage {
    /// Usage summed over every type.
    pub fn total(&self) -> TypeMemoryUsage {
        self.by_type.values().fold(TypeMemoryUsage::default(), |mut acc, usage| {
            acc.count += usage.count;
            acc.total_size += usage.total_size;
            acc.allocated_size += usage.allocated_size;
            acc
        })
    }
}

/// Point-in-time counters of an open storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Bytes allocated in the working generation.
    pub used_size: u64,
    /// Logical file size.
    pub database_size: u64,
    /// Entries in use in the object index, reserved oids included.
    pub index_used: u32,
    /// Index pages changed since the last commit.
    pub dirty_index_pages: usize,
    /// Page pool counters.
    pub pool: PoolStats,
    /// Object cache counters.
    pub cache: CacheStats,
}
