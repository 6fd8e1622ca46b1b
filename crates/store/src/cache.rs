//! Object cache: decoded objects by oid.
//!
//! The cache sits in front of record decoding. Its eviction policy is picked
//! by [`CacheKind`]. Objects registered through `modify_object` are held in a
//! separate dirty set regardless of the policy until they are stored.

use std::{
    any::Any,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};

use crate::{config::CacheKind, error::Oid, schema::Codec};

/// Decoded object state shared with handles.
pub(crate) type Object = Arc<dyn Any + Send + Sync>;

/// A modified object waiting to be written back.
pub(crate) struct DirtyObject {
    pub(crate) value: Object,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) type_oid: Oid,
}

/// Object cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that had to decode the record.
    pub misses: u64,
    /// Objects currently reachable through the cache.
    pub cached: usize,
    /// Modified objects not yet stored.
    pub dirty: usize,
}

pub(crate) struct ObjectCache {
    kind: CacheKind,
    capacity: usize,
    /// Strongly held entries with their recency tick.
    strong: HashMap<Oid, (Object, u64)>,
    /// Recency order of `strong` for the LRU kinds.
    recency: BTreeMap<u64, Oid>,
    weak: HashMap<Oid, Weak<dyn Any + Send + Sync>>,
    dirty: BTreeMap<Oid, DirtyObject>,
    tick: u64,
    hits: u64,
    misses: u64,
}

impl ObjectCache {
    pub(crate) fn new(kind: CacheKind, init_size: usize) -> Self {
        let capacity = match kind {
            CacheKind::Soft => init_size.saturating_mul(4),
            _ => init_size,
        };
        Self {
            kind,
            capacity: capacity.max(1),
            strong: HashMap::new(),
            recency: BTreeMap::new(),
            weak: HashMap::new(),
            dirty: BTreeMap::new(),
            tick: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn is_lru(&self) -> bool {
        matches!(self.kind, CacheKind::Lru | CacheKind::Soft)
    }

    pub(crate) fn get(&mut self, oid: Oid) -> Option<Object> {
        let found = self.lookup(oid);
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    fn lookup(&mut self, oid: Oid) -> Option<Object> {
        if let Some(dirty) = self.dirty.get(&oid) {
            return Some(Arc::clone(&dirty.value));
        }
        if self.strong.contains_key(&oid) {
            self.touch(oid);
            return self.strong.get(&oid).map(|(obj, _)| Arc::clone(obj));
        }
        let obj = self.weak.get(&oid)?.upgrade();
        match obj {
            Some(obj) => {
                if self.is_lru() {
                    self.hold(oid, Arc::clone(&obj));
                }
                Some(obj)
            },
            None => {
                self.weak.remove(&oid);
                None
            },
        }
    }

    fn touch(&mut self, oid: Oid) {
        if !self.is_lru() {
            return;
        }
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, old)) = self.strong.get_mut(&oid) {
            self.recency.remove(old);
            *old = tick;
            self.recency.insert(tick, oid);
        }
    }

    fn hold(&mut self, oid: Oid, obj: Object) {
        self.tick += 1;
        if let Some((_, old)) = self.strong.insert(oid, (obj, self.tick)) {
            self.recency.remove(&old);
        }
        if self.is_lru() {
            self.recency.insert(self.tick, oid);
            while self.strong.len() > self.capacity {
                let Some((_, victim)) = self.recency.pop_first() else { break };
                self.strong.remove(&victim);
            }
        }
    }

    pub(crate) fn put(&mut self, oid: Oid, obj: Object) {
        match self.kind {
            CacheKind::Strong => self.hold(oid, obj),
            CacheKind::Weak => {
                self.weak.insert(oid, Arc::downgrade(&obj));
                self.prune_weak();
            },
            CacheKind::Lru | CacheKind::Soft => {
                self.weak.insert(oid, Arc::downgrade(&obj));
                self.hold(oid, obj);
                self.prune_weak();
            },
        }
    }

    /// Drops dead weak entries once the map outgrows the strong capacity.
    fn prune_weak(&mut self) {
        if self.weak.len() > self.capacity.saturating_mul(2) {
            self.weak.retain(|_, w| w.strong_count() > 0);
        }
    }

    pub(crate) fn remove(&mut self, oid: Oid) {
        if let Some((_, tick)) = self.strong.remove(&oid) {
            self.recency.remove(&tick);
        }
        self.weak.remove(&oid);
        self.dirty.remove(&oid);
    }

    pub(crate) fn mark_dirty(&mut self, oid: Oid, dirty: DirtyObject) {
        self.put(oid, Arc::clone(&dirty.value));
        self.dirty.insert(oid, dirty);
    }

    pub(crate) fn is_dirty(&self, oid: Oid) -> bool {
        self.dirty.contains_key(&oid)
    }

    /// Removes and returns every pending modification in oid order.
    pub(crate) fn take_dirty(&mut self) -> BTreeMap<Oid, DirtyObject> {
        std::mem::take(&mut self.dirty)
    }

    /// Forgets every cached object, including unsaved modifications.
    pub(crate) fn invalidate(&mut self) {
        self.strong.clear();
        self.recency.clear();
        self.weak.clear();
        self.dirty.clear();
    }

    pub(crate) fn stats(&self) -> CacheStats {
        let live_weak = self
            .weak
            .iter()
            .filter(|(oid, w)| !self.strong.contains_key(oid) && w.strong_count() > 0)
            .count();
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            cached: self.strong.len() + live_weak,
            dirty: self.dirty.len(),
        }
    }
}
