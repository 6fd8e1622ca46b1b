//! Public index handle backed by a persistent B-tree.

use byteorder::{ByteOrder, LittleEndian};

use super::{
    BTree, Bound, InsertMode, InsertOutcome, Key, KeyKind, Order, PageProvider, PageReader,
    TreeCursor, TreeHeader,
};
use crate::{
    error::{Error, Oid, Result},
    storage::{Core, Storage},
};

impl PageReader for Core {
    fn read_page(&self, page: Oid) -> Result<Vec<u8>> {
        self.read_page_object(page)
    }
}

impl PageProvider for Core {
    fn write_page(&mut self, page: Oid, data: &[u8]) -> Result<()> {
        self.write_page_object(page, data)
    }

    fn allocate_page(&mut self) -> Result<Oid> {
        self.allocate_page_object()
    }

    fn free_page(&mut self, page: Oid) -> Result<()> {
        self.free_page_object(page)
    }
}

impl Core {
    pub(crate) fn create_tree(&mut self, kind: KeyKind, unique: bool) -> Result<Oid> {
        self.store_new(&TreeHeader::new(kind, unique))
    }

    pub(crate) fn load_tree(&self, oid: Oid) -> Result<TreeHeader> {
        self.load_typed::<TreeHeader>(oid)
    }

    /// Frees the pages and the header of tree `oid`.
    pub(crate) fn deallocate_tree(&mut self, oid: Oid) -> Result<()> {
        let header = self.load_tree(oid)?;
        BTree::new(&mut *self, header).clear()?;
        self.deallocate_record(oid)?;
        self.bump_index(oid);
        Ok(())
    }

    /// Indexed oids of tree `oid`, plus the keys of an object-keyed tree.
    pub(crate) fn tree_references(&self, oid: Oid) -> Result<Vec<Oid>> {
        let header = self.load_tree(oid)?;
        let mut refs = Vec::new();
        BTree::new(self, header).visit_pages(&mut |_, level, view| {
            if level == 1 {
                for i in 0..view.len() {
                    refs.push(view.reference(i));
                    if header.kind == KeyKind::Object {
                        refs.push(LittleEndian::read_u32(view.key(i)));
                    }
                }
            }
            Ok(())
        })?;
        Ok(refs)
    }

    fn bump_index(&mut self, oid: Oid) {
        *self.index_mods.entry(oid).or_default() += 1;
    }

    /// Change stamp checked by iterators of tree `oid`.
    fn index_stamp(&self, oid: Oid) -> (u64, u64) {
        (self.epoch, self.index_mods.get(&oid).copied().unwrap_or(0))
    }
}

fn encode_key(kind: KeyKind, key: &Key) -> Result<Vec<u8>> {
    if key.kind() != kind {
        return Err(Error::IncompatibleKeyType { expected: kind, found: key.kind() });
    }
    key.encode()
}

fn encode_bound(kind: KeyKind, bound: Bound<Key>) -> Result<Bound<Vec<u8>>> {
    Ok(match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(key) => Bound::Included(encode_key(kind, &key)?),
        Bound::Excluded(key) => Bound::Excluded(encode_key(kind, &key)?),
    })
}

/// A persistent ordered map from typed keys to object ids.
///
/// The handle is cheap to clone and only remembers the storage and the oid
/// of the tree header. Every call runs against the current transaction.
///
/// ```
/// use nacre_store::{Bound, Key, KeyKind, Order, Storage, StorageConfig};
///
/// # fn main() -> nacre_store::Result<()> {
/// let storage = Storage::new(StorageConfig::default());
/// storage.open_in_memory()?;
/// let index = storage.create_index(KeyKind::I64, true)?;
/// for (k, oid) in [(3i64, 30), (1, 10), (2, 20)] {
///     index.insert(k, oid)?;
/// }
/// assert_eq!(index.get(2i64)?, Some(20));
///
/// let keys: Vec<Key> = index
///     .range(Bound::Included(Key::I64(2)), Bound::Unbounded, Order::Descending)?
///     .map(|entry| entry.map(|(key, _)| key))
///     .collect::<nacre_store::Result<_>>()?;
/// assert_eq!(keys, vec![Key::I64(3), Key::I64(2)]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Index {
    storage: Storage,
    oid: Oid,
}

impl Index {
    pub(crate) fn new(storage: Storage, oid: Oid) -> Self {
        Self { storage, oid }
    }

    /// Oid of the tree header; pass it to [`Storage::open_index`] or store
    /// it in a reference field.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    fn read<R>(&self, f: impl FnOnce(&BTree<&Core>) -> Result<R>) -> Result<R> {
        self.storage.with_core(|core| {
            let header = core.load_tree(self.oid)?;
            f(&BTree::new(&*core, header))
        })
    }

    /// Runs a mutation and stores the header if it changed.
    fn write<R>(&self, f: impl FnOnce(&mut BTree<&mut Core>) -> Result<R>) -> Result<R> {
        self.storage.with_core(|core| {
            let before = core.load_tree(self.oid)?;
            let mut tree = BTree::new(&mut *core, before);
            let out = f(&mut tree)?;
            let after = tree.header;
            if after != before {
                core.store_existing(self.oid, &after)?;
            }
            core.bump_index(self.oid);
            Ok(out)
        })
    }

    /// Key kind the index was created with.
    pub fn kind(&self) -> Result<KeyKind> {
        self.read(|tree| Ok(tree.header.kind))
    }

    /// Whether equal keys are rejected.
    pub fn is_unique(&self) -> Result<bool> {
        self.read(|tree| Ok(tree.header.unique))
    }

    /// Number of entries.
    pub fn len(&self) -> Result<u64> {
        self.read(|tree| Ok(tree.header.count))
    }

    /// Whether the index has no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Adds `key -> oid`. A unique index that already holds `key` is left
    /// unchanged and `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleKeyType`] if the key kind differs from
    /// the index's and [`Error::KeyTooLarge`] for an oversized key.
    pub fn insert(&self, key: impl Into<Key>, oid: Oid) -> Result<bool> {
        let key = key.into();
        self.write(|tree| {
            let bytes = encode_key(tree.header.kind, &key)?;
            Ok(tree.insert(&bytes, oid, InsertMode::Insert)? == InsertOutcome::Inserted)
        })
    }

    /// Adds or replaces `key -> oid`, returning the replaced reference.
    /// A non-unique index always adds.
    ///
    /// # Errors
    ///
    /// See [`Index::insert`].
    pub fn set(&self, key: impl Into<Key>, oid: Oid) -> Result<Option<Oid>> {
        let key = key.into();
        self.write(|tree| {
            let bytes = encode_key(tree.header.kind, &key)?;
            Ok(match tree.insert(&bytes, oid, InsertMode::Set)? {
                InsertOutcome::Replaced(previous) => Some(previous),
                InsertOutcome::Inserted | InsertOutcome::Duplicate(_) => None,
            })
        })
    }

    /// Reference stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotUnique`] if several entries match.
    pub fn get(&self, key: impl Into<Key>) -> Result<Option<Oid>> {
        let key = key.into();
        self.read(|tree| tree.get(&encode_key(tree.header.kind, &key)?))
    }

    /// References of every entry in `[from, till]`, in key order.
    pub fn get_range(&self, from: Bound<Key>, till: Bound<Key>) -> Result<Vec<Oid>> {
        self.read(|tree| {
            let kind = tree.header.kind;
            let found = tree.find(encode_bound(kind, from)?, encode_bound(kind, till)?, usize::MAX)?;
            Ok(found.into_iter().map(|(_, oid)| oid).collect())
        })
    }

    /// Removes the entry `key -> oid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotFound`] if there is no such entry.
    pub fn remove(&self, key: impl Into<Key>, oid: Oid) -> Result<()> {
        let key = key.into();
        self.write(|tree| {
            let bytes = encode_key(tree.header.kind, &key)?;
            tree.remove(&bytes, Some(oid))?.map(|_| ()).ok_or(Error::KeyNotFound)
        })
    }

    /// Removes the entry of `key` from a unique index and returns its
    /// reference.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotUnique`] on a non-unique index and
    /// [`Error::KeyNotFound`] if the key is absent.
    pub fn remove_key(&self, key: impl Into<Key>) -> Result<Oid> {
        let key = key.into();
        self.write(|tree| {
            if !tree.header.unique {
                return Err(Error::KeyNotUnique);
            }
            let bytes = encode_key(tree.header.kind, &key)?;
            tree.remove(&bytes, None)?.ok_or(Error::KeyNotFound)
        })
    }

    /// References of every entry whose key is a prefix of `text`, shortest
    /// prefix first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleKeyType`] unless the index holds strings.
    pub fn prefix_search(&self, text: &str) -> Result<Vec<Oid>> {
        self.read(|tree| {
            let kind = tree.header.kind;
            if kind != KeyKind::Str {
                return Err(Error::IncompatibleKeyType { expected: kind, found: KeyKind::Str });
            }
            let mut out = Vec::new();
            for end in (1..=text.len()).filter(|&end| text.is_char_boundary(end)) {
                let key = text.as_bytes()[..end].to_vec();
                let found = tree.find(Bound::Included(key.clone()), Bound::Included(key), usize::MAX)?;
                out.extend(found.into_iter().map(|(_, oid)| oid));
            }
            Ok(out)
        })
    }

    /// References of every entry whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IncompatibleKeyType`] unless the index holds strings.
    pub fn get_prefix(&self, prefix: &str) -> Result<Vec<Oid>> {
        self.read(|tree| {
            let from = encode_key(tree.header.kind, &Key::Str(prefix.to_owned()))?;
            let mut cursor = tree.cursor(Bound::Included(from.clone()), Bound::Unbounded, Order::Ascending)?;
            let mut out = Vec::new();
            while let Some((key, oid)) = cursor.next(&tree.provider)? {
                if !key.starts_with(&from) {
                    break;
                }
                out.push(oid);
            }
            Ok(out)
        })
    }

    /// Iterates every entry in ascending key order.
    pub fn iter(&self) -> Result<IndexIter> {
        self.range(Bound::Unbounded, Bound::Unbounded, Order::Ascending)
    }

    /// Iterates the entries in `[from, till]` in `order`.
    ///
    /// The iterator fails with [`Error::ConcurrentModification`] once the
    /// index is changed or the transaction rolled back.
    pub fn range(&self, from: Bound<Key>, till: Bound<Key>, order: Order) -> Result<IndexIter> {
        self.storage.with_core(|core| {
            let header = core.load_tree(self.oid)?;
            let from = encode_bound(header.kind, from)?;
            let till = encode_bound(header.kind, till)?;
            let cursor = TreeCursor::new(&*core, &header, from, till, order)?;
            Ok(IndexIter {
                storage: self.storage.clone(),
                oid: self.oid,
                kind: header.kind,
                stamp: core.index_stamp(self.oid),
                cursor,
                done: false,
            })
        })
    }

    /// Every entry in ascending key order.
    pub fn entries(&self) -> Result<Vec<(Key, Oid)>> {
        self.iter()?.collect()
    }

    /// Removes every entry and frees the tree pages.
    pub fn clear(&self) -> Result<()> {
        self.write(|tree| tree.clear())
    }

    /// Frees the index, its pages included.
    pub fn deallocate(self) -> Result<()> {
        self.storage.deallocate_object(self.oid)
    }

    /// Checks ordering, balance, occupancy and the element count.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseCorrupted`] describing the first violation.
    pub fn verify(&self) -> Result<()> {
        self.read(|tree| tree.verify())
    }
}

/// Iterator over index entries, see [`Index::range`].
#[derive(Debug)]
pub struct IndexIter {
    storage: Storage,
    oid: Oid,
    kind: KeyKind,
    stamp: (u64, u64),
    cursor: TreeCursor,
    done: bool,
}

impl Iterator for IndexIter {
    type Item = Result<(Key, Oid)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = self.storage.with_core(|core| {
            if core.index_stamp(self.oid) != self.stamp {
                return Err(Error::ConcurrentModification);
            }
            match self.cursor.next(&*core)? {
                Some((bytes, oid)) => Ok(Some((Key::decode(self.kind, &bytes)?, oid))),
                None => Ok(None),
            }
        });
        match step {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            },
            Err(e) => {
                self.done = true;
                Some(Err(e))
            },
        }
    }
}
