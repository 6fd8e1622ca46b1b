//! Disk-resident B-tree indices.
//!
//! Every node is a page object, so tree pages go through the same
//! copy-on-write shadowing as any other object. The tree header (root page,
//! height, key kind, uniqueness, element count) is an ordinary record whose
//! type is marked as [`TypeKind::BTree`], which tells the collector to walk
//! the pages instead of scanning fields.
//!
//! ## Structure
//!
//! - `key.rs`: key kinds, typed keys and the per-kind operation table
//! - `page.rs`: node layout inside a page
//! - `cursor.rs`: ascending and descending range cursors
//! - `index.rs`: the public [`Index`] handle

/// Range cursors and bounds.
pub mod cursor;
mod index;
mod key;
pub(crate) mod page;

pub use cursor::{Bound, Order};
pub(crate) use cursor::TreeCursor;
pub use index::{Index, IndexIter};
pub use key::{Key, KeyKind};
pub use page::MAX_VAR_KEY as MAX_KEY_SIZE;
use page::{Node, PageView, check_key_size};

use crate::{
    error::{Error, Oid, Result},
    schema::{FieldDescriptor, FieldType, Persistent, RecordReader, RecordWriter, TypeKind},
};

/// Read access to tree pages.
pub(crate) trait PageReader {
    /// Reads page object `page`.
    fn read_page(&self, page: Oid) -> Result<Vec<u8>>;
}

/// Read-write access to tree pages.
pub(crate) trait PageProvider: PageReader {
    /// Overwrites page object `page`.
    fn write_page(&mut self, page: Oid, data: &[u8]) -> Result<()>;

    /// Allocates a zeroed page object.
    fn allocate_page(&mut self) -> Result<Oid>;

    /// Releases page object `page`.
    fn free_page(&mut self, page: Oid) -> Result<()>;
}

impl<T: PageReader + ?Sized> PageReader for &T {
    fn read_page(&self, page: Oid) -> Result<Vec<u8>> {
        (**self).read_page(page)
    }
}

impl<T: PageReader + ?Sized> PageReader for &mut T {
    fn read_page(&self, page: Oid) -> Result<Vec<u8>> {
        (**self).read_page(page)
    }
}

impl<T: PageProvider + ?Sized> PageProvider for &mut T {
    fn write_page(&mut self, page: Oid, data: &[u8]) -> Result<()> {
        (**self).write_page(page, data)
    }

    fn allocate_page(&mut self) -> Result<Oid> {
        (**self).allocate_page()
    }

    fn free_page(&mut self, page: Oid) -> Result<()> {
        (**self).free_page(page)
    }
}

/// Persisted tree header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TreeHeader {
    /// Root page object, 0 for an empty tree.
    pub(crate) root: Oid,
    /// Levels; 1 when the root is a leaf, 0 when empty.
    pub(crate) height: u32,
    pub(crate) kind: KeyKind,
    pub(crate) unique: bool,
    pub(crate) count: u64,
}

impl TreeHeader {
    pub(crate) fn new(kind: KeyKind, unique: bool) -> Self {
        Self { root: 0, height: 0, kind, unique, count: 0 }
    }
}

impl Persistent for TreeHeader {
    const TYPE_NAME: &'static str = "nacre.BTree";
    const KIND: TypeKind = TypeKind::BTree;

    fn fields() -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::new("root", FieldType::U32),
            FieldDescriptor::new("height", FieldType::U32),
            FieldDescriptor::new("kind", FieldType::U8),
            FieldDescriptor::new("unique", FieldType::Bool),
            FieldDescriptor::new("count", FieldType::U64),
        ]
    }

    fn encode(&self, w: &mut RecordWriter<'_>) {
        w.write_u32(self.root);
        w.write_u32(self.height);
        w.write_u8(self.kind as u8);
        w.write_bool(self.unique);
        w.write_u64(self.count);
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self> {
        Ok(Self {
            root: r.read_u32()?,
            height: r.read_u32()?,
            kind: KeyKind::from_tag(r.read_u8()?)?,
            unique: r.read_bool()?,
            count: r.read_u64()?,
        })
    }
}

/// What `insert` does with an existing equal key in a unique tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertMode {
    /// Leave the tree unchanged.
    Insert,
    /// Replace the stored reference.
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    Inserted,
    /// Unique key already present with this reference.
    Duplicate(Oid),
    /// Reference replaced; carries the previous one.
    Replaced(Oid),
}

/// Result of writing back a changed node.
#[derive(Debug)]
enum Settle {
    Ok,
    /// The node was split; the parent must insert `separator` before `right`.
    Split { separator: Vec<u8>, right: Oid },
    Underflow,
}

/// Tree operations over a page provider.
pub(crate) struct BTree<P> {
    provider: P,
    pub(crate) header: TreeHeader,
}

/// First position whose key is `>= key`.
fn lower_bound(node: &Node, kind: KeyKind, key: &[u8]) -> usize {
    let compare = kind.ops().compare;
    node.keys.partition_point(|k| compare(k, key) == std::cmp::Ordering::Less)
}

/// First position whose key is `> key`.
fn upper_bound(node: &Node, kind: KeyKind, key: &[u8]) -> usize {
    let compare = kind.ops().compare;
    node.keys.partition_point(|k| compare(k, key) != std::cmp::Ordering::Greater)
}

/// Splits an overfull node; returns `(left, separator, right)`.
fn split_node(mut node: Node, kind: KeyKind) -> (Node, Vec<u8>, Node) {
    let leaf = node.is_leaf();
    let m = Node::split_point(&node.keys, kind, leaf);
    if leaf {
        let right = Node { keys: node.keys.split_off(m), refs: node.refs.split_off(m) };
        let separator = node.keys[m - 1].clone();
        (node, separator, right)
    } else {
        let right_keys = node.keys.split_off(m + 1);
        let right_refs = node.refs.split_off(m + 1);
        let separator = node.keys.pop().unwrap_or_default();
        (node, separator, Node { keys: right_keys, refs: right_refs })
    }
}

impl<P: PageReader> BTree<P> {
    pub(crate) fn new(provider: P, header: TreeHeader) -> Self {
        Self { provider, header }
    }

    fn load(&self, page: Oid, leaf: bool) -> Result<Node> {
        Node::decode(&self.provider.read_page(page)?, self.header.kind, leaf)
    }

    /// Opens a cursor over `[from, till]` in `order`.
    pub(crate) fn cursor(&self, from: Bound<Vec<u8>>, till: Bound<Vec<u8>>, order: Order) -> Result<TreeCursor> {
        TreeCursor::new(&self.provider, &self.header, from, till, order)
    }

    /// Collects up to `limit` pairs of the range in ascending order.
    pub(crate) fn find(
        &self,
        from: Bound<Vec<u8>>,
        till: Bound<Vec<u8>>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Oid)>> {
        let mut cursor = self.cursor(from, till, Order::Ascending)?;
        let mut out = Vec::new();
        while out.len() < limit {
            match cursor.next(&self.provider)? {
                Some(item) => out.push(item),
                None => break,
            }
        }
        Ok(out)
    }

    /// Reference stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyNotUnique`] if more than one entry matches.
    pub(crate) fn get(&self, key: &[u8]) -> Result<Option<Oid>> {
        let found = self.find(Bound::Included(key.to_vec()), Bound::Included(key.to_vec()), 2)?;
        match found.as_slice() {
            [] => Ok(None),
            [(_, oid)] => Ok(Some(*oid)),
            _ => Err(Error::KeyNotUnique),
        }
    }

    /// Calls `visit(page, level, view)` for every page, parents first.
    /// Level 1 is the leaf level.
    pub(crate) fn visit_pages(&self, visit: &mut dyn FnMut(Oid, u32, &PageView<'_>) -> Result<()>) -> Result<()> {
        if self.header.root != 0 {
            walk_pages(&self.provider, self.header.kind, self.header.root, self.header.height, visit)?;
        }
        Ok(())
    }

    /// Checks ordering, balance and occupancy of the whole tree.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseCorrupted`] describing the first violation.
    pub(crate) fn verify(&self) -> Result<()> {
        if self.header.root == 0 {
            return if self.header.height == 0 && self.header.count == 0 {
                Ok(())
            } else {
                Err(Error::corrupted("empty tree with non-zero height or count"))
            };
        }
        let mut count = 0u64;
        self.verify_page(self.header.root, self.header.height, true, None, None, &mut count)?;
        if count != self.header.count {
            return Err(Error::corrupted(format!("tree holds {count} items, header says {}", self.header.count)));
        }
        Ok(())
    }

    fn verify_page(
        &self,
        page: Oid,
        level: u32,
        is_root: bool,
        low: Option<&[u8]>,
        high: Option<&[u8]>,
        count: &mut u64,
    ) -> Result<()> {
        use std::cmp::Ordering::{Greater, Less};

        let kind = self.header.kind;
        let compare = kind.ops().compare;
        let leaf = level == 1;
        let node = self.load(page, leaf)?;
        if !is_root && node.below_min_fill(kind) {
            return Err(Error::corrupted(format!("page {page} at level {level} is below minimum fill")));
        }
        if node.keys.is_empty() {
            return Err(Error::corrupted(format!("page {page} at level {level} is empty")));
        }
        for pair in node.keys.windows(2) {
            if compare(&pair[0], &pair[1]) == Greater {
                return Err(Error::corrupted(format!("keys out of order in page {page}")));
            }
        }
        for key in &node.keys {
            if low.is_some_and(|l| compare(key, l) == Less) || high.is_some_and(|h| compare(key, h) == Greater) {
                return Err(Error::corrupted(format!("key outside its parent range in page {page}")));
            }
        }
        if leaf {
            *count += node.keys.len() as u64;
            return Ok(());
        }
        for (i, &child) in node.refs.iter().enumerate() {
            let child_low = if i == 0 { low } else { Some(node.keys[i - 1].as_slice()) };
            let child_high = if i == node.keys.len() { high } else { Some(node.keys[i].as_slice()) };
            self.verify_page(child, level - 1, false, child_low, child_high, count)?;
        }
        Ok(())
    }
}

/// Recursive page walk, parents first.
pub(crate) fn walk_pages<R: PageReader + ?Sized>(
    reader: &R,
    kind: KeyKind,
    page: Oid,
    level: u32,
    visit: &mut dyn FnMut(Oid, u32, &PageView<'_>) -> Result<()>,
) -> Result<()> {
    let data = reader.read_page(page)?;
    let view = PageView::new(&data, kind);
    view.check()?;
    visit(page, level, &view)?;
    if level > 1 {
        for i in 0..=view.len() {
            walk_pages(reader, kind, view.reference(i), level - 1, visit)?;
        }
    }
    Ok(())
}

impl<P: PageProvider> BTree<P> {
    /// Writes a changed node back, splitting it if it no longer fits.
    fn store(&mut self, page: Oid, node: Node) -> Result<Settle> {
        let kind = self.header.kind;
        if node.fits(kind) {
            self.provider.write_page(page, &node.encode(kind))?;
            return Ok(if node.underflows(kind) { Settle::Underflow } else { Settle::Ok });
        }
        let (left, separator, right) = split_node(node, kind);
        let right_page = self.provider.allocate_page()?;
        self.provider.write_page(page, &left.encode(kind))?;
        self.provider.write_page(right_page, &right.encode(kind))?;
        Ok(Settle::Split { separator, right: right_page })
    }

    fn grow_root(&mut self, separator: Vec<u8>, right: Oid) -> Result<()> {
        let page = self.provider.allocate_page()?;
        let root = Node { keys: vec![separator], refs: vec![self.header.root, right] };
        self.provider.write_page(page, &root.encode(self.header.kind))?;
        self.header.root = page;
        self.header.height += 1;
        Ok(())
    }

    /// Drops roots left without keys.
    fn shrink_root(&mut self) -> Result<()> {
        while self.header.root != 0 {
            let leaf = self.header.height == 1;
            let node = self.load(self.header.root, leaf)?;
            if !node.keys.is_empty() {
                break;
            }
            self.provider.free_page(self.header.root)?;
            if leaf {
                self.header.root = 0;
                self.header.height = 0;
            } else {
                self.header.root = node.refs[0];
                self.header.height -= 1;
            }
        }
        Ok(())
    }

    /// Inserts `key -> oid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyTooLarge`] for an oversized variable-size key.
    pub(crate) fn insert(&mut self, key: &[u8], oid: Oid, mode: InsertMode) -> Result<InsertOutcome> {
        let kind = self.header.kind;
        check_key_size(kind, key)?;
        if self.header.root == 0 {
            let page = self.provider.allocate_page()?;
            let node = Node { keys: vec![key.to_vec()], refs: vec![oid] };
            self.provider.write_page(page, &node.encode(kind))?;
            self.header.root = page;
            self.header.height = 1;
            self.header.count = 1;
            return Ok(InsertOutcome::Inserted);
        }
        let (outcome, settle) = self.insert_into(self.header.root, self.header.height, key, oid, mode)?;
        if let Settle::Split { separator, right } = settle {
            self.grow_root(separator, right)?;
        }
        if outcome == InsertOutcome::Inserted {
            self.header.count += 1;
        }
        Ok(outcome)
    }

    fn insert_into(
        &mut self,
        page: Oid,
        level: u32,
        key: &[u8],
        oid: Oid,
        mode: InsertMode,
    ) -> Result<(InsertOutcome, Settle)> {
        let kind = self.header.kind;
        let leaf = level == 1;
        let mut node = self.load(page, leaf)?;
        let i = lower_bound(&node, kind, key);
        if leaf {
            let equal = i < node.keys.len() && (kind.ops().compare)(&node.keys[i], key).is_eq();
            if self.header.unique && equal {
                return match mode {
                    InsertMode::Insert => Ok((InsertOutcome::Duplicate(node.refs[i]), Settle::Ok)),
                    InsertMode::Set => {
                        let previous = std::mem::replace(&mut node.refs[i], oid);
                        self.provider.write_page(page, &node.encode(kind))?;
                        Ok((InsertOutcome::Replaced(previous), Settle::Ok))
                    },
                };
            }
            let at = if self.header.unique { i } else { upper_bound(&node, kind, key) };
            node.keys.insert(at, key.to_vec());
            node.refs.insert(at, oid);
            let settle = self.store(page, node)?;
            return Ok((InsertOutcome::Inserted, settle));
        }
        let (outcome, settle) = self.insert_into(node.refs[i], level - 1, key, oid, mode)?;
        match settle {
            Settle::Split { separator, right } => {
                node.keys.insert(i, separator);
                node.refs.insert(i + 1, right);
                Ok((outcome, self.store(page, node)?))
            },
            Settle::Ok | Settle::Underflow => Ok((outcome, Settle::Ok)),
        }
    }

    /// Removes one entry with `key` (and reference `oid`, if given).
    /// Returns the removed reference.
    pub(crate) fn remove(&mut self, key: &[u8], oid: Option<Oid>) -> Result<Option<Oid>> {
        if self.header.root == 0 {
            return Ok(None);
        }
        let (removed, settle) = self.remove_from(self.header.root, self.header.height, key, oid)?;
        if removed.is_none() {
            return Ok(None);
        }
        self.header.count = self.header.count.saturating_sub(1);
        match settle {
            Settle::Split { separator, right } => self.grow_root(separator, right)?,
            Settle::Ok | Settle::Underflow => self.shrink_root()?,
        }
        Ok(removed)
    }

    fn remove_from(&mut self, page: Oid, level: u32, key: &[u8], oid: Option<Oid>) -> Result<(Option<Oid>, Settle)> {
        let kind = self.header.kind;
        let compare = kind.ops().compare;
        let leaf = level == 1;
        let mut node = self.load(page, leaf)?;
        let mut i = lower_bound(&node, kind, key);
        if leaf {
            while i < node.keys.len() && compare(&node.keys[i], key).is_eq() {
                if oid.is_none_or(|o| o == node.refs[i]) {
                    let removed = node.refs.remove(i);
                    node.keys.remove(i);
                    return Ok((Some(removed), self.store(page, node)?));
                }
                i += 1;
            }
            return Ok((None, Settle::Ok));
        }
        loop {
            let (removed, settle) = self.remove_from(node.refs[i], level - 1, key, oid)?;
            if removed.is_some() {
                let settle = match settle {
                    Settle::Ok => Settle::Ok,
                    Settle::Split { separator, right } => {
                        node.keys.insert(i, separator);
                        node.refs.insert(i + 1, right);
                        self.store(page, node)?
                    },
                    Settle::Underflow => {
                        self.rebalance(&mut node, i, level - 1)?;
                        self.store(page, node)?
                    },
                };
                return Ok((removed, settle));
            }
            // Equal keys may continue in the next child.
            if i < node.keys.len() && compare(&node.keys[i], key).is_eq() {
                i += 1;
            } else {
                return Ok((None, Settle::Ok));
            }
        }
    }

    /// Merges or redistributes the underflowing child `i` of `parent` with a
    /// neighbour. The parent is updated in memory; the caller stores it.
    fn rebalance(&mut self, parent: &mut Node, i: usize, child_level: u32) -> Result<()> {
        if parent.keys.is_empty() {
            return Ok(());
        }
        let kind = self.header.kind;
        let leaf = child_level == 1;
        let a = if i < parent.keys.len() { i } else { i - 1 };
        let (left_page, right_page) = (parent.refs[a], parent.refs[a + 1]);
        let left = self.load(left_page, leaf)?;
        let right = self.load(right_page, leaf)?;

        let mut merged = left;
        if !leaf {
            merged.keys.push(parent.keys[a].clone());
        }
        merged.keys.extend(right.keys);
        merged.refs.extend(right.refs);

        if merged.fits(kind) {
            self.provider.write_page(left_page, &merged.encode(kind))?;
            self.provider.free_page(right_page)?;
            parent.keys.remove(a);
            parent.refs.remove(a + 1);
        } else {
            let (left, separator, right) = split_node(merged, kind);
            self.provider.write_page(left_page, &left.encode(kind))?;
            self.provider.write_page(right_page, &right.encode(kind))?;
            parent.keys[a] = separator;
        }
        Ok(())
    }

    /// Frees every page and empties the tree.
    pub(crate) fn clear(&mut self) -> Result<()> {
        let mut pages = Vec::new();
        self.visit_pages(&mut |page, _, _| {
            pages.push(page);
            Ok(())
        })?;
        for page in pages {
            self.provider.free_page(page)?;
        }
        self.header.root = 0;
        self.header.height = 0;
        self.header.count = 0;
        Ok(())
    }
}
