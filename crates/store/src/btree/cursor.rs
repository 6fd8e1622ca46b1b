//! Range cursors over a B-tree.
//!
//! A cursor is a stack of `(page, position)` frames, one per tree level.
//! Bounds are applied once when the cursor descends to its first leaf and
//! checked again on every step so iteration stops at the far edge without
//! reading further pages.

use std::cmp::Ordering;

use super::{PageReader, TreeHeader, key::KeyKind, page::PageView};
use crate::error::{Oid, Result};

/// One end of a key range.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound<K> {
    /// No limit.
    Unbounded,
    /// The key itself is in range.
    Included(K),
    /// The key itself is out of range.
    Excluded(K),
}

impl<K> Bound<K> {
    /// Converts the key of a bounded end.
    pub fn map<U>(self, f: impl FnOnce(K) -> U) -> Bound<U> {
        match self {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(k) => Bound::Included(f(k)),
            Bound::Excluded(k) => Bound::Excluded(f(k)),
        }
    }

    /// Borrows the key of a bounded end.
    pub fn as_ref(&self) -> Bound<&K> {
        match self {
            Bound::Unbounded => Bound::Unbounded,
            Bound::Included(k) => Bound::Included(k),
            Bound::Excluded(k) => Bound::Excluded(k),
        }
    }
}

/// Iteration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Smallest key first.
    #[default]
    Ascending,
    /// Largest key first.
    Descending,
}

#[derive(Debug)]
struct Frame {
    data: Vec<u8>,
    /// Internal frames: child currently descended into. Leaf frames: next
    /// item when ascending, one past the next item when descending.
    pos: usize,
}

/// Position inside a tree; pages are re-read through the reader passed to
/// each call, so the cursor itself borrows nothing.
#[derive(Debug)]
pub(crate) struct TreeCursor {
    kind: KeyKind,
    height: u32,
    order: Order,
    from: Bound<Vec<u8>>,
    till: Bound<Vec<u8>>,
    stack: Vec<Frame>,
    done: bool,
}

#[derive(Clone, Copy)]
enum Descent {
    Seek,
    Leftmost,
    Rightmost,
}

impl TreeCursor {
    pub(crate) fn new<R: PageReader + ?Sized>(
        reader: &R,
        header: &TreeHeader,
        from: Bound<Vec<u8>>,
        till: Bound<Vec<u8>>,
        order: Order,
    ) -> Result<Self> {
        let mut cursor = Self {
            kind: header.kind,
            height: header.height,
            order,
            from,
            till,
            stack: Vec::with_capacity(header.height as usize),
            done: header.root == 0,
        };
        if !cursor.done {
            cursor.descend(reader, header.root, Descent::Seek)?;
        }
        Ok(cursor)
    }

    fn is_leaf_level(&self) -> bool {
        self.stack.len() as u32 == self.height
    }

    fn start_pos(&self, view: &PageView<'_>, how: Descent) -> usize {
        let n = view.len();
        match (how, self.order) {
            (Descent::Leftmost, _) => 0,
            (Descent::Rightmost, _) => n,
            (Descent::Seek, Order::Ascending) => match &self.from {
                Bound::Unbounded => 0,
                Bound::Included(k) => view.search(k, false),
                Bound::Excluded(k) => view.search(k, true),
            },
            (Descent::Seek, Order::Descending) => match &self.till {
                Bound::Unbounded => n,
                Bound::Included(k) => view.search(k, true),
                Bound::Excluded(k) => view.search(k, false),
            },
        }
    }

    /// Pushes frames from `page` down to a leaf.
    fn descend<R: PageReader + ?Sized>(&mut self, reader: &R, mut page: Oid, how: Descent) -> Result<()> {
        loop {
            let data = reader.read_page(page)?;
            let view = PageView::new(&data, self.kind);
            view.check()?;
            let pos = self.start_pos(&view, how);
            let leaf = self.stack.len() as u32 + 1 == self.height;
            let child = (!leaf).then(|| view.reference(pos));
            self.stack.push(Frame { data, pos });
            match child {
                Some(child) => page = child,
                None => return Ok(()),
            }
        }
    }

    fn past_end(&self, key: &[u8]) -> bool {
        let compare = self.kind.ops().compare;
        match (self.order, &self.till, &self.from) {
            (Order::Ascending, Bound::Included(t), _) => compare(key, t) == Ordering::Greater,
            (Order::Ascending, Bound::Excluded(t), _) => compare(key, t) != Ordering::Less,
            (Order::Descending, _, Bound::Included(f)) => compare(key, f) == Ordering::Less,
            (Order::Descending, _, Bound::Excluded(f)) => compare(key, f) != Ordering::Greater,
            _ => false,
        }
    }

    /// Next `(key, oid)` pair in range, or `None` once exhausted.
    pub(crate) fn next<R: PageReader + ?Sized>(&mut self, reader: &R) -> Result<Option<(Vec<u8>, Oid)>> {
        while !self.done {
            let leaf = self.is_leaf_level();
            let order = self.order;
            let kind = self.kind;
            let Some(top) = self.stack.last_mut() else {
                self.done = true;
                break;
            };
            let view = PageView::new(&top.data, kind);
            let n = view.len();
            if leaf {
                let item = match order {
                    Order::Ascending if top.pos < n => {
                        top.pos += 1;
                        Some(top.pos - 1)
                    },
                    Order::Descending if top.pos > 0 => {
                        top.pos -= 1;
                        Some(top.pos)
                    },
                    _ => None,
                };
                match item {
                    Some(i) => {
                        let key = view.key(i).to_vec();
                        let oid = view.reference(i);
                        if self.past_end(&key) {
                            self.done = true;
                            return Ok(None);
                        }
                        return Ok(Some((key, oid)));
                    },
                    None => {
                        self.stack.pop();
                    },
                }
            } else {
                let child = match order {
                    Order::Ascending if top.pos < n => {
                        top.pos += 1;
                        Some((view.reference(top.pos), Descent::Leftmost))
                    },
                    Order::Descending if top.pos > 0 => {
                        top.pos -= 1;
                        Some((view.reference(top.pos), Descent::Rightmost))
                    },
                    _ => None,
                };
                match child {
                    Some((page, how)) => self.descend(reader, page, how)?,
                    None => {
                        self.stack.pop();
                    },
                }
            }
        }
        Ok(None)
    }
}
