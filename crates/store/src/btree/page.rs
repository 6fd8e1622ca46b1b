//! On-page layout of B-tree nodes.
//!
//! Every node is one page object:
//!
//! ```text
//! 0..2   item count n (u16)
//! 2..4   key heap bytes in use (u16, variable kinds only)
//! 4..8   rightmost child (u32, internal nodes only)
//! 8..    items
//! ```
//!
//! Fixed-size kinds keep a key array growing up from offset 8 and the
//! parallel reference array growing down from the end of the page. Variable
//! kinds keep an array of `{offset: u16, len: u16, ref: u32}` slots growing
//! up and the key bytes in a heap growing down from the end of the page.
//!
//! Leaves hold `n` (key, oid) pairs. Internal nodes hold `n` keys and `n + 1`
//! children; every key in child `i` is `<=` key `i`, and keys in child
//! `i + 1` are `>=` key `i`.

use std::cmp::Ordering;

use byteorder::{ByteOrder, LittleEndian};

use super::key::KeyKind;
use crate::{
    error::{Error, Oid, Result},
    layout::PAGE_SIZE,
};

pub(crate) const HEADER_SIZE: usize = 8;
const SLOT_SIZE: usize = 8;
const USABLE: usize = PAGE_SIZE - HEADER_SIZE;

/// Largest variable-size key, so that a slot plus key fits a quarter page.
pub const MAX_VAR_KEY: usize = USABLE / 4 - SLOT_SIZE;

/// Occupancy every non-root node of a variable kind keeps.
///
/// Items are up to a quarter page each, so a split can miss the exact middle
/// by one item; a node is guaranteed half the usable bytes minus one item.
const MIN_VAR_FILL: usize = USABLE / 2 - (SLOT_SIZE + MAX_VAR_KEY);

/// Items of a fixed-size kind that fit in one page.
pub(crate) fn fixed_capacity(size: usize) -> usize {
    USABLE / (size + 4)
}

/// Read-only view of a node page.
pub(crate) struct PageView<'a> {
    data: &'a [u8],
    kind: KeyKind,
}

impl<'a> PageView<'a> {
    pub(crate) fn new(data: &'a [u8], kind: KeyKind) -> Self {
        Self { data, kind }
    }

    pub(crate) fn len(&self) -> usize {
        usize::from(LittleEndian::read_u16(&self.data[0..2]))
    }

    pub(crate) fn key(&self, i: usize) -> &'a [u8] {
        match self.kind.fixed_size() {
            Some(size) => &self.data[HEADER_SIZE + i * size..HEADER_SIZE + (i + 1) * size],
            None => {
                let slot = HEADER_SIZE + i * SLOT_SIZE;
                let off = usize::from(LittleEndian::read_u16(&self.data[slot..slot + 2]));
                let len = usize::from(LittleEndian::read_u16(&self.data[slot + 2..slot + 4]));
                &self.data[off..off + len]
            },
        }
    }

    /// Reference `i`; for an internal node `i == len()` is the rightmost child.
    pub(crate) fn reference(&self, i: usize) -> Oid {
        if i == self.len() {
            return LittleEndian::read_u32(&self.data[4..8]);
        }
        match self.kind.fixed_size() {
            Some(_) => {
                let at = PAGE_SIZE - 4 * (i + 1);
                LittleEndian::read_u32(&self.data[at..at + 4])
            },
            None => {
                let slot = HEADER_SIZE + i * SLOT_SIZE;
                LittleEndian::read_u32(&self.data[slot + 4..slot + 8])
            },
        }
    }

    /// First position whose key is `>= key`, or `> key` when `strict`.
    pub(crate) fn search(&self, key: &[u8], strict: bool) -> usize {
        let compare = self.kind.ops().compare;
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let ord = compare(self.key(mid), key);
            if ord == Ordering::Less || (strict && ord == Ordering::Equal) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    /// Checks the header against the layout limits.
    pub(crate) fn check(&self) -> Result<()> {
        let n = self.len();
        let ok = match self.kind.fixed_size() {
            Some(size) => n <= fixed_capacity(size),
            None => {
                n * SLOT_SIZE <= USABLE
                    && (0..n).all(|i| {
                        let slot = HEADER_SIZE + i * SLOT_SIZE;
                        let off = usize::from(LittleEndian::read_u16(&self.data[slot..slot + 2]));
                        let len = usize::from(LittleEndian::read_u16(&self.data[slot + 2..slot + 4]));
                        off >= HEADER_SIZE && off + len <= PAGE_SIZE
                    })
            },
        };
        if ok { Ok(()) } else { Err(Error::corrupted(format!("B-tree page with {n} items is malformed"))) }
    }
}

/// Decoded node, used while a page is being changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Node {
    pub(crate) keys: Vec<Vec<u8>>,
    /// `keys.len()` oids for a leaf, `keys.len() + 1` children otherwise.
    pub(crate) refs: Vec<Oid>,
}

impl Node {
    pub(crate) fn decode(data: &[u8], kind: KeyKind, leaf: bool) -> Result<Self> {
        let view = PageView::new(data, kind);
        view.check()?;
        let n = view.len();
        let keys = (0..n).map(|i| view.key(i).to_vec()).collect();
        let count = if leaf { n } else { n + 1 };
        let refs = (0..count).map(|i| view.reference(i)).collect();
        Ok(Self { keys, refs })
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.refs.len() == self.keys.len()
    }

    /// Bytes the node occupies below the page header.
    pub(crate) fn used(&self, kind: KeyKind) -> usize {
        match kind.fixed_size() {
            Some(size) => self.keys.len() * (size + 4),
            None => self.keys.iter().map(|k| SLOT_SIZE + k.len()).sum(),
        }
    }

    pub(crate) fn fits(&self, kind: KeyKind) -> bool {
        self.used(kind) <= USABLE
    }

    /// Whether a non-root node is less than half full and should be merged
    /// with or topped up from a sibling.
    pub(crate) fn underflows(&self, kind: KeyKind) -> bool {
        match kind.fixed_size() {
            Some(size) => self.keys.len() < fixed_capacity(size) / 2,
            None => self.used(kind) < USABLE / 2,
        }
    }

    /// Whether a non-root node is below the occupancy splits and rebalancing
    /// guarantee. Equal to [`Node::underflows`] for fixed kinds.
    pub(crate) fn below_min_fill(&self, kind: KeyKind) -> bool {
        match kind.fixed_size() {
            Some(_) => self.underflows(kind),
            None => self.used(kind) < MIN_VAR_FILL,
        }
    }

    pub(crate) fn encode(&self, kind: KeyKind) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        let n = self.keys.len();
        LittleEndian::write_u16(&mut page[0..2], n as u16);
        if !self.is_leaf() {
            LittleEndian::write_u32(&mut page[4..8], self.refs[n]);
        }
        match kind.fixed_size() {
            Some(size) => {
                for (i, key) in self.keys.iter().enumerate() {
                    page[HEADER_SIZE + i * size..HEADER_SIZE + (i + 1) * size].copy_from_slice(&key[..size]);
                    let at = PAGE_SIZE - 4 * (i + 1);
                    LittleEndian::write_u32(&mut page[at..at + 4], self.refs[i]);
                }
            },
            None => {
                let mut heap_top = PAGE_SIZE;
                for (i, key) in self.keys.iter().enumerate() {
                    heap_top -= key.len();
                    page[heap_top..heap_top + key.len()].copy_from_slice(key);
                    let slot = HEADER_SIZE + i * SLOT_SIZE;
                    LittleEndian::write_u16(&mut page[slot..slot + 2], heap_top as u16);
                    LittleEndian::write_u16(&mut page[slot + 2..slot + 4], key.len() as u16);
                    LittleEndian::write_u32(&mut page[slot + 4..slot + 8], self.refs[i]);
                }
                LittleEndian::write_u16(&mut page[2..4], (PAGE_SIZE - heap_top) as u16);
            },
        }
        page
    }

    /// Split point for an overfull sequence of keys.
    ///
    /// A leaf keeps `keys[..m]` on the left; an internal node moves `keys[m]`
    /// up, so it is counted on neither side. Fixed kinds split by count.
    /// Variable kinds take the point where both sides fit a page and the
    /// smaller side is largest.
    pub(crate) fn split_point(keys: &[Vec<u8>], kind: KeyKind, leaf: bool) -> usize {
        let n = keys.len();
        let (lo, hi) = if leaf { (1, n.saturating_sub(1)) } else { (1, n.saturating_sub(2)) };
        if kind.fixed_size().is_some() {
            return (n / 2).clamp(lo, hi.max(lo));
        }
        let total: usize = keys.iter().map(|k| SLOT_SIZE + k.len()).sum();
        let mut best: Option<(usize, usize)> = None;
        let mut left = 0;
        for (m, key) in keys.iter().enumerate() {
            let size = SLOT_SIZE + key.len();
            if (lo..=hi).contains(&m) {
                let right = total - left - if leaf { 0 } else { size };
                let smaller = left.min(right);
                if left <= USABLE && right <= USABLE && best.is_none_or(|(s, _)| smaller > s) {
                    best = Some((smaller, m));
                }
            }
            left += size;
        }
        best.map_or((n / 2).clamp(lo, hi.max(lo)), |(_, m)| m)
    }
}

/// Rejects keys that could not share a page with three others.
pub(crate) fn check_key_size(kind: KeyKind, key: &[u8]) -> Result<()> {
    if kind.fixed_size().is_none() && key.len() > MAX_VAR_KEY {
        return Err(Error::KeyTooLarge { size: key.len(), max: MAX_VAR_KEY });
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::btree::Key;

    fn i64_key(v: i64) -> Vec<u8> {
        Key::I64(v).encode().unwrap()
    }

    #[test]
    fn test_fixed_leaf_roundtrip_and_search() {
        let node = Node { keys: (0..10).map(|v| i64_key(v * 10)).collect(), refs: (100..110).collect() };
        let page = node.encode(KeyKind::I64);
        let view = PageView::new(&page, KeyKind::I64);

        assert_eq!(view.len(), 10);
        assert_eq!(view.reference(3), 103);
        assert_eq!(view.search(&i64_key(30), false), 3);
        assert_eq!(view.search(&i64_key(30), true), 4);
        assert_eq!(view.search(&i64_key(35), false), 4);
        assert_eq!(Node::decode(&page, KeyKind::I64, true).unwrap(), node);
    }

    #[test]
    fn test_internal_node_keeps_rightmost_child() {
        let node = Node { keys: vec![b"m".to_vec()], refs: vec![7, 8] };
        let page = node.encode(KeyKind::Str);
        let view = PageView::new(&page, KeyKind::Str);
        assert_eq!(view.reference(0), 7);
        assert_eq!(view.reference(1), 8);
        assert_eq!(Node::decode(&page, KeyKind::Str, false).unwrap(), node);
    }

    #[test]
    fn test_capacity_and_underflow_for_fixed_kinds() {
        let cap = fixed_capacity(8);
        assert_eq!(cap, 340);
        let full = Node { keys: vec![i64_key(0); cap], refs: vec![1; cap] };
        assert!(full.fits(KeyKind::I64));
        let over = Node { keys: vec![i64_key(0); cap + 1], refs: vec![1; cap + 1] };
        assert!(!over.fits(KeyKind::I64));
        let low = Node { keys: vec![i64_key(0); cap / 2 - 1], refs: vec![1; cap / 2 - 1] };
        assert!(low.underflows(KeyKind::I64));
    }

    #[test]
    fn test_variable_split_balances_bytes() {
        let mut keys = vec![vec![b'a'; 1000]];
        keys.extend((0..30).map(|i| vec![b'b' + i as u8; 20]));
        let m = Node::split_point(&keys, KeyKind::Bytes, true);
        let left: usize = keys[..m].iter().map(|k| k.len() + 8).sum();
        let right: usize = keys[m..].iter().map(|k| k.len() + 8).sum();
        assert!(m >= 1 && m < keys.len());
        assert!(left >= right || m == 1, "left {left} right {right}");
    }

    #[test]
    fn test_internal_split_counts_promoted_key() {
        // Four maximal keys then a small one: promoting the fourth would
        // leave the small key alone on the right.
        let mut keys: Vec<Vec<u8>> = (0..4).map(|i| vec![b'a' + i; MAX_VAR_KEY]).collect();
        keys.push(b"z".to_vec());
        let m = Node::split_point(&keys, KeyKind::Bytes, false);
        let left = Node { keys: keys[..m].to_vec(), refs: vec![1; m + 1] };
        let right = Node { keys: keys[m + 1..].to_vec(), refs: vec![1; keys.len() - m] };
        assert_eq!(m, 2);
        assert!(!left.below_min_fill(KeyKind::Bytes));
        assert!(!right.below_min_fill(KeyKind::Bytes));
    }

    #[test]
    fn test_split_sides_fit_and_meet_minimum() {
        // Sizes cycling between tiny and maximal, from every starting point.
        let sizes = [1, MAX_VAR_KEY, 40, MAX_VAR_KEY - 3, 2, 700, MAX_VAR_KEY, 9];
        let used = |keys: &[Vec<u8>]| keys.iter().map(|k| SLOT_SIZE + k.len()).sum::<usize>();
        for start in 0..sizes.len() {
            let mut keys = Vec::new();
            while used(&keys) <= USABLE {
                keys.push(vec![b'k'; sizes[(start + keys.len()) % sizes.len()]]);
            }
            for leaf in [true, false] {
                let m = Node::split_point(&keys, KeyKind::Str, leaf);
                let right_from = if leaf { m } else { m + 1 };
                for side in [&keys[..m], &keys[right_from..]] {
                    let node = Node { keys: side.to_vec(), refs: vec![1; side.len()] };
                    let context = format!("start {start}, leaf {leaf}, {} keys, split at {m}", keys.len());
                    assert!(node.fits(KeyKind::Str), "{context}");
                    assert!(!node.below_min_fill(KeyKind::Str), "{context}");
                }
            }
        }
    }

    #[test]
    fn test_variable_underflow_is_half_page() {
        let half = Node { keys: vec![vec![0; USABLE / 2 - SLOT_SIZE]], refs: vec![1] };
        assert!(!half.underflows(KeyKind::Bytes));
        let less = Node { keys: vec![vec![0; USABLE / 2 - SLOT_SIZE - 1]], refs: vec![1] };
        assert!(less.underflows(KeyKind::Bytes));
        assert!(!less.below_min_fill(KeyKind::Bytes));
    }

    #[test]
    fn test_key_size_limit() {
        assert!(check_key_size(KeyKind::Str, &[0; MAX_VAR_KEY]).is_ok());
        let err = check_key_size(KeyKind::Str, &[0; MAX_VAR_KEY + 1]).unwrap_err();
        assert!(matches!(err, Error::KeyTooLarge { size, max } if size == MAX_VAR_KEY + 1 && max == MAX_VAR_KEY));
    }

    #[test]
    fn test_corrupted_count_is_rejected() {
        let mut page = vec![0u8; PAGE_SIZE];
        LittleEndian::write_u16(&mut page[0..2], 4000);
        assert!(Node::decode(&page, KeyKind::I64, true).is_err());
    }
}
