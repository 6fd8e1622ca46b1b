//! Key kinds, typed keys and their byte encodings.
//!
//! Keys are stored in pages as raw bytes. Each [`KeyKind`] has an entry in a
//! static operation table giving its fixed size (if any), a comparator over
//! encoded bytes and a decoder back to a [`Key`].

use std::cmp::Ordering;

use crate::error::{Error, Oid, Result};

/// Kind of key an index is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// `bool`.
    Bool = 0,
    /// `i8`.
    I8 = 1,
    /// `u8`.
    U8 = 2,
    /// `i16`.
    I16 = 3,
    /// `u16`.
    U16 = 4,
    /// UTF-16 code unit.
    Char = 5,
    /// `i32`.
    I32 = 6,
    /// `u32`.
    U32 = 7,
    /// `i64`.
    I64 = 8,
    /// `u64`.
    U64 = 9,
    /// `f32`, ordered by `total_cmp`.
    F32 = 10,
    /// `f64`, ordered by `total_cmp`.
    F64 = 11,
    /// Milliseconds since the epoch.
    Date = 12,
    /// Object reference, ordered by oid.
    Object = 13,
    /// String, ordered by its UTF-8 bytes.
    Str = 14,
    /// Byte string, ordered lexicographically.
    Bytes = 15,
    /// Tuple of other keys, ordered component by component.
    Compound = 16,
}

impl KeyKind {
    const ALL: [KeyKind; 17] = [
        KeyKind::Bool,
        KeyKind::I8,
        KeyKind::U8,
        KeyKind::I16,
        KeyKind::U16,
        KeyKind::Char,
        KeyKind::I32,
        KeyKind::U32,
        KeyKind::I64,
        KeyKind::U64,
        KeyKind::F32,
        KeyKind::F64,
        KeyKind::Date,
        KeyKind::Object,
        KeyKind::Str,
        KeyKind::Bytes,
        KeyKind::Compound,
    ];

    /// Decodes a persisted kind tag.
    pub(crate) fn from_tag(tag: u8) -> Result<Self> {
        Self::ALL
            .get(usize::from(tag))
            .copied()
            .ok_or_else(|| Error::corrupted(format!("unknown key kind {tag}")))
    }

    /// Encoded size of every key of this kind, or `None` for variable-size kinds.
    pub fn fixed_size(self) -> Option<usize> {
        ops(self).size
    }

    pub(crate) fn ops(self) -> &'static KeyOps {
        ops(self)
    }
}

/// A typed key value.
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    /// `bool`.
    Bool(bool),
    /// `i8`.
    I8(i8),
    /// `u8`.
    U8(u8),
    /// `i16`.
    I16(i16),
    /// `u16`.
    U16(u16),
    /// UTF-16 code unit.
    Char(u16),
    /// `i32`.
    I32(i32),
    /// `u32`.
    U32(u32),
    /// `i64`.
    I64(i64),
    /// `u64`.
    U64(u64),
    /// `f32`.
    F32(f32),
    /// `f64`.
    F64(f64),
    /// Milliseconds since the epoch.
    Date(i64),
    /// Object reference.
    Object(Oid),
    /// String.
    Str(String),
    /// Byte string.
    Bytes(Vec<u8>),
    /// Tuple of keys; must not nest another compound.
    Compound(Vec<Key>),
}

impl Key {
    /// Kind of this key.
    pub fn kind(&self) -> KeyKind {
        match self {
            Key::Bool(_) => KeyKind::Bool,
            Key::I8(_) => KeyKind::I8,
            Key::U8(_) => KeyKind::U8,
            Key::I16(_) => KeyKind::I16,
            Key::U16(_) => KeyKind::U16,
            Key::Char(_) => KeyKind::Char,
            Key::I32(_) => KeyKind::I32,
            Key::U32(_) => KeyKind::U32,
            Key::I64(_) => KeyKind::I64,
            Key::U64(_) => KeyKind::U64,
            Key::F32(_) => KeyKind::F32,
            Key::F64(_) => KeyKind::F64,
            Key::Date(_) => KeyKind::Date,
            Key::Object(_) => KeyKind::Object,
            Key::Str(_) => KeyKind::Str,
            Key::Bytes(_) => KeyKind::Bytes,
            Key::Compound(_) => KeyKind::Compound,
        }
    }

    /// Page encoding of the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessViolation`] for a nested compound key or a
    /// compound component longer than `u16::MAX` bytes.
    pub(crate) fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.kind().fixed_size().unwrap_or(16));
        match self {
            Key::Compound(parts) => {
                for part in parts {
                    if matches!(part, Key::Compound(_)) {
                        return Err(Error::access("compound keys cannot nest"));
                    }
                    out.push(part.kind() as u8);
                    let mut raw = Vec::new();
                    part.encode_simple(&mut raw);
                    if part.kind().fixed_size().is_none() {
                        let len = u16::try_from(raw.len())
                            .map_err(|_| Error::access("compound key component too long"))?;
                        out.extend_from_slice(&len.to_le_bytes());
                    }
                    out.extend_from_slice(&raw);
                }
            },
            simple => simple.encode_simple(&mut out),
        }
        Ok(out)
    }

    fn encode_simple(&self, out: &mut Vec<u8>) {
        match self {
            Key::Bool(v) => out.push(u8::from(*v)),
            Key::I8(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::U8(v) => out.push(*v),
            Key::I16(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::U16(v) | Key::Char(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::U32(v) | Key::Object(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::I64(v) | Key::Date(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::U64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::F64(v) => out.extend_from_slice(&v.to_le_bytes()),
            Key::Str(s) => out.extend_from_slice(s.as_bytes()),
            Key::Bytes(b) => out.extend_from_slice(b),
            Key::Compound(_) => {},
        }
    }

    /// Decodes page bytes of `kind`.
    pub(crate) fn decode(kind: KeyKind, bytes: &[u8]) -> Result<Key> {
        if let Some(size) = kind.fixed_size()
            && bytes.len() < size
        {
            return Err(Error::corrupted(format!("{kind:?} key of {} bytes", bytes.len())));
        }
        (ops(kind).decode)(bytes)
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::I64(v)
    }
}

impl From<i32> for Key {
    fn from(v: i32) -> Self {
        Key::I32(v)
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Str(v.to_owned())
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Str(v)
    }
}

/// Per-kind operations on encoded keys.
pub(crate) struct KeyOps {
    pub(crate) size: Option<usize>,
    pub(crate) compare: fn(&[u8], &[u8]) -> Ordering,
    pub(crate) decode: fn(&[u8]) -> Result<Key>,
}

fn raw<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

macro_rules! int_ops {
    ($variant:ident, $ty:ty) => {
        KeyOps {
            size: Some(std::mem::size_of::<$ty>()),
            compare: |a, b| <$ty>::from_le_bytes(raw(a)).cmp(&<$ty>::from_le_bytes(raw(b))),
            decode: |b| Ok(Key::$variant(<$ty>::from_le_bytes(raw(b)))),
        }
    };
}

macro_rules! float_ops {
    ($variant:ident, $ty:ty) => {
        KeyOps {
            size: Some(std::mem::size_of::<$ty>()),
            compare: |a, b| <$ty>::from_le_bytes(raw(a)).total_cmp(&<$ty>::from_le_bytes(raw(b))),
            decode: |b| Ok(Key::$variant(<$ty>::from_le_bytes(raw(b)))),
        }
    };
}

static KEY_OPS: [KeyOps; 17] = [
    KeyOps { size: Some(1), compare: |a, b| a[0].cmp(&b[0]), decode: |b| Ok(Key::Bool(b[0] != 0)) },
    int_ops!(I8, i8),
    int_ops!(U8, u8),
    int_ops!(I16, i16),
    int_ops!(U16, u16),
    int_ops!(Char, u16),
    int_ops!(I32, i32),
    int_ops!(U32, u32),
    int_ops!(I64, i64),
    int_ops!(U64, u64),
    float_ops!(F32, f32),
    float_ops!(F64, f64),
    int_ops!(Date, i64),
    int_ops!(Object, u32),
    KeyOps {
        size: None,
        compare: |a, b| a.cmp(b),
        decode: |b| {
            String::from_utf8(b.to_vec())
                .map(Key::Str)
                .map_err(|_| Error::corrupted("string key is not UTF-8"))
        },
    },
    KeyOps { size: None, compare: |a, b| a.cmp(b), decode: |b| Ok(Key::Bytes(b.to_vec())) },
    KeyOps { size: None, compare: compare_compound, decode: decode_compound },
];

fn ops(kind: KeyKind) -> &'static KeyOps {
    &KEY_OPS[kind as usize]
}

/// Splits the next `(kind, bytes)` component off an encoded compound key.
fn next_component(bytes: &[u8]) -> Option<(KeyKind, &[u8], &[u8])> {
    let (&tag, rest) = bytes.split_first()?;
    let kind = KeyKind::from_tag(tag).ok()?;
    let (len, rest) = match kind.fixed_size() {
        Some(size) => (size, rest),
        None => {
            let len = u16::from_le_bytes([*rest.first()?, *rest.get(1)?]) as usize;
            (len, &rest[2..])
        },
    };
    if rest.len() < len {
        return None;
    }
    Some((kind, &rest[..len], &rest[len..]))
}

/// Component-wise comparison; a key that runs out first compares equal, so
/// a shorter bound matches every key it prefixes.
fn compare_compound(mut a: &[u8], mut b: &[u8]) -> Ordering {
    loop {
        let (Some((ka, va, ra)), Some((kb, vb, rb))) = (next_component(a), next_component(b)) else {
            return Ordering::Equal;
        };
        let ord = if ka == kb { (ops(ka).compare)(va, vb) } else { (ka as u8).cmp(&(kb as u8)) };
        if ord != Ordering::Equal {
            return ord;
        }
        a = ra;
        b = rb;
    }
}

fn decode_compound(mut bytes: &[u8]) -> Result<Key> {
    let mut parts = Vec::new();
    while !bytes.is_empty() {
        let (kind, value, rest) =
            next_component(bytes).ok_or_else(|| Error::corrupted("truncated compound key"))?;
        parts.push((ops(kind).decode)(value)?);
        bytes = rest;
    }
    Ok(Key::Compound(parts))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn cmp(a: &Key, b: &Key) -> Ordering {
        (a.kind().ops().compare)(&a.encode().unwrap(), &b.encode().unwrap())
    }

    #[test]
    fn test_table_is_indexed_by_tag() {
        for (tag, kind) in KeyKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, tag);
            assert_eq!(KeyKind::from_tag(tag as u8).unwrap(), *kind);
        }
        assert!(KeyKind::from_tag(17).is_err());
    }

    #[test]
    fn test_signed_order_is_numeric() {
        assert_eq!(cmp(&Key::I64(-5), &Key::I64(3)), Ordering::Less);
        assert_eq!(cmp(&Key::I8(-1), &Key::I8(1)), Ordering::Less);
        assert_eq!(cmp(&Key::F64(-0.5), &Key::F64(0.25)), Ordering::Less);
    }

    #[test]
    fn test_string_order_and_decode() {
        assert_eq!(cmp(&Key::from("abc"), &Key::from("abd")), Ordering::Less);
        assert_eq!(cmp(&Key::from("ab"), &Key::from("abc")), Ordering::Less);
        let bytes = Key::from("héllo").encode().unwrap();
        assert_eq!(Key::decode(KeyKind::Str, &bytes).unwrap(), Key::from("héllo"));
    }

    #[test]
    fn test_compound_prefix_compares_equal() {
        let full = Key::Compound(vec![Key::I32(1), Key::from("b"), Key::I64(9)]);
        let prefix = Key::Compound(vec![Key::I32(1), Key::from("b")]);
        let other = Key::Compound(vec![Key::I32(1), Key::from("c")]);
        assert_eq!(cmp(&prefix, &full), Ordering::Equal);
        assert_eq!(cmp(&full, &other), Ordering::Less);

        let bytes = full.encode().unwrap();
        assert_eq!(Key::decode(KeyKind::Compound, &bytes).unwrap(), full);
    }

    #[test]
    fn test_nested_compound_rejected() {
        let nested = Key::Compound(vec![Key::Compound(vec![])]);
        assert!(matches!(nested.encode(), Err(Error::AccessViolation { .. })));
    }

    mod proptests {
        use super::*;

        proptest! {
            #[test]
            fn prop_i64_byte_compare_matches_numeric(a: i64, b: i64) {
                prop_assert_eq!(cmp(&Key::I64(a), &Key::I64(b)), a.cmp(&b));
            }

            #[test]
            fn prop_u32_decode_inverts_encode(v: u32) {
                let bytes = Key::U32(v).encode().unwrap();
                prop_assert_eq!(Key::decode(KeyKind::U32, &bytes).unwrap(), Key::U32(v));
            }
        }
    }
}
