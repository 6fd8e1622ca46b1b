//! Persistent type descriptions and the record codec.
//!
//! Every stored object is a record whose payload is laid out field by field
//! according to its [`TypeDescriptor`]. The same layout grammar drives three
//! consumers: [`RecordWriter`] when storing, [`RecordReader`] when loading, and
//! [`TypeDescriptor::scan_references`] when the garbage collector walks raw
//! bytes without knowing the Rust type.
//!
//! # Field layout
//!
//! All values are little-endian, in declaration order:
//!
//! | Field type                    | Bytes                              |
//! |-------------------------------|------------------------------------|
//! | `Bool`, `I8`, `U8`            | 1                                  |
//! | `I16`, `U16`, `Char`          | 2                                  |
//! | `I32`, `U32`, `F32`           | 4                                  |
//! | `I64`, `U64`, `F64`, `Date`   | 8                                  |
//! | `Reference`                   | 4 (oid, 0 = none)                  |
//! | `String`, `Bytes`             | `i32` byte length (-1 = none) + data |
//! | `ReferenceArray`              | `i32` count + 4 bytes per oid      |
//! | `Array(elem)`                 | `i32` count + fixed-size elements  |
//!
//! Descriptors are records themselves (type oid 0), chained from the root
//! descriptor's `type_list`. The registry of loaded descriptors belongs to the
//! storage instance.

use std::{any::Any, collections::HashMap, marker::PhantomData, sync::Arc};

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    config::StringEncoding,
    error::{Error, Oid, Result},
    handle::Handle,
    storage::Core,
};

/// Semantic type of a persistent field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// `bool`.
    Bool,
    /// `i8`.
    I8,
    /// `u8`.
    U8,
    /// `i16`.
    I16,
    /// `u16`.
    U16,
    /// A UTF-16 code unit.
    Char,
    /// `i32`.
    I32,
    /// `u32`.
    U32,
    /// `f32`.
    F32,
    /// `i64`.
    I64,
    /// `u64`.
    U64,
    /// `f64`.
    F64,
    /// Milliseconds since the Unix epoch.
    Date,
    /// Oid of another persistent object.
    Reference,
    /// Optional string.
    String,
    /// Optional byte string.
    Bytes,
    /// List of oids.
    ReferenceArray,
    /// List of fixed-size scalars.
    Array(Box<FieldType>),
}

impl FieldType {
    fn tag(&self) -> u8 {
        match self {
            Self::Bool => 0,
            Self::I8 => 1,
            Self::U8 => 2,
            Self::I16 => 3,
            Self::U16 => 4,
            Self::Char => 5,
            Self::I32 => 6,
            Self::U32 => 7,
            Self::F32 => 8,
            Self::I64 => 9,
            Self::U64 => 10,
            Self::F64 => 11,
            Self::Date => 12,
            Self::Reference => 13,
            Self::String => 14,
            Self::Bytes => 15,
            Self::ReferenceArray => 16,
            Self::Array(_) => 17,
        }
    }

    fn from_tags(bytes: &mut Cursor<'_>) -> Result<Self> {
        Ok(match bytes.u8()? {
            0 => Self::Bool,
            1 => Self::I8,
            2 => Self::U8,
            3 => Self::I16,
            4 => Self::U16,
            5 => Self::Char,
            6 => Self::I32,
            7 => Self::U32,
            8 => Self::F32,
            9 => Self::I64,
            10 => Self::U64,
            11 => Self::F64,
            12 => Self::Date,
            13 => Self::Reference,
            14 => Self::String,
            15 => Self::Bytes,
            16 => Self::ReferenceArray,
            17 => {
                let elem = Self::from_tags(bytes)?;
                if elem.fixed_size().is_none() {
                    return Err(Error::corrupted("array element must be a fixed-size scalar"));
                }
                Self::Array(Box::new(elem))
            },
            tag => return Err(Error::corrupted(format!("unknown field type tag {tag}"))),
        })
    }

    fn write_tags(&self, out: &mut Vec<u8>) {
        out.push(self.tag());
        if let Self::Array(elem) = self {
            elem.write_tags(out);
        }
    }

    /// Encoded size of scalar types; `None` for variable-size ones.
    pub fn fixed_size(&self) -> Option<usize> {
        match self {
            Self::Bool | Self::I8 | Self::U8 => Some(1),
            Self::I16 | Self::U16 | Self::Char => Some(2),
            Self::I32 | Self::U32 | Self::F32 | Self::Reference => Some(4),
            Self::I64 | Self::U64 | Self::F64 | Self::Date => Some(8),
            Self::String | Self::Bytes | Self::ReferenceArray | Self::Array(_) => None,
        }
    }
}

/// One named field of a persistent type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescriptor {
    /// Field name.
    pub name: String,
    /// Field type.
    pub field_type: FieldType,
}

impl FieldDescriptor {
    /// Creates a field description.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self { name: name.into(), field_type }
    }
}

/// How the garbage collector treats records of a type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TypeKind {
    /// References are found by scanning the field layout.
    #[default]
    Plain,
    /// The record is a B-tree header; references live in the tree pages.
    BTree,
}

/// Persisted description of a persistent type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    /// Type name, unique per layout.
    pub name: String,
    /// Collector treatment.
    pub kind: TypeKind,
    /// Fields in declaration order.
    pub fields: Vec<FieldDescriptor>,
    /// Next descriptor in the persisted chain.
    pub(crate) next: Oid,
}

impl TypeDescriptor {
    /// Whether any field can hold an object reference.
    pub fn has_references(&self) -> bool {
        self.kind == TypeKind::BTree
            || self
                .fields
                .iter()
                .any(|f| matches!(f.field_type, FieldType::Reference | FieldType::ReferenceArray))
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(&self.next.to_le_bytes());
        out.push(match self.kind {
            TypeKind::Plain => 0,
            TypeKind::BTree => 1,
        });
        put_name(&mut out, &self.name);
        out.extend_from_slice(&(self.fields.len() as u32).to_le_bytes());
        for field in &self.fields {
            put_name(&mut out, &field.name);
            field.field_type.write_tags(&mut out);
        }
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor::new(bytes);
        let next = cur.u32()?;
        let kind = match cur.u8()? {
            0 => TypeKind::Plain,
            1 => TypeKind::BTree,
            other => return Err(Error::corrupted(format!("unknown type kind {other}"))),
        };
        let name = cur.name()?;
        let count = cur.u32()? as usize;
        let mut fields = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            let name = cur.name()?;
            fields.push(FieldDescriptor { name, field_type: FieldType::from_tags(&mut cur)? });
        }
        Ok(Self { name, kind, fields, next })
    }

    /// Calls `visitor` with every non-zero oid stored in `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseCorrupted`] if the payload is shorter than
    /// its layout requires.
    pub fn scan_references(&self, payload: &[u8], visitor: &mut dyn FnMut(Oid)) -> Result<()> {
        scan_fields(&self.fields, payload, visitor)
    }
}

fn put_name(out: &mut Vec<u8>, name: &str) {
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
}

/// Walks `payload` with `fields`, reporting every reference.
pub(crate) fn scan_fields(fields: &[FieldDescriptor], payload: &[u8], visitor: &mut dyn FnMut(Oid)) -> Result<()> {
    let mut cur = Cursor::new(payload);
    for field in fields {
        match &field.field_type {
            FieldType::Reference => {
                let oid = cur.u32()?;
                if oid != 0 {
                    visitor(oid);
                }
            },
            FieldType::String | FieldType::Bytes => {
                let len = cur.i32()?;
                if len > 0 {
                    cur.skip(len as usize)?;
                }
            },
            FieldType::ReferenceArray => {
                let count = cur.i32()?;
                for _ in 0..count.max(0) {
                    let oid = cur.u32()?;
                    if oid != 0 {
                        visitor(oid);
                    }
                }
            },
            FieldType::Array(elem) => {
                let count = cur.i32()?;
                let size = elem.fixed_size().unwrap_or(0);
                if count > 0 {
                    cur.skip(count as usize * size)?;
                }
            },
            scalar => cur.skip(scalar.fixed_size().unwrap_or(0))?,
        }
    }
    Ok(())
}

/// Bounds-checked little-endian reader over descriptor and payload bytes.
struct Cursor<'a> {
    bytes: &'a [u8],
    offs: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offs: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.offs.checked_add(n).filter(|&end| end <= self.bytes.len()).ok_or_else(|| {
            Error::corrupted(format!("record truncated: need {n} bytes at offset {}", self.offs))
        })?;
        let slice = &self.bytes[self.offs..end];
        self.offs = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    fn name(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|_| Error::corrupted("type name is not UTF-8"))
    }
}

mod sealed {
    pub trait Sealed {}
}

/// Fixed-size scalar that can be stored as a field or array element.
pub trait Scalar: sealed::Sealed + Copy {
    /// Field type of a single value.
    fn field_type() -> FieldType;
    /// Appends the little-endian encoding.
    fn put(self, out: &mut Vec<u8>);
    /// Decodes from exactly [`FieldType::fixed_size`] bytes.
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! scalar {
    ($ty:ty, $field:ident) => {
        impl sealed::Sealed for $ty {}

        impl Scalar for $ty {
            fn field_type() -> FieldType {
                FieldType::$field
            }

            fn put(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn get(bytes: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

scalar!(i8, I8);
scalar!(u8, U8);
scalar!(i16, I16);
scalar!(u16, U16);
scalar!(i32, I32);
scalar!(u32, U32);
scalar!(f32, F32);
scalar!(i64, I64);
scalar!(u64, U64);
scalar!(f64, F64);

impl sealed::Sealed for bool {}

impl Scalar for bool {
    fn field_type() -> FieldType {
        FieldType::Bool
    }

    fn put(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn get(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

/// Encodes one record, checking each write against the declared fields.
///
/// A mismatch is remembered and reported when the record is finished, so
/// [`Persistent::encode`] implementations stay infallible.
pub struct RecordWriter<'a> {
    buf: Vec<u8>,
    fields: &'a [FieldDescriptor],
    next: usize,
    encoding: StringEncoding,
    error: Option<Error>,
}

impl<'a> RecordWriter<'a> {
    pub(crate) fn new(fields: &'a [FieldDescriptor], encoding: StringEncoding) -> Self {
        Self { buf: Vec::with_capacity(64), fields, next: 0, encoding, error: None }
    }

    fn expect(&mut self, field_type: &FieldType) -> bool {
        if self.error.is_some() {
            return false;
        }
        match self.fields.get(self.next) {
            Some(field) if field.field_type == *field_type => {
                self.next += 1;
                true
            },
            Some(field) => {
                self.error = Some(Error::access(format!(
                    "field {} is {:?}, wrote {field_type:?}",
                    field.name, field.field_type
                )));
                false
            },
            None => {
                self.error = Some(Error::access(format!("wrote {field_type:?} past the last field")));
                false
            },
        }
    }

    fn scalar<S: Scalar>(&mut self, field_type: FieldType, value: S) {
        if self.expect(&field_type) {
            value.put(&mut self.buf);
        }
    }

    /// Writes a `Bool` field.
    pub fn write_bool(&mut self, value: bool) {
        self.scalar(FieldType::Bool, value);
    }

    /// Writes an `I8` field.
    pub fn write_i8(&mut self, value: i8) {
        self.scalar(FieldType::I8, value);
    }

    /// Writes a `U8` field.
    pub fn write_u8(&mut self, value: u8) {
        self.scalar(FieldType::U8, value);
    }

    /// Writes an `I16` field.
    pub fn write_i16(&mut self, value: i16) {
        self.scalar(FieldType::I16, value);
    }

    /// Writes a `U16` field.
    pub fn write_u16(&mut self, value: u16) {
        self.scalar(FieldType::U16, value);
    }

    /// Writes a `Char` field.
    pub fn write_char(&mut self, value: u16) {
        self.scalar(FieldType::Char, value);
    }

    /// Writes an `I32` field.
    pub fn write_i32(&mut self, value: i32) {
        self.scalar(FieldType::I32, value);
    }

    /// Writes a `U32` field.
    pub fn write_u32(&mut self, value: u32) {
        self.scalar(FieldType::U32, value);
    }

    /// Writes an `F32` field.
    pub fn write_f32(&mut self, value: f32) {
        self.scalar(FieldType::F32, value);
    }

    /// Writes an `I64` field.
    pub fn write_i64(&mut self, value: i64) {
        self.scalar(FieldType::I64, value);
    }

    /// Writes a `U64` field.
    pub fn write_u64(&mut self, value: u64) {
        self.scalar(FieldType::U64, value);
    }

    /// Writes an `F64` field.
    pub fn write_f64(&mut self, value: f64) {
        self.scalar(FieldType::F64, value);
    }

    /// Writes a `Date` field as milliseconds since the epoch.
    pub fn write_date(&mut self, millis: i64) {
        self.scalar(FieldType::Date, millis);
    }

    /// Writes a `Reference` field from a raw oid (0 = none).
    pub fn write_oid(&mut self, oid: Oid) {
        self.scalar(FieldType::Reference, oid);
    }

    /// Writes a `Reference` field from an optional handle.
    pub fn write_ref<T>(&mut self, handle: Option<&Handle<T>>) {
        self.write_oid(handle.map_or(0, Handle::oid));
    }

    /// Writes a `String` field.
    pub fn write_string(&mut self, value: Option<&str>) {
        if !self.expect(&FieldType::String) {
            return;
        }
        match value {
            None => self.buf.extend_from_slice(&(-1i32).to_le_bytes()),
            Some(s) => {
                let bytes: Vec<u8> = match self.encoding {
                    StringEncoding::Utf8 => s.as_bytes().to_vec(),
                    StringEncoding::Utf16 => s.encode_utf16().flat_map(u16::to_le_bytes).collect(),
                };
                self.buf.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
                self.buf.extend_from_slice(&bytes);
            },
        }
    }

    /// Writes a `Bytes` field.
    pub fn write_bytes(&mut self, value: Option<&[u8]>) {
        if !self.expect(&FieldType::Bytes) {
            return;
        }
        match value {
            None => self.buf.extend_from_slice(&(-1i32).to_le_bytes()),
            Some(bytes) => {
                self.buf.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
                self.buf.extend_from_slice(bytes);
            },
        }
    }

    /// Writes a `ReferenceArray` field.
    pub fn write_refs(&mut self, oids: &[Oid]) {
        if self.expect(&FieldType::ReferenceArray) {
            self.buf.extend_from_slice(&(oids.len() as i32).to_le_bytes());
            for oid in oids {
                self.buf.extend_from_slice(&oid.to_le_bytes());
            }
        }
    }

    /// Writes an `Array` field of scalars.
    pub fn write_array<S: Scalar>(&mut self, values: &[S]) {
        if self.expect(&FieldType::Array(Box::new(S::field_type()))) {
            self.buf.extend_from_slice(&(values.len() as i32).to_le_bytes());
            for value in values {
                value.put(&mut self.buf);
            }
        }
    }

    pub(crate) fn finish(self) -> Result<Vec<u8>> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if let Some(field) = self.fields.get(self.next) {
            return Err(Error::access(format!("field {} was not written", field.name)));
        }
        Ok(self.buf)
    }
}

/// Decodes one record, checking each read against the declared fields.
pub struct RecordReader<'a> {
    bytes: &'a [u8],
    offs: usize,
    fields: &'a [FieldDescriptor],
    next: usize,
    encoding: StringEncoding,
}

impl<'a> RecordReader<'a> {
    pub(crate) fn new(bytes: &'a [u8], fields: &'a [FieldDescriptor], encoding: StringEncoding) -> Self {
        Self { bytes, offs: 0, fields, next: 0, encoding }
    }

    fn expect(&mut self, field_type: &FieldType) -> Result<()> {
        match self.fields.get(self.next) {
            Some(field) if field.field_type == *field_type => {
                self.next += 1;
                Ok(())
            },
            Some(field) => Err(Error::access(format!(
                "field {} is {:?}, read {field_type:?}",
                field.name, field.field_type
            ))),
            None => Err(Error::access(format!("read {field_type:?} past the last field"))),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .offs
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| Error::access(format!("record truncated at offset {}", self.offs)))?;
        let slice = &self.bytes[self.offs..end];
        self.offs = end;
        Ok(slice)
    }

    fn scalar<S: Scalar>(&mut self, field_type: FieldType) -> Result<S> {
        self.expect(&field_type)?;
        let size = field_type.fixed_size().unwrap_or(0);
        Ok(S::get(self.take(size)?))
    }

    fn length(&mut self) -> Result<Option<usize>> {
        let len = LittleEndian::read_i32(self.take(4)?);
        Ok(usize::try_from(len).ok())
    }

    /// Reads a `Bool` field.
    pub fn read_bool(&mut self) -> Result<bool> {
        self.scalar(FieldType::Bool)
    }

    /// Reads an `I8` field.
    pub fn read_i8(&mut self) -> Result<i8> {
        self.scalar(FieldType::I8)
    }

    /// Reads a `U8` field.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.scalar(FieldType::U8)
    }

    /// Reads an `I16` field.
    pub fn read_i16(&mut self) -> Result<i16> {
        self.scalar(FieldType::I16)
    }

    /// Reads a `U16` field.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.scalar(FieldType::U16)
    }

    /// Reads a `Char` field.
    pub fn read_char(&mut self) -> Result<u16> {
        self.scalar(FieldType::Char)
    }

    /// Reads an `I32` field.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.scalar(FieldType::I32)
    }

    /// Reads a `U32` field.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.scalar(FieldType::U32)
    }

    /// Reads an `F32` field.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.scalar(FieldType::F32)
    }

    /// Reads an `I64` field.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.scalar(FieldType::I64)
    }

    /// Reads a `U64` field.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.scalar(FieldType::U64)
    }

    /// Reads an `F64` field.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.scalar(FieldType::F64)
    }

    /// Reads a `Date` field.
    pub fn read_date(&mut self) -> Result<i64> {
        self.scalar(FieldType::Date)
    }

    /// Reads a `Reference` field as a raw oid.
    pub fn read_oid(&mut self) -> Result<Oid> {
        self.scalar(FieldType::Reference)
    }

    /// Reads a `Reference` field as an unloaded handle.
    pub fn read_ref<T>(&mut self) -> Result<Option<Handle<T>>> {
        let oid = self.read_oid()?;
        Ok((oid != 0).then(|| Handle::from_oid(oid)))
    }

    /// Reads a `String` field.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        self.expect(&FieldType::String)?;
        let Some(len) = self.length()? else { return Ok(None) };
        let bytes = self.take(len)?;
        let text = match self.encoding {
            StringEncoding::Utf8 => String::from_utf8(bytes.to_vec()).ok(),
            StringEncoding::Utf16 => {
                let units: Vec<u16> = bytes.chunks_exact(2).map(LittleEndian::read_u16).collect();
                String::from_utf16(&units).ok()
            },
        };
        text.map(Some).ok_or_else(|| Error::access("string field is not valid text"))
    }

    /// Reads a `Bytes` field.
    pub fn read_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        self.expect(&FieldType::Bytes)?;
        let Some(len) = self.length()? else { return Ok(None) };
        Ok(Some(self.take(len)?.to_vec()))
    }

    /// Reads a `ReferenceArray` field.
    pub fn read_refs(&mut self) -> Result<Vec<Oid>> {
        self.expect(&FieldType::ReferenceArray)?;
        let count = self.length()?.unwrap_or(0);
        let raw = self.take(count * 4)?;
        Ok(raw.chunks_exact(4).map(LittleEndian::read_u32).collect())
    }

    /// Reads an `Array` field of scalars.
    pub fn read_array<S: Scalar>(&mut self) -> Result<Vec<S>> {
        let elem = S::field_type();
        let size = elem.fixed_size().unwrap_or(0);
        self.expect(&FieldType::Array(Box::new(elem)))?;
        let count = self.length()?.unwrap_or(0);
        let raw = self.take(count * size)?;
        Ok(raw.chunks_exact(size).map(S::get).collect())
    }
}

/// A type whose values can be stored as records.
///
/// `encode` must write exactly the fields returned by `fields`, in order,
/// and `decode` must read them back the same way.
///
/// ```
/// use nacre_store::{FieldDescriptor, FieldType, Persistent, RecordReader, RecordWriter, Result};
///
/// struct Point {
///     x: i32,
///     y: i32,
/// }
///
/// impl Persistent for Point {
///     const TYPE_NAME: &'static str = "demo.Point";
///
///     fn fields() -> Vec<FieldDescriptor> {
///         vec![FieldDescriptor::new("x", FieldType::I32), FieldDescriptor::new("y", FieldType::I32)]
///     }
///
///     fn encode(&self, w: &mut RecordWriter<'_>) {
///         w.write_i32(self.x);
///         w.write_i32(self.y);
///     }
///
///     fn decode(r: &mut RecordReader<'_>) -> Result<Self> {
///         Ok(Self { x: r.read_i32()?, y: r.read_i32()? })
///     }
/// }
/// ```
pub trait Persistent: Send + Sync + Sized + 'static {
    /// Name under which the type is registered.
    const TYPE_NAME: &'static str;

    /// Collector treatment of the type's records.
    const KIND: TypeKind = TypeKind::Plain;

    /// Field layout, in encoding order.
    fn fields() -> Vec<FieldDescriptor>;

    /// Writes every field.
    fn encode(&self, writer: &mut RecordWriter<'_>);

    /// Reads every field.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessViolation`] if the record does not match the layout.
    fn decode(reader: &mut RecordReader<'_>) -> Result<Self>;
}

/// Type-erased encoder/decoder for one persistent type.
pub trait Codec: Send + Sync {
    /// Registered type name.
    fn type_name(&self) -> &'static str;

    /// Field layout.
    fn fields(&self) -> Vec<FieldDescriptor>;

    /// Collector treatment of the type.
    fn kind(&self) -> TypeKind;

    /// Encodes `value`, which must be of the codec's type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessViolation`] on a type or layout mismatch.
    fn encode(&self, value: &(dyn Any + Send + Sync), encoding: StringEncoding) -> Result<Vec<u8>>;

    /// Decodes a payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessViolation`] if the payload does not match the layout.
    fn decode(&self, payload: &[u8], encoding: StringEncoding) -> Result<Box<dyn Any + Send + Sync>>;

    /// Reports every oid stored in `payload`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseCorrupted`] if the payload is truncated.
    fn scan_references(&self, payload: &[u8], visitor: &mut dyn FnMut(Oid)) -> Result<()> {
        scan_fields(&self.fields(), payload, visitor)
    }
}

/// [`Codec`] backed by a [`Persistent`] implementation.
pub struct TypedCodec<T>(PhantomData<fn() -> T>);

impl<T> TypedCodec<T> {
    /// Creates the codec.
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for TypedCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Persistent> TypedCodec<T> {
    pub(crate) fn encode_value(value: &T, encoding: StringEncoding) -> Result<Vec<u8>> {
        let fields = T::fields();
        let mut writer = RecordWriter::new(&fields, encoding);
        value.encode(&mut writer);
        writer.finish()
    }

    pub(crate) fn decode_value(payload: &[u8], encoding: StringEncoding) -> Result<T> {
        let fields = T::fields();
        let mut reader = RecordReader::new(payload, &fields, encoding);
        T::decode(&mut reader)
    }
}

impl<T: Persistent> Codec for TypedCodec<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn fields(&self) -> Vec<FieldDescriptor> {
        T::fields()
    }

    fn kind(&self) -> TypeKind {
        T::KIND
    }

    fn encode(&self, value: &(dyn Any + Send + Sync), encoding: StringEncoding) -> Result<Vec<u8>> {
        let value = value
            .downcast_ref::<T>()
            .ok_or_else(|| Error::access(format!("value is not a {}", T::TYPE_NAME)))?;
        Self::encode_value(value, encoding)
    }

    fn decode(&self, payload: &[u8], encoding: StringEncoding) -> Result<Box<dyn Any + Send + Sync>> {
        Ok(Box::new(Self::decode_value(payload, encoding)?))
    }
}

/// Descriptors loaded from the database, keyed by their record oid.
#[derive(Debug, Default)]
pub(crate) struct SchemaRegistry {
    descriptors: HashMap<Oid, Arc<TypeDescriptor>>,
    by_name: HashMap<String, Vec<Oid>>,
}

impl SchemaRegistry {
    pub(crate) fn get(&self, oid: Oid) -> Option<&Arc<TypeDescriptor>> {
        self.descriptors.get(&oid)
    }

    fn find(&self, name: &str, kind: TypeKind, fields: &[FieldDescriptor]) -> Option<Oid> {
        self.by_name.get(name)?.iter().copied().find(|oid| {
            self.descriptors.get(oid).is_some_and(|d| d.kind == kind && d.fields == fields)
        })
    }

    fn insert(&mut self, oid: Oid, descriptor: TypeDescriptor) {
        self.by_name.entry(descriptor.name.clone()).or_default().push(oid);
        self.descriptors.insert(oid, Arc::new(descriptor));
    }

    /// Number of known descriptors.
    pub(crate) fn len(&self) -> usize {
        self.descriptors.len()
    }
}

impl Core {
    /// Rebuilds the registry from the descriptor chain of the working root.
    pub(crate) fn load_schema(&mut self) -> Result<()> {
        let mut registry = SchemaRegistry::default();
        let mut oid = self.header.root[self.header.working()].type_list;
        while oid != 0 {
            if registry.descriptors.contains_key(&oid) {
                return Err(Error::corrupted(format!("type descriptor chain loops at {oid}")));
            }
            let (header, payload) = self.load_record(oid)?;
            if header.type_oid != 0 {
                return Err(Error::corrupted(format!("object {oid} in the type chain is not a descriptor")));
            }
            let descriptor = TypeDescriptor::decode(&payload)?;
            let next = descriptor.next;
            registry.insert(oid, descriptor);
            oid = next;
        }
        self.schema = registry;
        Ok(())
    }

    /// Oid of the descriptor matching `name`, `kind` and `fields`, storing a
    /// new one if the layout was never seen.
    pub(crate) fn type_oid(&mut self, name: &str, kind: TypeKind, fields: Vec<FieldDescriptor>) -> Result<Oid> {
        if let Some(oid) = self.schema.find(name, kind, &fields) {
            return Ok(oid);
        }
        let w = self.header.working();
        let descriptor = TypeDescriptor {
            name: name.to_owned(),
            kind,
            fields,
            next: self.header.root[w].type_list,
        };
        let oid = self.create_record(0, &descriptor.encode())?;
        let w = self.header.working();
        self.header.root[w].type_list = oid;
        tracing::debug!(oid, name, "registered type descriptor");
        self.schema.insert(oid, descriptor);
        Ok(oid)
    }

    /// Descriptor oid for `T`.
    pub(crate) fn type_oid_of<T: Persistent>(&mut self) -> Result<Oid> {
        self.type_oid(T::TYPE_NAME, T::KIND, T::fields())
    }

    /// Descriptor stored at `oid`.
    pub(crate) fn descriptor(&self, oid: Oid) -> Result<Arc<TypeDescriptor>> {
        self.schema
            .get(oid)
            .cloned()
            .ok_or_else(|| Error::corrupted(format!("unknown type descriptor {oid}")))
    }
}
