//! On-disk layout: constants, the header page with its two root descriptors,
//! and the object record header.
//!
//! # Header page (page 0)
//!
//! | Offset | Size | Field                                  |
//! |--------|------|----------------------------------------|
//! | 0      | 8    | magic `NACRE\0\0\1`                    |
//! | 8      | 1    | `curr`: index of the authoritative root |
//! | 9      | 1    | `dirty`: database was not closed cleanly |
//! | 10     | 1    | `initialized`                          |
//! | 16     | 72   | root descriptor 0 + XXH3-64 checksum   |
//! | 88     | 72   | root descriptor 1 + XXH3-64 checksum   |
//!
//! Writes always go to `root[1 - curr]`; commit is the flip of `curr`.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Oid, Result};

/// Page size power: 12 (4 KB pages).
pub const PAGE_SIZE_LOG: u32 = 12;
/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_LOG;

/// Allocation quantum power: 5 (32-byte quanta).
pub const QUANTUM_LOG: u32 = 5;
/// Smallest allocation unit in bytes.
pub const QUANTUM: u64 = 1 << QUANTUM_LOG;

/// Bits in one bitmap page.
pub const BITMAP_PAGE_BITS: u64 = (PAGE_SIZE * 8) as u64;
/// File bytes described by one bitmap page (1 MB).
pub const BITMAP_SEGMENT_SIZE: u64 = BITMAP_PAGE_BITS << QUANTUM_LOG;
/// Bitmap pages addressable without an extent (4 GB of file).
pub const BITMAP_PAGES: u32 = 4096;
/// Bitmap pages addressable with an extent (1 TB of file).
pub const LARGE_BITMAP_PAGES: u32 = 1 << 20;

/// Reserved invalid object id.
pub const INVALID_OID: Oid = 0;
/// Oid of the first bitmap page.
pub const BITMAP_ID: Oid = 1;
/// First oid handed out to user objects.
pub const FIRST_USER_OID: Oid = BITMAP_ID + BITMAP_PAGES;

/// Index entry flag: the entry addresses a whole page object.
pub const PAGE_OBJECT_FLAG: u64 = 1;
/// Index entry flag: the position was allocated in the open transaction.
pub const MODIFIED_FLAG: u64 = 2;
/// Index entry flag: the handle is on the free list.
pub const FREE_HANDLE_FLAG: u64 = 4;
/// All flag bits.
pub const FLAGS_MASK: u64 = 7;
/// Number of flag bits below the free-list link of a free handle.
pub const FLAGS_BITS: u32 = 3;

/// Index entries per index page.
pub const HANDLES_PER_PAGE_LOG: u32 = PAGE_SIZE_LOG - 3;
/// Index entries per index page.
pub const HANDLES_PER_PAGE: u32 = 1 << HANDLES_PER_PAGE_LOG;

/// Header magic.
pub const MAGIC: &[u8; 8] = b"NACRE\0\0\x01";

/// Rounds `size` up to the allocation quantum.
pub fn align_to_quantum(size: u64) -> u64 {
    (size + QUANTUM - 1) & !(QUANTUM - 1)
}

/// Rounds `size` up to a whole number of pages.
pub fn align_to_page(size: u64) -> u64 {
    (size + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// One of the two alternating root descriptors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RootPage {
    /// Logical database size in bytes.
    pub size: u64,
    /// Offset of this generation's object index.
    pub index: u64,
    /// Offset of the other generation's object index.
    pub shadow_index: u64,
    /// Bytes in use at the time of the commit.
    pub used_size: u64,
    /// Capacity of `index` in entries.
    pub index_size: u32,
    /// Capacity of `shadow_index` in entries.
    pub shadow_index_size: u32,
    /// Number of index entries in use.
    pub index_used: u32,
    /// Head of the free handle list.
    pub free_list: u32,
    /// One past the last bitmap page in use.
    pub bitmap_end: u32,
    /// Oid of the root object (0 = none).
    pub root_object: Oid,
    /// Head of the persisted type descriptor chain.
    pub type_list: Oid,
    /// Oid base of the bitmap extent (0 = no extent).
    pub bitmap_extent: Oid,
}

impl RootPage {
    /// Serialized size without the checksum.
    pub const SIZE: usize = 64;
    /// Serialized size including the trailing checksum.
    pub const SIZE_WITH_CHECKSUM: usize = Self::SIZE + 8;

    /// Serializes the descriptor followed by its checksum.
    pub fn write_to(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[0..8], self.size);
        LittleEndian::write_u64(&mut buf[8..16], self.index);
        LittleEndian::write_u64(&mut buf[16..24], self.shadow_index);
        LittleEndian::write_u64(&mut buf[24..32], self.used_size);
        LittleEndian::write_u32(&mut buf[32..36], self.index_size);
        LittleEndian::write_u32(&mut buf[36..40], self.shadow_index_size);
        LittleEndian::write_u32(&mut buf[40..44], self.index_used);
        LittleEndian::write_u32(&mut buf[44..48], self.free_list);
        LittleEndian::write_u32(&mut buf[48..52], self.bitmap_end);
        LittleEndian::write_u32(&mut buf[52..56], self.root_object);
        LittleEndian::write_u32(&mut buf[56..60], self.type_list);
        LittleEndian::write_u32(&mut buf[60..64], self.bitmap_extent);
        let checksum = xxhash_rust::xxh3::xxh3_64(&buf[0..Self::SIZE]);
        LittleEndian::write_u64(&mut buf[Self::SIZE..Self::SIZE_WITH_CHECKSUM], checksum);
    }

    /// Deserializes a descriptor, verifying its checksum.
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE_WITH_CHECKSUM {
            return Err(Error::corrupted("root descriptor truncated"));
        }
        let expected = xxhash_rust::xxh3::xxh3_64(&buf[0..Self::SIZE]);
        let stored = LittleEndian::read_u64(&buf[Self::SIZE..Self::SIZE_WITH_CHECKSUM]);
        if expected != stored {
            return Err(Error::corrupted("root descriptor checksum mismatch"));
        }
        Ok(Self {
            size: LittleEndian::read_u64(&buf[0..8]),
            index: LittleEndian::read_u64(&buf[8..16]),
            shadow_index: LittleEndian::read_u64(&buf[16..24]),
            used_size: LittleEndian::read_u64(&buf[24..32]),
            index_size: LittleEndian::read_u32(&buf[32..36]),
            shadow_index_size: LittleEndian::read_u32(&buf[36..40]),
            index_used: LittleEndian::read_u32(&buf[40..44]),
            free_list: LittleEndian::read_u32(&buf[44..48]),
            bitmap_end: LittleEndian::read_u32(&buf[48..52]),
            root_object: LittleEndian::read_u32(&buf[52..56]),
            type_list: LittleEndian::read_u32(&buf[56..60]),
            bitmap_extent: LittleEndian::read_u32(&buf[60..64]),
        })
    }

    /// Copies everything but the index placement from `other`.
    pub fn copy_state_from(&mut self, other: &RootPage) {
        self.size = other.size;
        self.used_size = other.used_size;
        self.index_used = other.index_used;
        self.free_list = other.free_list;
        self.bitmap_end = other.bitmap_end;
        self.root_object = other.root_object;
        self.type_list = other.type_list;
        self.bitmap_extent = other.bitmap_extent;
    }

    /// Returns `other` with its index and shadow index swapped.
    pub fn mirrored(other: &RootPage) -> RootPage {
        let mut root = *other;
        root.index = other.shadow_index;
        root.index_size = other.shadow_index_size;
        root.shadow_index = other.index;
        root.shadow_index_size = other.index_size;
        root
    }
}

/// The header page: two root descriptors plus the commit selector.
///
/// Helpers that touch a descriptor take the generation explicitly; the
/// committed generation is `curr`, the one being prepared is `1 - curr`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// Index of the authoritative root descriptor (0 or 1).
    pub curr: usize,
    /// Set while a transaction may have touched the file.
    pub dirty: bool,
    /// Set once the initial layout is durable.
    pub initialized: bool,
    /// The two root descriptors.
    pub root: [RootPage; 2],
}

impl Header {
    const ROOT_OFFSET: usize = 16;

    /// Bytes occupied by the header at the start of page 0.
    pub const SIZE: usize = Self::ROOT_OFFSET + 2 * RootPage::SIZE_WITH_CHECKSUM;

    /// Generation holding the last committed state.
    pub fn committed(&self) -> usize {
        self.curr
    }

    /// Generation receiving the open transaction's changes.
    pub fn working(&self) -> usize {
        1 - self.curr
    }

    /// Serializes the header into the start of `buf`.
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(MAGIC);
        buf[8] = self.curr as u8;
        buf[9] = u8::from(self.dirty);
        buf[10] = u8::from(self.initialized);
        buf[11..Self::ROOT_OFFSET].fill(0);
        for (generation, root) in self.root.iter().enumerate() {
            let offset = Self::ROOT_OFFSET + generation * RootPage::SIZE_WITH_CHECKSUM;
            root.write_to(&mut buf[offset..offset + RootPage::SIZE_WITH_CHECKSUM]);
        }
    }

    /// Parses the header of an existing file.
    ///
    /// An all-zero buffer yields an uninitialized header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseCorrupted`] on a bad magic, selector or checksum.
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(Error::corrupted("header truncated"));
        }
        if buf[10] == 0 {
            return Ok(Self::default());
        }
        if &buf[0..8] != MAGIC {
            return Err(Error::corrupted("bad magic"));
        }
        let curr = buf[8] as usize;
        if curr > 1 {
            return Err(Error::corrupted(format!("bad root selector {curr}")));
        }
        let mut root = [RootPage::default(); 2];
        for (generation, slot) in root.iter_mut().enumerate() {
            let offset = Self::ROOT_OFFSET + generation * RootPage::SIZE_WITH_CHECKSUM;
            *slot = RootPage::read_from(&buf[offset..offset + RootPage::SIZE_WITH_CHECKSUM])?;
        }
        Ok(Self { curr, dirty: buf[9] != 0, initialized: true, root })
    }
}

/// Header prefixed to every object record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Total record size in bytes, header included.
    pub size: u32,
    /// Oid of the type descriptor (0 for descriptors themselves).
    pub type_oid: Oid,
}

impl ObjectHeader {
    /// Serialized size.
    pub const SIZE: usize = 8;

    /// Reads the header at the start of `buf`.
    pub fn read(buf: &[u8]) -> Self {
        Self { size: LittleEndian::read_u32(&buf[0..4]), type_oid: LittleEndian::read_u32(&buf[4..8]) }
    }

    /// Writes the header at the start of `buf`.
    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u32(&mut buf[0..4], self.size);
        LittleEndian::write_u32(&mut buf[4..8], self.type_oid);
    }
}
