//! Bitmap allocator and object record placement.
//!
//! File space is handed out in 32-byte quanta. One bit per quantum lives in
//! the bitmap pages (oids `1..=4096`, plus the extent range for very large
//! files); a set bit means allocated.
//!
//! Bitmap pages are page objects and follow the same copy-on-write rule as
//! everything else: the first change in a transaction relocates the page and
//! defers the release of its committed copy to commit. Positions owned by the
//! committed snapshot are never cleared directly. Freeing them only clones the
//! covering bitmap pages; the bits are cleared when commit frees every
//! committed position that the transaction replaced.
//!
//! An allocation that relocates a bitmap page can recurse into the allocator.
//! Holes handed out but not yet marked are kept in a reservation list so the
//! nested call cannot pick them again.

use crate::{
    error::{Error, Oid, Result},
    index::entry_pos,
    layout::{
        BITMAP_ID, BITMAP_PAGE_BITS, BITMAP_PAGES, BITMAP_SEGMENT_SIZE, FREE_HANDLE_FLAG,
        LARGE_BITMAP_PAGES, MODIFIED_FLAG, ObjectHeader, PAGE_OBJECT_FLAG, PAGE_SIZE, QUANTUM_LOG,
        align_to_page, align_to_quantum,
    },
    storage::Core,
};

/// Bits per page-aligned chunk: one page of file space.
const CHUNK_BITS: u64 = (PAGE_SIZE as u64) >> QUANTUM_LOG;

/// Bytes of bitmap describing one page of file space.
const CHUNK_BYTES: usize = (CHUNK_BITS / 8) as usize;

/// Address space kept in reserve when deciding to set up the bitmap extent.
const EXTENT_MARGIN: u64 = 64 * 1024 * 1024;

/// Scan cursor slot for unaligned requests.
const UNALIGNED: usize = 0;
/// Scan cursor slot for page-aligned requests.
const ALIGNED: usize = 1;

/// Volatile allocator state; rebuilt from scratch on rollback.
#[derive(Debug, Default)]
pub(crate) struct AllocState {
    /// Next bit to scan from, per alignment class.
    cursors: [u64; 2],
    /// Largest free run in bits known to exist inside each bitmap page, per
    /// alignment class. Aligned scans only count whole free chunks, so their
    /// hints say nothing about unaligned holes. Missing or `u32::MAX` means
    /// unknown.
    available: [Vec<u32>; 2],
    /// Holes handed out by allocations whose bits are not set yet.
    reserved: Vec<(u64, u64)>,
    /// Set while the allocator or commit performs bookkeeping allocations.
    pub(crate) maintenance: bool,
}

impl AllocState {
    /// Forgets cursors, hints and reservations.
    pub(crate) fn reset(&mut self) {
        self.cursors = [0; 2];
        self.available.iter_mut().for_each(Vec::clear);
        self.reserved.clear();
        self.maintenance = false;
    }

    fn hint(&self, slot: usize, page: u32) -> u32 {
        self.available[slot].get(page as usize).copied().unwrap_or(u32::MAX)
    }

    fn set_hint(&mut self, slot: usize, page: u32, bits: u32) {
        let hints = &mut self.available[slot];
        let page = page as usize;
        if page >= hints.len() {
            hints.resize(page + 1, u32::MAX);
        }
        hints[page] = bits;
    }

    /// Drops the hints of `page` for both classes.
    fn forget_hint(&mut self, page: u32) {
        for hints in &mut self.available {
            if let Some(hint) = hints.get_mut(page as usize) {
                *hint = u32::MAX;
            }
        }
    }

    fn is_reserved(&self, pos: u64, size: u64) -> bool {
        self.reserved.iter().any(|&(p, s)| pos < p + s && p < pos + size)
    }

    fn reserved_end(&self, from: u64) -> u64 {
        self.reserved.iter().map(|&(p, s)| p + s).fold(from, u64::max)
    }
}

/// Longest run of clear bits anywhere inside a bitmap byte.
///
/// Together with `trailing_zeros` (free bits continuing a run from the
/// previous byte) and `leading_zeros` (free bits starting one into the next
/// byte) it lets the scanner step over bytes that cannot complete a request.
const MAX_HOLE: [u8; 256] = {
    let mut table = [0u8; 256];
    let mut byte = 0;
    while byte < 256 {
        let (mut best, mut run, mut bit) = (0u8, 0u8, 0);
        while bit < 8 {
            if byte & (1 << bit) == 0 {
                run += 1;
                if run > best {
                    best = run;
                }
            } else {
                run = 0;
            }
            bit += 1;
        }
        table[byte] = best;
        byte += 1;
    }
    table
};

/// A free run being accumulated across bitmap pages.
#[derive(Debug, Default, Clone, Copy)]
struct Run {
    start: u64,
    len: u64,
}

/// Outcome of scanning one bitmap page.
struct PageScan {
    /// First bit of a qualifying hole.
    found: Option<u64>,
    /// Longest run fully inside the scanned part of the page.
    longest: u64,
}

/// Scans units `from_unit..to_unit` of one bitmap page for a run of `need`
/// free bits. A unit is one bit, or a whole 128-bit chunk when `aligned`.
#[allow(clippy::too_many_arguments)]
fn scan_page(
    data: &[u8],
    page_first_bit: u64,
    from_unit: u64,
    to_unit: u64,
    aligned: bool,
    need: u64,
    run: &mut Run,
    is_reserved: impl Fn(u64, u64) -> bool,
) -> PageScan {
    let unit_bits = if aligned { CHUNK_BITS } else { 1 };
    let mut local = 0u64;
    let mut longest = 0u64;
    let mut unit = from_unit;
    while unit < to_unit {
        if !aligned && unit & 7 == 0 && unit + 8 <= to_unit {
            let byte = data[(unit >> 3) as usize];
            let head = u64::from(byte.trailing_zeros());
            let inner = u64::from(MAX_HOLE[usize::from(byte)]);
            if run.len + head < need && inner < need {
                if byte == 0 {
                    if run.len == 0 {
                        run.start = page_first_bit + unit;
                    }
                    run.len += 8;
                    local += 8;
                } else {
                    let tail = u64::from(byte.leading_zeros());
                    longest = longest.max(local + head).max(inner);
                    local = tail;
                    *run = if tail == 0 {
                        Run::default()
                    } else {
                        Run { start: page_first_bit + unit + 8 - tail, len: tail }
                    };
                }
                longest = longest.max(local);
                unit += 8;
                continue;
            }
            // A hole completes in this byte: walk it bit by bit.
        }
        let free = if aligned {
            let offs = unit as usize * CHUNK_BYTES;
            data[offs..offs + CHUNK_BYTES].iter().all(|&b| b == 0)
        } else {
            data[(unit >> 3) as usize] & (1 << (unit & 7)) == 0
        };
        if free {
            if run.len == 0 {
                run.start = page_first_bit + unit * unit_bits;
            }
            run.len += unit_bits;
            local += unit_bits;
            longest = longest.max(local);
            if run.len >= need {
                if !is_reserved(run.start << QUANTUM_LOG, need << QUANTUM_LOG) {
                    return PageScan { found: Some(run.start), longest };
                }
                // Restart right after the reserved overlap.
                *run = Run::default();
            }
        } else {
            *run = Run::default();
            local = 0;
        }
        unit += 1;
    }
    PageScan { found: None, longest }
}

/// Sets or clears bits `from..to` of a bitmap page.
pub(crate) fn fill_bits(data: &mut [u8], from: u64, to: u64, set: bool) {
    let mut bit = from;
    while bit < to {
        let byte = (bit >> 3) as usize;
        if bit & 7 == 0 && bit + 8 <= to {
            data[byte] = if set { 0xFF } else { 0 };
            bit += 8;
        } else {
            let mask = 1u8 << (bit & 7);
            if set {
                data[byte] |= mask;
            } else {
                data[byte] &= !mask;
            }
            bit += 1;
        }
    }
}

/// Bits of the bitmap page starting at byte `page_base` that overlap the
/// byte range `pos..pos + size`.
fn page_bit_range(page_base: u64, pos: u64, size: u64) -> Option<(u64, u64)> {
    let start = pos.max(page_base);
    let end = (pos + size).min(page_base + BITMAP_SEGMENT_SIZE);
    (start < end).then(|| ((start - page_base) >> QUANTUM_LOG, (end - page_base) >> QUANTUM_LOG))
}

impl Core {
    /// Oid of bitmap page `page`.
    pub(crate) fn bitmap_page_oid(&self, page: u32) -> Oid {
        if page < BITMAP_PAGES {
            BITMAP_ID + page
        } else {
            self.header.root[self.header.working()].bitmap_extent + page
        }
    }

    /// Position of bitmap page `page` in the working generation.
    fn bitmap_page_pos(&self, page: u32) -> Result<u64> {
        Ok(entry_pos(self.get_pos(self.bitmap_page_oid(page))?))
    }

    /// Reserves a quantum-aligned range of at least `size` bytes.
    ///
    /// With a non-zero `oid` the range replaces the page object `oid`: its
    /// current contents are copied over and its entry is repointed.
    pub(crate) fn allocate(&mut self, size: u64, oid: Oid) -> Result<u64> {
        if size == 0 {
            return Err(Error::access("zero-length allocation"));
        }
        self.begin_write()?;
        let size = align_to_quantum(size);
        let aligned = size & (PAGE_SIZE as u64 - 1) == 0;
        self.prepare_extent()?;

        let pos = match self.find_hole(size, aligned)? {
            Some(pos) => pos,
            None => return self.extend(size, aligned, oid),
        };
        self.alloc.reserved.push((pos, size));
        let placed = self.place(pos, size, oid);
        self.alloc.reserved.pop();
        placed?;
        Ok(pos)
    }

    /// Marks a found hole as used.
    fn place(&mut self, pos: u64, size: u64, oid: Oid) -> Result<()> {
        self.account(size);
        let w = self.header.working();
        if pos + size > self.header.root[w].size {
            self.header.root[w].size = pos + size;
        }
        if oid != 0 {
            self.relocate(oid, pos, size)?;
        }
        self.update_bits(pos, size, true)
    }

    /// Copies a page object to `pos` and repoints its entry.
    ///
    /// The entry is updated before any bitmap bit is touched so that a bitmap
    /// page relocating itself is already writable at its new position.
    fn relocate(&mut self, oid: Oid, pos: u64, size: u64) -> Result<()> {
        let prev = self.get_pos(oid)?;
        if prev & FREE_HANDLE_FLAG == 0 && entry_pos(prev) != 0 {
            self.pool.copy(pos, entry_pos(prev), size)?;
        }
        self.set_pos(oid, pos | (prev & PAGE_OBJECT_FLAG) | MODIFIED_FLAG)
    }

    fn account(&mut self, size: u64) {
        self.used_size += size;
        self.gc.allocated_delta += size;
    }

    /// Looks for a hole from the class cursor to the end of the bitmap, then
    /// wraps around to the start.
    fn find_hole(&mut self, size: u64, aligned: bool) -> Result<Option<u64>> {
        let need = size >> QUANTUM_LOG;
        let slot = if aligned { ALIGNED } else { UNALIGNED };
        let end_bit = u64::from(self.header.root[self.header.working()].bitmap_end) * BITMAP_PAGE_BITS;
        let cursor = self.alloc.cursors[slot].min(end_bit);

        let mut found = self.scan(cursor, end_bit, need, aligned)?;
        if found.is_none() && cursor > 0 {
            found = self.scan(0, (cursor + need).min(end_bit), need, aligned)?;
        }
        Ok(found.map(|bit| {
            self.alloc.cursors[slot] = bit + need;
            bit << QUANTUM_LOG
        }))
    }

    /// Scans bits `from..to` for `need` consecutive free bits.
    fn scan(&mut self, from: u64, to: u64, need: u64, aligned: bool) -> Result<Option<u64>> {
        let unit_bits = if aligned { CHUNK_BITS } else { 1 };
        let slot = if aligned { ALIGNED } else { UNALIGNED };
        let mut bit = from.div_ceil(unit_bits) * unit_bits;
        let mut run = Run::default();
        while bit < to {
            let page = (bit / BITMAP_PAGE_BITS) as u32;
            let page_first = u64::from(page) * BITMAP_PAGE_BITS;
            let page_end = (page_first + BITMAP_PAGE_BITS).min(to);
            let whole_page = bit == page_first && run.len == 0;
            if whole_page && u64::from(self.alloc.hint(slot, page)) < need.min(BITMAP_PAGE_BITS) {
                bit = page_first + BITMAP_PAGE_BITS;
                continue;
            }
            let scan = {
                let page_ref = self.pool.get_page(self.bitmap_page_pos(page)?)?;
                let data = page_ref.data();
                let alloc = &self.alloc;
                scan_page(
                    &data,
                    page_first,
                    (bit - page_first) / unit_bits,
                    (page_end - page_first) / unit_bits,
                    aligned,
                    need,
                    &mut run,
                    |pos, size| alloc.is_reserved(pos, size),
                )
            };
            if let Some(start) = scan.found {
                return Ok(Some(start));
            }
            if whole_page && page_end == page_first + BITMAP_PAGE_BITS {
                self.alloc.set_hint(slot, page, u32::try_from(scan.longest).unwrap_or(u32::MAX));
            }
            bit = page_end;
        }
        Ok(None)
    }

    /// Free units at the very end of bitmap page `page`, in bits.
    fn trailing_free_bits(&self, page: u32, aligned: bool) -> Result<u64> {
        let page_ref = self.pool.get_page(self.bitmap_page_pos(page)?)?;
        let data = page_ref.data();
        let mut bits = 0u64;
        if aligned {
            for chunk in data.chunks_exact(CHUNK_BYTES).rev() {
                if chunk.iter().any(|&b| b != 0) {
                    break;
                }
                bits += CHUNK_BITS;
            }
        } else {
            for &byte in data.iter().rev() {
                if byte == 0 {
                    bits += 8;
                    continue;
                }
                bits += u64::from(byte.leading_zeros());
                break;
            }
        }
        Ok(bits)
    }

    /// Grows the file when no hole is large enough.
    ///
    /// The request is placed over the free tail of the bitmap and the new
    /// bitmap pages go right after it, already marking themselves and the
    /// part of the request they cover.
    fn extend(&mut self, size: u64, aligned: bool, oid: Oid) -> Result<u64> {
        let w = self.header.working();
        let root = self.header.root[w];
        let old_pages = root.bitmap_end;
        let mapped = u64::from(old_pages) * BITMAP_SEGMENT_SIZE;
        let tail = self.trailing_free_bits(old_pages - 1, aligned)? << QUANTUM_LOG;
        let mut pos = self.alloc.reserved_end(mapped - tail);
        pos = if aligned { align_to_page(pos) } else { align_to_quantum(pos) };

        let bitmap_pos = align_to_page(pos + size);
        let per_page = BITMAP_SEGMENT_SIZE - PAGE_SIZE as u64;
        let mut more = self.config.extension_quantum.div_ceil(per_page).max(1);
        loop {
            let end = bitmap_pos + more * PAGE_SIZE as u64;
            let required = end.saturating_sub(mapped).div_ceil(BITMAP_SEGMENT_SIZE);
            if required <= more {
                break;
            }
            more = required;
        }
        let limit = if root.bitmap_extent != 0 { LARGE_BITMAP_PAGES } else { BITMAP_PAGES };
        if u64::from(old_pages) + more > u64::from(limit) {
            return Err(Error::NotEnoughSpace);
        }
        let more = more as u32;
        let bitmap_bytes = u64::from(more) * PAGE_SIZE as u64;

        self.alloc.reserved.push((pos, bitmap_pos + bitmap_bytes - pos));
        let installed = self.install_bitmap_pages(pos, size, oid, bitmap_pos, more);
        self.alloc.reserved.pop();
        installed?;

        let slot = if aligned { ALIGNED } else { UNALIGNED };
        self.alloc.cursors[slot] = (pos + size) >> QUANTUM_LOG;
        tracing::debug!(
            bitmap_pages = more,
            size = self.header.root[self.header.working()].size,
            "database extended"
        );
        Ok(pos)
    }

    fn install_bitmap_pages(
        &mut self,
        pos: u64,
        size: u64,
        oid: Oid,
        bitmap_pos: u64,
        more: u32,
    ) -> Result<()> {
        let w = self.header.working();
        let old_pages = self.header.root[w].bitmap_end;
        let mapped = u64::from(old_pages) * BITMAP_SEGMENT_SIZE;
        let bitmap_bytes = u64::from(more) * PAGE_SIZE as u64;

        for k in 0..more {
            let page = old_pages + k;
            let page_base = u64::from(page) * BITMAP_SEGMENT_SIZE;
            let mut data = vec![0u8; PAGE_SIZE];
            for (start, len) in [(pos, size), (bitmap_pos, bitmap_bytes)] {
                if let Some((from, to)) = page_bit_range(page_base, start, len) {
                    fill_bits(&mut data, from, to, true);
                }
            }
            let page_pos = bitmap_pos + u64::from(k) * PAGE_SIZE as u64;
            self.pool.put(page_pos, &data)?;
            let page_oid = self.bitmap_page_oid(page);
            self.set_pos(page_oid, page_pos | PAGE_OBJECT_FLAG | MODIFIED_FLAG)?;
        }
        let root = &mut self.header.root[w];
        root.bitmap_end = old_pages + more;
        root.size = root.size.max(bitmap_pos + bitmap_bytes);
        self.account(size + bitmap_bytes);

        if oid != 0 {
            self.relocate(oid, pos, size)?;
        }
        if pos < mapped {
            self.update_bits(pos, (pos + size).min(mapped) - pos, true)?;
        }
        Ok(())
    }

    /// Reserves the oid range of the large-file bitmap extent while enough
    /// address space is left to grow the index for it.
    fn prepare_extent(&mut self) -> Result<()> {
        let w = self.header.working();
        let root = self.header.root[w];
        if root.bitmap_extent != 0 || self.alloc.maintenance || !self.alloc.reserved.is_empty() {
            return Ok(());
        }
        let extra = LARGE_BITMAP_PAGES - BITMAP_PAGES;
        let remaining = u64::from(BITMAP_PAGES - root.bitmap_end.min(BITMAP_PAGES)) * BITMAP_SEGMENT_SIZE;
        let index_bytes = (u64::from(self.curr_index_size) + u64::from(extra)) << 4;
        if remaining > 2 * index_bytes + EXTENT_MARGIN {
            return Ok(());
        }
        self.alloc.maintenance = true;
        let first = self.reserve_ids(extra);
        self.alloc.maintenance = false;
        let first = first?;
        self.header.root[w].bitmap_extent = first - BITMAP_PAGES;
        tracing::debug!(first, "bitmap extent reserved");
        Ok(())
    }

    /// Releases `size` bytes at `pos` in the working bitmap.
    pub(crate) fn free(&mut self, pos: u64, size: u64) -> Result<()> {
        let size = align_to_quantum(size);
        self.update_bits(pos, size, false)?;
        self.used_size = self.used_size.saturating_sub(size);
        self.gc.allocated_delta = self.gc.allocated_delta.saturating_sub(size);
        let bit = pos >> QUANTUM_LOG;
        for cursor in &mut self.alloc.cursors {
            if bit < *cursor {
                *cursor = bit;
            }
        }
        Ok(())
    }

    /// Sets or clears the bits covering `pos..pos + size`.
    fn update_bits(&mut self, pos: u64, size: u64, set: bool) -> Result<()> {
        let first = (pos / BITMAP_SEGMENT_SIZE) as u32;
        let last = ((pos + size - 1) / BITMAP_SEGMENT_SIZE) as u32;
        for page in first..=last {
            let page_base = u64::from(page) * BITMAP_SEGMENT_SIZE;
            let Some((from, to)) = page_bit_range(page_base, pos, size) else { continue };
            let page_pos = self.put_page_object(self.bitmap_page_oid(page))?;
            let page_ref = self.pool.put_page(page_pos)?;
            fill_bits(&mut page_ref.data_mut(), from, to, set);
            if !set {
                self.alloc.forget_hint(page);
            }
        }
        Ok(())
    }

    /// Makes the bitmap pages covering `pos..pos + size` private to the
    /// open transaction.
    pub(crate) fn clone_bitmap(&mut self, pos: u64, size: u64) -> Result<()> {
        let size = align_to_quantum(size).max(1);
        let first = (pos / BITMAP_SEGMENT_SIZE) as u32;
        let last = ((pos + size - 1) / BITMAP_SEGMENT_SIZE) as u32;
        for page in first..=last {
            self.put_page_object(self.bitmap_page_oid(page))?;
        }
        Ok(())
    }

    /// Returns the writable position of page object `oid`, relocating it on
    /// its first change in the transaction.
    pub(crate) fn put_page_object(&mut self, oid: Oid) -> Result<u64> {
        let entry = self.get_pos(oid)?;
        if entry & PAGE_OBJECT_FLAG == 0 {
            return Err(Error::InvalidOid { oid });
        }
        if entry & MODIFIED_FLAG != 0 {
            return Ok(entry_pos(entry));
        }
        self.dirty_pages.mark_oid(oid);
        let pos = self.allocate(PAGE_SIZE as u64, oid)?;
        self.clone_bitmap(entry_pos(entry), PAGE_SIZE as u64)?;
        Ok(pos)
    }

    /// Whether every quantum of `pos..pos + size` is marked allocated.
    pub(crate) fn is_allocated(&self, pos: u64, size: u64) -> Result<bool> {
        let size = align_to_quantum(size);
        let first = (pos / BITMAP_SEGMENT_SIZE) as u32;
        let last = ((pos + size - 1) / BITMAP_SEGMENT_SIZE) as u32;
        for page in first..=last {
            let page_base = u64::from(page) * BITMAP_SEGMENT_SIZE;
            let Some((from, to)) = page_bit_range(page_base, pos, size) else { continue };
            let page_ref = self.pool.get_page(self.bitmap_page_pos(page)?)?;
            let data = page_ref.data();
            if (from..to).any(|bit| data[(bit >> 3) as usize] & (1 << (bit & 7)) == 0) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Page objects
    // ------------------------------------------------------------------

    /// Allocates a zeroed page object and returns its oid.
    pub(crate) fn allocate_page_object(&mut self) -> Result<Oid> {
        let oid = self.allocate_id()?;
        let pos = self.allocate(PAGE_SIZE as u64, 0)?;
        self.set_pos(oid, pos | PAGE_OBJECT_FLAG | MODIFIED_FLAG)?;
        self.pool.put(pos, &[0u8; PAGE_SIZE])?;
        Ok(oid)
    }

    /// Releases page object `oid` and its handle.
    pub(crate) fn free_page_object(&mut self, oid: Oid) -> Result<()> {
        self.begin_write()?;
        let entry = self.get_pos(oid)?;
        if entry & PAGE_OBJECT_FLAG == 0 {
            return Err(Error::InvalidOid { oid });
        }
        if entry & MODIFIED_FLAG != 0 {
            self.free(entry_pos(entry), PAGE_SIZE as u64)?;
        } else {
            self.clone_bitmap(entry_pos(entry), PAGE_SIZE as u64)?;
        }
        self.free_id(oid)
    }

    /// Contents of page object `oid` in the working generation.
    pub(crate) fn read_page_object(&self, oid: Oid) -> Result<Vec<u8>> {
        let entry = self.get_pos(oid)?;
        if entry & PAGE_OBJECT_FLAG == 0 {
            return Err(Error::InvalidOid { oid });
        }
        self.pool.get(entry_pos(entry), PAGE_SIZE)
    }

    /// Overwrites page object `oid`.
    pub(crate) fn write_page_object(&mut self, oid: Oid, data: &[u8]) -> Result<()> {
        self.begin_write()?;
        let pos = self.put_page_object(oid)?;
        self.pool.put(pos, &data[..PAGE_SIZE.min(data.len())])
    }

    // ------------------------------------------------------------------
    // Object records
    // ------------------------------------------------------------------

    fn write_record(&self, pos: u64, size: u32, type_oid: Oid, payload: &[u8]) -> Result<()> {
        let mut buf = vec![0u8; ObjectHeader::SIZE + payload.len()];
        ObjectHeader { size, type_oid }.write(&mut buf);
        buf[ObjectHeader::SIZE..].copy_from_slice(payload);
        self.pool.put(pos, &buf)
    }

    fn record_size(payload: &[u8]) -> Result<u32> {
        u32::try_from(ObjectHeader::SIZE + payload.len())
            .map_err(|_| Error::access(format!("record of {} bytes is too large", payload.len())))
    }

    /// Stores a new record and returns its oid.
    pub(crate) fn create_record(&mut self, type_oid: Oid, payload: &[u8]) -> Result<Oid> {
        let size = Self::record_size(payload)?;
        let oid = self.allocate_id()?;
        let pos = self.allocate(u64::from(size), 0)?;
        self.set_pos(oid, pos | MODIFIED_FLAG)?;
        self.write_record(pos, size, type_oid, payload)?;
        Ok(oid)
    }

    /// Replaces the record of `oid`.
    ///
    /// A record still owned by the committed snapshot is always written to a
    /// new place. One created in this transaction is rewritten in place
    /// unless it grew past its allocation; a shrunk record keeps its
    /// allocated size in the header.
    pub(crate) fn update_record(&mut self, oid: Oid, type_oid: Oid, payload: &[u8]) -> Result<()> {
        self.begin_write()?;
        let new_size = Self::record_size(payload)?;
        let entry = self.get_pos(oid)?;
        let pos = self.object_pos(oid)?;
        let old_size = self.record_header(pos)?.size;

        if entry & MODIFIED_FLAG == 0 {
            self.clone_bitmap(pos, u64::from(old_size))?;
            let new_pos = self.allocate(u64::from(new_size), 0)?;
            self.set_pos(oid, new_pos | MODIFIED_FLAG)?;
            self.write_record(new_pos, new_size, type_oid, payload)
        } else if align_to_quantum(u64::from(new_size)) > align_to_quantum(u64::from(old_size)) {
            let new_pos = self.allocate(u64::from(new_size), 0)?;
            self.clone_bitmap(pos, u64::from(old_size))?;
            self.free(pos, u64::from(old_size))?;
            self.set_pos(oid, new_pos | MODIFIED_FLAG)?;
            self.write_record(new_pos, new_size, type_oid, payload)
        } else {
            self.write_record(pos, new_size.max(old_size), type_oid, payload)
        }
    }

    /// Header of the record at `pos`.
    pub(crate) fn record_header(&self, pos: u64) -> Result<ObjectHeader> {
        let head = self.pool.get(pos, ObjectHeader::SIZE)?;
        let header = ObjectHeader::read(&head);
        if (header.size as usize) < ObjectHeader::SIZE {
            return Err(Error::corrupted(format!("record at {pos} has size {}", header.size)));
        }
        Ok(header)
    }

    /// Header and payload of the record of `oid`.
    pub(crate) fn load_record(&self, oid: Oid) -> Result<(ObjectHeader, Vec<u8>)> {
        let pos = self.object_pos(oid)?;
        let header = self.record_header(pos)?;
        let payload = self.pool.get(pos + ObjectHeader::SIZE as u64, header.size as usize - ObjectHeader::SIZE)?;
        Ok((header, payload))
    }

    /// Releases the record or page object of `oid` and its handle.
    pub(crate) fn deallocate_record(&mut self, oid: Oid) -> Result<()> {
        self.begin_write()?;
        let entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            return Err(Error::DeletedObject { oid });
        }
        let pos = entry_pos(entry);
        let size = if entry & PAGE_OBJECT_FLAG != 0 {
            PAGE_SIZE as u64
        } else {
            u64::from(self.record_header(pos)?.size)
        };
        if entry & MODIFIED_FLAG != 0 {
            self.free(pos, size)?;
        } else {
            self.clone_bitmap(pos, size)?;
        }
        self.free_id(oid)
    }
}
