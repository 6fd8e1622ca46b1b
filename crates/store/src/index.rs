//! Object index: the oid → position table and its shadow generation.
//!
//! Each oid owns one little-endian `u64` entry holding a quantum-aligned file
//! position plus [`PAGE_OBJECT_FLAG`], [`MODIFIED_FLAG`] or
//! [`FREE_HANDLE_FLAG`]. There are two copies of the table, one per root
//! descriptor. The open transaction reads and writes the working copy
//! (`1 - curr`); the committed copy (`curr`) is never touched until commit
//! flips the selector and copies the pages that changed back into the new
//! working copy.
//!
//! Index pages touched by the transaction are tracked in a [`DirtyMap`] keyed
//! by index page number, so commit and rollback only copy what changed.

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{Error, Oid, Result},
    layout::{
        FIRST_USER_OID, FLAGS_BITS, FLAGS_MASK, FREE_HANDLE_FLAG, HANDLES_PER_PAGE,
        HANDLES_PER_PAGE_LOG, MODIFIED_FLAG, ObjectHeader, PAGE_OBJECT_FLAG, PAGE_SIZE,
        PAGE_SIZE_LOG, RootPage, align_to_page,
    },
    storage::Core,
};

/// Number of bits per word in the backing store.
const BITS_PER_WORD: usize = 64;

/// Bitset of index pages modified in the open transaction.
///
/// Bit `i` covers oids `i * 512 .. (i + 1) * 512`. The set grows on demand.
#[derive(Debug, Clone, Default)]
pub(crate) struct DirtyMap {
    words: Vec<u64>,
}

impl DirtyMap {
    /// Marks the index page holding `oid`.
    pub(crate) fn mark_oid(&mut self, oid: Oid) {
        self.mark((oid >> HANDLES_PER_PAGE_LOG) as usize);
    }

    /// Marks index page `page`.
    pub(crate) fn mark(&mut self, page: usize) {
        let word_idx = page / BITS_PER_WORD;
        if word_idx >= self.words.len() {
            self.words.resize(word_idx + 1, 0);
        }
        self.words[word_idx] |= 1u64 << (page % BITS_PER_WORD);
    }

    /// Whether index page `page` was modified.
    pub(crate) fn is_dirty(&self, page: usize) -> bool {
        self.words
            .get(page / BITS_PER_WORD)
            .is_some_and(|word| word & (1u64 << (page % BITS_PER_WORD)) != 0)
    }

    /// Modified index pages in ascending order.
    pub(crate) fn dirty_pages(&self) -> Vec<usize> {
        let mut pages = Vec::new();
        for (word_idx, &word) in self.words.iter().enumerate() {
            let mut bits = word;
            while bits != 0 {
                let bit = bits.trailing_zeros() as usize;
                pages.push(word_idx * BITS_PER_WORD + bit);
                bits &= bits - 1;
            }
        }
        pages
    }

    /// Number of modified pages.
    pub(crate) fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Forgets every mark.
    pub(crate) fn clear(&mut self) {
        self.words.clear();
    }
}

/// Position bits of an index entry.
pub(crate) fn entry_pos(entry: u64) -> u64 {
    entry & !FLAGS_MASK
}

impl Core {
    /// Reads the entry of `oid` in `generation`.
    pub(crate) fn index_entry(&self, generation: usize, oid: Oid) -> Result<u64> {
        let index = self.header.root[generation].index;
        let page_pos = index + (u64::from(oid >> HANDLES_PER_PAGE_LOG) << PAGE_SIZE_LOG);
        let offs = ((oid & (HANDLES_PER_PAGE - 1)) as usize) << 3;
        let page = self.pool.get_page(page_pos)?;
        let data = page.data();
        Ok(LittleEndian::read_u64(&data[offs..offs + 8]))
    }

    /// Writes the entry of `oid` in `generation`.
    ///
    /// Only the working generation may be written while a transaction is open.
    pub(crate) fn set_index_entry(&mut self, generation: usize, oid: Oid, entry: u64) -> Result<()> {
        let index = self.header.root[generation].index;
        let page_pos = index + (u64::from(oid >> HANDLES_PER_PAGE_LOG) << PAGE_SIZE_LOG);
        let offs = ((oid & (HANDLES_PER_PAGE - 1)) as usize) << 3;
        let page = self.pool.put_page(page_pos)?;
        LittleEndian::write_u64(&mut page.data_mut()[offs..offs + 8], entry);
        if generation == self.header.working() {
            self.dirty_pages.mark_oid(oid);
        }
        Ok(())
    }

    /// Rejects oid 0 and oids past the end of the working index.
    pub(crate) fn check_oid(&self, oid: Oid) -> Result<()> {
        if oid == 0 || oid >= self.curr_index_size {
            return Err(Error::InvalidOid { oid });
        }
        Ok(())
    }

    /// Entry of `oid` as seen by the open transaction.
    pub(crate) fn get_pos(&self, oid: Oid) -> Result<u64> {
        self.check_oid(oid)?;
        self.index_entry(self.header.working(), oid)
    }

    /// Updates the entry of `oid` in the working index.
    pub(crate) fn set_pos(&mut self, oid: Oid, entry: u64) -> Result<()> {
        let generation = self.header.working();
        self.set_index_entry(generation, oid, entry)
    }

    /// Entry of `oid` in the last committed snapshot.
    pub(crate) fn committed_pos(&self, oid: Oid) -> Result<u64> {
        if oid == 0 || oid >= self.committed_index_size {
            return Err(Error::InvalidOid { oid });
        }
        self.index_entry(self.header.committed(), oid)
    }

    /// Position of a live object record, rejecting free and page handles.
    pub(crate) fn object_pos(&self, oid: Oid) -> Result<u64> {
        let entry = self.get_pos(oid)?;
        if entry & FREE_HANDLE_FLAG != 0 {
            return Err(Error::DeletedObject { oid });
        }
        if entry & PAGE_OBJECT_FLAG != 0 {
            return Err(Error::InvalidOid { oid });
        }
        Ok(entry_pos(entry))
    }

    /// Marks the database dirty before the first change of a session.
    ///
    /// The flag is persisted immediately so a crash before the next clean
    /// close triggers recovery on open.
    pub(crate) fn begin_write(&mut self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        self.modified = true;
        if !self.header.dirty {
            self.header.dirty = true;
            self.write_header()?;
            self.pool.flush()?;
        }
        Ok(())
    }

    /// Serializes the in-memory header into page 0.
    pub(crate) fn write_header(&self) -> Result<()> {
        let page = self.pool.put_page(0)?;
        self.header.write_to(&mut page.data_mut());
        Ok(())
    }

    /// Hands out a fresh oid, reusing the free list first.
    pub(crate) fn allocate_id(&mut self) -> Result<Oid> {
        self.begin_write()?;
        let w = self.header.working();
        let head = self.header.root[w].free_list;
        if head != 0 {
            let next = (self.get_pos(head)? >> FLAGS_BITS) as Oid;
            self.header.root[w].free_list = next;
            self.dirty_pages.mark_oid(head);
            return Ok(head);
        }
        // Growing may itself reserve oids, so re-check after each step.
        loop {
            let needed = self.curr_index_size.checked_add(1).ok_or(Error::NotEnoughSpace)?;
            if needed <= self.header.root[w].index_size {
                let oid = self.curr_index_size;
                self.curr_index_size = needed;
                self.header.root[w].index_used = needed;
                return Ok(oid);
            }
            self.grow_index(needed)?;
        }
    }

    /// Reserves `count` consecutive fresh oids past the end of the index.
    ///
    /// The new entries are initialised as unlinked free handles.
    pub(crate) fn reserve_ids(&mut self, count: u32) -> Result<Oid> {
        let w = self.header.working();
        let (first, needed) = loop {
            let first = self.curr_index_size;
            let needed = first.checked_add(count).ok_or(Error::NotEnoughSpace)?;
            if needed <= self.header.root[w].index_size {
                break (first, needed);
            }
            self.grow_index(needed)?;
        };
        let index = self.header.root[w].index;
        let mut page = vec![0u8; PAGE_SIZE];
        for chunk in page.chunks_exact_mut(8) {
            LittleEndian::write_u64(chunk, FREE_HANDLE_FLAG);
        }
        let mut oid = first;
        while oid < needed {
            let n = (needed - oid).min(HANDLES_PER_PAGE - (oid & (HANDLES_PER_PAGE - 1)));
            self.pool.put(index + (u64::from(oid) << 3), &page[..(n as usize) << 3])?;
            self.dirty_pages.mark_oid(oid);
            oid += n;
        }
        self.curr_index_size = needed;
        self.header.root[w].index_used = needed;
        Ok(first)
    }

    /// Returns `oid` to the free list.
    pub(crate) fn free_id(&mut self, oid: Oid) -> Result<()> {
        let w = self.header.working();
        let head = self.header.root[w].free_list;
        self.set_pos(oid, (u64::from(head) << FLAGS_BITS) | FREE_HANDLE_FLAG)?;
        self.header.root[w].free_list = oid;
        Ok(())
    }

    /// Doubles the working index until it holds `min_size` entries.
    fn grow_index(&mut self, min_size: u32) -> Result<()> {
        let w = self.header.working();
        let old_size = self.header.root[w].index_size;
        let mut new_size = u64::from(old_size);
        while new_size < u64::from(min_size) {
            new_size *= 2;
        }
        let new_size = u32::try_from(new_size).map_err(|_| Error::NotEnoughSpace)?;
        let new_index = self.allocate(u64::from(new_size) << 3, 0)?;
        // The allocation may have grown the index recursively.
        let old_index = self.header.root[w].index;
        let old_size = self.header.root[w].index_size.max(old_size);
        if new_size <= old_size {
            self.free(new_index, u64::from(new_size) << 3)?;
            return Ok(());
        }
        self.pool.copy(new_index, old_index, u64::from(self.curr_index_size) << 3)?;
        self.header.root[w].index = new_index;
        self.header.root[w].index_size = new_size;
        self.free(old_index, u64::from(old_size) << 3)?;
        tracing::debug!(old_size, new_size, "object index grown");
        Ok(())
    }

    /// Publishes the working generation.
    ///
    /// Frees committed positions replaced in this transaction, clears the
    /// per-transaction flags, persists the working root, flips `curr`, and
    /// brings the new working index up to date with the committed one.
    pub(crate) fn commit_index(&mut self) -> Result<()> {
        self.alloc.maintenance = true;
        let committed = self.publish_working();
        self.alloc.maintenance = false;
        committed
    }

    fn publish_working(&mut self) -> Result<()> {
        let curr = self.header.committed();
        let w = self.header.working();
        let committed_size = self.committed_index_size;
        let old_index_size = self.header.root[curr].index_size;
        let new_index_size = self.header.root[w].index_size;
        let n_pages = (committed_size >> HANDLES_PER_PAGE_LOG) as usize;
        let dirty_before = self.dirty_pages.count();

        if new_index_size > old_index_size {
            let shadow = self.allocate(u64::from(new_index_size) << 3, 0)?;
            let w = self.header.working();
            self.header.root[w].shadow_index = shadow;
            self.header.root[w].shadow_index_size = new_index_size;
            let old_index = self.header.root[curr].index;
            self.clone_bitmap(old_index, u64::from(old_index_size) << 3)?;
            self.free(old_index, u64::from(old_index_size) << 3)?;
        }

        // Release committed positions that the transaction replaced.
        for page in self.dirty_pages.dirty_pages() {
            let first = (page as u32) << HANDLES_PER_PAGE_LOG;
            if first >= committed_size {
                break;
            }
            let last = (first + HANDLES_PER_PAGE).min(committed_size);
            for oid in first.max(1)..last {
                let old = self.index_entry(curr, oid)?;
                let new = self.index_entry(self.header.working(), oid)?;
                if old == new || old & FREE_HANDLE_FLAG != 0 {
                    continue;
                }
                let pos = entry_pos(old);
                if old & PAGE_OBJECT_FLAG != 0 {
                    self.free(pos, PAGE_SIZE as u64)?;
                } else {
                    let head = self.pool.get(pos, ObjectHeader::SIZE)?;
                    let size = ObjectHeader::read(&head).size;
                    self.free(pos, u64::from(size))?;
                }
            }
        }

        // Drop the per-transaction flags from the working index.
        let w = self.header.working();
        let index = self.header.root[w].index;
        let clear_page = |core: &mut Core, page: usize| -> Result<()> {
            let page_ref = core.pool.put_page(index + ((page as u64) << PAGE_SIZE_LOG))?;
            let mut data = page_ref.data_mut();
            for chunk in data.chunks_exact_mut(8) {
                let entry = LittleEndian::read_u64(chunk);
                if entry & MODIFIED_FLAG != 0 {
                    LittleEndian::write_u64(chunk, entry & !MODIFIED_FLAG);
                }
            }
            Ok(())
        };
        for page in self.dirty_pages.dirty_pages() {
            if page <= n_pages {
                clear_page(self, page)?;
            }
        }
        let tail_pages = (self.curr_index_size as usize).div_ceil(HANDLES_PER_PAGE as usize);
        for page in n_pages + 1..tail_pages {
            clear_page(self, page)?;
        }

        self.header.root[w].used_size = self.used_size;
        self.header.root[w].index_used = self.curr_index_size;
        self.write_header()?;
        self.pool.flush()?;

        self.header.curr = w;
        self.header.dirty = true;
        self.write_header()?;
        self.pool.flush()?;

        // The old committed generation becomes the new working one.
        let curr = self.header.committed();
        let w = self.header.working();
        let committed = self.header.root[curr];
        self.header.root[w].copy_state_from(&committed);
        let entries_bytes = u64::from(self.curr_index_size) << 3;
        if new_index_size != old_index_size {
            self.header.root[w] = RootPage::mirrored(&committed);
            self.pool.copy(self.header.root[w].index, committed.index, entries_bytes)?;
        } else {
            for page in self.dirty_pages.dirty_pages() {
                if page >= n_pages {
                    break;
                }
                let offs = (page as u64) << PAGE_SIZE_LOG;
                self.pool.copy(self.header.root[w].index + offs, committed.index + offs, PAGE_SIZE as u64)?;
            }
            let tail = (n_pages as u64) << PAGE_SIZE_LOG;
            if entries_bytes > tail && (self.dirty_pages.is_dirty(n_pages) || self.curr_index_size != committed_size) {
                self.pool.copy(self.header.root[w].index + tail, committed.index + tail, entries_bytes - tail)?;
            }
        }
        self.dirty_pages.clear();
        self.committed_index_size = self.curr_index_size;
        self.modified = false;
        tracing::debug!(
            dirty_pages = dirty_before,
            index_size = self.header.root[curr].index_size,
            objects = self.curr_index_size,
            "commit"
        );
        Ok(())
    }

    /// Discards the working generation and restores it from the committed one.
    pub(crate) fn rollback_index(&mut self) -> Result<()> {
        let curr = self.header.committed();
        let w = self.header.working();
        let committed = self.header.root[curr];
        let entries_bytes = align_to_page(u64::from(self.committed_index_size) << 3);
        if self.header.root[w].index != committed.shadow_index {
            self.pool.copy(committed.shadow_index, committed.index, entries_bytes)?;
        } else {
            let n_pages = (self.committed_index_size as usize).div_ceil(HANDLES_PER_PAGE as usize);
            for page in self.dirty_pages.dirty_pages() {
                if page >= n_pages {
                    break;
                }
                let offs = (page as u64) << PAGE_SIZE_LOG;
                self.pool.copy(committed.shadow_index + offs, committed.index + offs, PAGE_SIZE as u64)?;
            }
        }
        self.dirty_pages.clear();
        self.header.root[w] = RootPage::mirrored(&committed);
        self.header.root[w].index_used = self.committed_index_size;
        self.curr_index_size = self.committed_index_size;
        self.used_size = committed.used_size;
        self.modified = false;
        self.alloc.reset();
        Ok(())
    }

    /// Iterates live user oids of the working index.
    pub(crate) fn live_oids(&self) -> Result<Vec<(Oid, u64)>> {
        let mut live = Vec::new();
        for oid in FIRST_USER_OID..self.curr_index_size {
            let entry = self.index_entry(self.header.working(), oid)?;
            if entry & (FREE_HANDLE_FLAG | PAGE_OBJECT_FLAG) == 0 && entry_pos(entry) != 0 {
                live.push((oid, entry_pos(entry)));
            }
        }
        Ok(live)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::test_core;

    // ========================================================================
    // DirtyMap
    // ========================================================================

    #[test]
    fn test_dirty_map_marks_pages() {
        let mut map = DirtyMap::default();
        map.mark_oid(5);
        map.mark_oid(600);
        map.mark(130);

        assert!(map.is_dirty(0));
        assert!(map.is_dirty(1));
        assert!(map.is_dirty(130));
        assert!(!map.is_dirty(2));
        assert_eq!(map.dirty_pages(), vec![0, 1, 130]);
        assert_eq!(map.count(), 3);

        map.clear();
        assert_eq!(map.count(), 0);
        assert!(!map.is_dirty(130));
    }

    // ========================================================================
    // Handles
    // ========================================================================

    #[test]
    fn test_fresh_ids_start_after_bitmap_range() {
        let mut core = test_core();
        assert_eq!(core.allocate_id().unwrap(), FIRST_USER_OID);
        assert_eq!(core.allocate_id().unwrap(), FIRST_USER_OID + 1);
    }

    #[test]
    fn test_freed_id_is_reused_lifo() {
        let mut core = test_core();
        let a = core.allocate_id().unwrap();
        let b = core.allocate_id().unwrap();
        core.set_pos(a, 4096 | MODIFIED_FLAG).unwrap();
        core.set_pos(b, 8192 | MODIFIED_FLAG).unwrap();
        core.free_id(a).unwrap();
        core.free_id(b).unwrap();

        assert_eq!(core.allocate_id().unwrap(), b);
        assert_eq!(core.allocate_id().unwrap(), a);
    }

    #[test]
    fn test_invalid_oids_are_rejected() {
        let core = test_core();
        assert!(matches!(core.get_pos(0), Err(Error::InvalidOid { oid: 0 })));
        let past = core.curr_index_size;
        assert!(matches!(core.get_pos(past), Err(Error::InvalidOid { .. })));
    }

    #[test]
    fn test_index_grows_by_doubling() {
        let mut core = test_core();
        let initial = core.header.root[core.header.working()].index_size;
        let mut last = 0;
        while core.curr_index_size <= initial {
            last = core.allocate_id().unwrap();
            core.set_pos(last, 1 << 20 | MODIFIED_FLAG).unwrap();
        }
        let w = core.header.working();
        assert_eq!(core.header.root[w].index_size, initial * 2);
        assert_eq!(core.get_pos(last).unwrap(), 1 << 20 | MODIFIED_FLAG);
    }

    #[test]
    fn test_reserve_ids_are_free_handles() {
        let mut core = test_core();
        let first = core.reserve_ids(700).unwrap();
        for oid in [first, first + 511, first + 699] {
            assert_eq!(core.get_pos(oid).unwrap(), FREE_HANDLE_FLAG);
        }
        assert_eq!(core.curr_index_size, first + 700);
    }

    // ========================================================================
    // Commit and rollback of the index
    // ========================================================================

    #[test]
    fn test_commit_flips_generation_and_clears_modified() {
        let mut core = test_core();
        let before = core.header.curr;
        let oid = core.allocate_id().unwrap();
        let pos = core.allocate(64, 0).unwrap();
        core.set_pos(oid, pos | MODIFIED_FLAG).unwrap();
        core.commit_index().unwrap();

        assert_ne!(core.header.curr, before);
        assert_eq!(core.get_pos(oid).unwrap(), pos);
        assert_eq!(core.committed_pos(oid).unwrap(), pos);
        assert_eq!(core.dirty_pages.count(), 0);
    }

    #[test]
    fn test_rollback_restores_committed_entries() {
        let mut core = test_core();
        let oid = core.allocate_id().unwrap();
        let pos = core.allocate(64, 0).unwrap();
        core.set_pos(oid, pos | MODIFIED_FLAG).unwrap();
        core.commit_index().unwrap();

        core.begin_write().unwrap();
        core.free_id(oid).unwrap();
        assert_eq!(core.allocate_id().unwrap(), oid);
        core.allocate_id().unwrap();
        core.rollback_index().unwrap();

        assert_eq!(core.get_pos(oid).unwrap(), pos);
        assert_eq!(core.curr_index_size, core.committed_index_size);
        assert_eq!(core.allocate_id().unwrap(), oid + 1);
    }
}
