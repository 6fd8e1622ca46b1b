//! Page pool: the in-memory cache of fixed-size pages keyed by file offset.
//!
//! Every durable byte goes through the pool. Pages are pinned while in use
//! and an unpinned page is evicted in least-recently-used order when the pool
//! is full. Dirty pages are written back at [`PagePool::flush`] or when they
//! are evicted; shadow paging guarantees that an evicted dirty page never
//! belongs to the committed snapshot, so early write-back is harmless.
//!
//! Loading a page is done outside the pool lock. A second thread asking for
//! a page that is still being loaded waits on a condition variable until the
//! loader publishes it.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{
    error::Result,
    file::PageFile,
    layout::{PAGE_SIZE, PAGE_SIZE_LOG},
};

/// A cached page buffer.
struct Frame {
    data: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
}

struct Slot {
    frame: Arc<Frame>,
    pins: usize,
    /// LRU position while unpinned.
    tick: u64,
    loading: bool,
}

#[derive(Default)]
struct PoolState {
    frames: HashMap<u64, Slot>,
    /// Unpinned frames ordered by last use: tick -> offset.
    lru: BTreeMap<u64, u64>,
    tick: u64,
}

/// Counters describing pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Lookups served from memory.
    pub hits: u64,
    /// Lookups that had to read the file.
    pub misses: u64,
    /// Pages evicted to make room.
    pub evictions: u64,
    /// Pages written back to the file.
    pub writes: u64,
    /// Pages currently cached.
    pub cached_pages: usize,
    /// Configured capacity in pages (0 = unbounded).
    pub capacity: usize,
}

/// Fixed-size page cache over a [`PageFile`].
pub struct PagePool {
    file: Box<dyn PageFile>,
    state: Mutex<PoolState>,
    loaded: Condvar,
    /// Capacity in pages; zero means unbounded.
    capacity: usize,
    /// Dirty pages stay in memory and are never written.
    read_only: bool,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    writes: AtomicU64,
}

/// A pinned page. The pin is released on drop.
pub struct PageRef<'a> {
    pool: &'a PagePool,
    pos: u64,
    frame: Arc<Frame>,
}

impl PageRef<'_> {
    /// File offset of the page.
    pub fn pos(&self) -> u64 {
        self.pos
    }

    /// Read access to the page bytes.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.frame.data.read()
    }

    /// Write access to the page bytes; marks the page dirty.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.frame.dirty.store(true, Ordering::Release);
        self.frame.data.write()
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        self.pool.unfix(self.pos);
    }
}

impl PagePool {
    /// Creates a pool of `capacity_bytes / PAGE_SIZE` pages over `file`.
    ///
    /// A capacity of zero lets the pool grow without bound.
    pub fn new(file: Box<dyn PageFile>, capacity_bytes: u64, read_only: bool) -> Self {
        let capacity = usize::try_from(capacity_bytes >> PAGE_SIZE_LOG).unwrap_or(usize::MAX);
        Self {
            file,
            state: Mutex::new(PoolState::default()),
            loaded: Condvar::new(),
            capacity,
            read_only,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// The underlying file.
    pub fn file(&self) -> &dyn PageFile {
        self.file.as_ref()
    }

    /// Pins the page at `pos` for reading, loading it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if the page cannot be loaded.
    pub fn get_page(&self, pos: u64) -> Result<PageRef<'_>> {
        debug_assert_eq!(pos % PAGE_SIZE as u64, 0, "unaligned page offset {pos}");
        let frame = self.fix(pos)?;
        Ok(PageRef { pool: self, pos, frame })
    }

    /// Pins the page at `pos` for writing and marks it dirty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if the page cannot be loaded.
    pub fn put_page(&self, pos: u64) -> Result<PageRef<'_>> {
        let page = self.get_page(pos)?;
        page.frame.dirty.store(true, Ordering::Release);
        Ok(page)
    }

    fn fix(&self, pos: u64) -> Result<Arc<Frame>> {
        let mut state = self.state.lock();
        loop {
            match state.frames.get(&pos).map(|slot| slot.loading) {
                Some(true) => self.loaded.wait(&mut state),
                Some(false) => {
                    let PoolState { frames, lru, .. } = &mut *state;
                    let Some(slot) = frames.get_mut(&pos) else { continue };
                    if slot.pins == 0 {
                        lru.remove(&slot.tick);
                    }
                    slot.pins += 1;
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Arc::clone(&slot.frame));
                },
                None => break,
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        if self.capacity != 0 && state.frames.len() >= self.capacity {
            self.evict_one(&mut state)?;
        }
        let frame = Arc::new(Frame {
            data: RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice()),
            dirty: AtomicBool::new(false),
        });
        state
            .frames
            .insert(pos, Slot { frame: Arc::clone(&frame), pins: 1, tick: 0, loading: true });
        drop(state);

        let loaded = {
            let mut data = frame.data.write();
            self.file.read(pos, &mut data).map(|n| data[n..].fill(0))
        };

        let mut state = self.state.lock();
        let result = match loaded {
            Ok(()) => {
                if let Some(slot) = state.frames.get_mut(&pos) {
                    slot.loading = false;
                }
                Ok(frame)
            },
            Err(e) => {
                state.frames.remove(&pos);
                Err(e)
            },
        };
        self.loaded.notify_all();
        result
    }

    fn unfix(&self, pos: u64) {
        let mut state = self.state.lock();
        let PoolState { frames, lru, tick } = &mut *state;
        if let Some(slot) = frames.get_mut(&pos) {
            debug_assert!(slot.pins > 0, "unfix of unpinned page {pos}");
            slot.pins -= 1;
            if slot.pins == 0 {
                *tick += 1;
                slot.tick = *tick;
                lru.insert(*tick, pos);
            }
        }
    }

    /// Evicts the least recently used unpinned page. Grows the pool when
    /// every page is pinned.
    fn evict_one(&self, state: &mut PoolState) -> Result<()> {
        let is_dirty = |slot: &Slot| slot.frame.dirty.load(Ordering::Acquire);
        let victim = state.lru.iter().map(|(&t, &p)| (t, p)).find(|(_, pos)| {
            !self.read_only || !state.frames.get(pos).is_some_and(is_dirty)
        });
        let Some((tick, pos)) = victim else { return Ok(()) };

        let mut dirty = false;
        if let Some(slot) = state.frames.get(&pos) {
            dirty = is_dirty(slot);
            if dirty {
                let data = slot.frame.data.read();
                self.file.write(pos, &data)?;
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        state.lru.remove(&tick);
        state.frames.remove(&pos);
        self.evictions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(pos, dirty, "evicted page");
        Ok(())
    }

    /// Reads `len` bytes starting at `pos`, crossing pages as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if a page cannot be loaded.
    pub fn get(&self, pos: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        let mut cur = pos;
        while out.len() < len {
            let offs = (cur % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - offs).min(len - out.len());
            let page = self.get_page(cur - offs as u64)?;
            out.extend_from_slice(&page.data()[offs..offs + n]);
            cur += n as u64;
        }
        Ok(out)
    }

    /// Writes `data` starting at `pos`, crossing pages as needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if a page cannot be loaded.
    pub fn put(&self, pos: u64, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = pos + done as u64;
            let offs = (cur % PAGE_SIZE as u64) as usize;
            let n = (PAGE_SIZE - offs).min(data.len() - done);
            let page = self.put_page(cur - offs as u64)?;
            page.data_mut()[offs..offs + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst` through the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if a page cannot be loaded.
    pub fn copy(&self, dst: u64, src: u64, len: u64) -> Result<()> {
        let mut done = 0u64;
        while done < len {
            let chunk = (len - done).min(PAGE_SIZE as u64) as usize;
            let bytes = self.get(src + done, chunk)?;
            self.put(dst + done, &bytes)?;
            done += chunk as u64;
        }
        Ok(())
    }

    /// Writes every dirty page in offset order, then syncs the file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if a write or the sync fails.
    pub fn flush(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut dirty: Vec<(u64, Arc<Frame>)> = {
            let state = self.state.lock();
            state
                .frames
                .iter()
                .filter(|(_, slot)| !slot.loading && slot.frame.dirty.load(Ordering::Acquire))
                .map(|(&pos, slot)| (pos, Arc::clone(&slot.frame)))
                .collect()
        };
        dirty.sort_unstable_by_key(|(pos, _)| *pos);
        for (pos, frame) in dirty {
            if frame.dirty.swap(false, Ordering::AcqRel) {
                let data = frame.data.read();
                if let Err(e) = self.file.write(pos, &data) {
                    frame.dirty.store(true, Ordering::Release);
                    return Err(e);
                }
                self.writes.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.file.sync()
    }

    /// Drops every cached page without writing it.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.frames.retain(|_, slot| slot.pins > 0 || slot.loading);
        state.lru.clear();
    }

    /// Flushes and closes the underlying file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if flushing fails.
    pub fn close(&self) -> Result<()> {
        self.flush()?;
        self.clear();
        self.file.close()
    }

    /// Current activity counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            cached_pages: self.state.lock().frames.len(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::file::MemoryFile;

    const PAGE: u64 = PAGE_SIZE as u64;

    fn pool_with(file: &MemoryFile, pages: u64) -> PagePool {
        PagePool::new(Box::new(file.clone()), pages * PAGE, false)
    }

    // =========================================================================
    // Pinning and caching
    // =========================================================================

    #[test]
    fn test_missing_page_reads_as_zeros() {
        let pool = pool_with(&MemoryFile::new(), 4);
        let page = pool.get_page(10 * PAGE).unwrap();
        assert!(page.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_hit_after_miss() {
        let pool = pool_with(&MemoryFile::new(), 4);
        drop(pool.get_page(0).unwrap());
        drop(pool.get_page(0).unwrap());
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_dirty_pages_written_only_on_flush() {
        let file = MemoryFile::new();
        let pool = pool_with(&file, 8);
        pool.put(PAGE + 10, b"hello").unwrap();
        assert_eq!(file.length().unwrap(), 0);

        pool.flush().unwrap();
        let bytes = file.snapshot();
        assert_eq!(&bytes[PAGE as usize + 10..PAGE as usize + 15], b"hello");
    }

    #[test]
    fn test_eviction_writes_back_dirty_page() {
        let file = MemoryFile::new();
        let pool = pool_with(&file, 2);
        pool.put(0, &[1u8; 8]).unwrap();
        pool.put(PAGE, &[2u8; 8]).unwrap();
        pool.put(2 * PAGE, &[3u8; 8]).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.evictions, 1);
        assert!(stats.cached_pages <= 2);
        // Page 0 was least recently used and had to be written back.
        assert_eq!(file.snapshot()[0], 1);
        assert_eq!(pool.get(0, 8).unwrap(), vec![1u8; 8]);
    }

    #[test]
    fn test_pinned_pages_are_not_evicted() {
        let pool = pool_with(&MemoryFile::new(), 1);
        let pinned = pool.put_page(0).unwrap();
        pinned.data_mut()[0] = 42;
        let other = pool.get_page(PAGE).unwrap();
        assert_eq!(pool.stats().cached_pages, 2);
        drop(other);
        assert_eq!(pinned.data()[0], 42);
    }

    #[test]
    fn test_unbounded_pool_never_evicts() {
        let pool = pool_with(&MemoryFile::new(), 0);
        for i in 0..64 {
            drop(pool.get_page(i * PAGE).unwrap());
        }
        assert_eq!(pool.stats().evictions, 0);
        assert_eq!(pool.stats().cached_pages, 64);
    }

    // =========================================================================
    // Multi-page helpers
    // =========================================================================

    #[test]
    fn test_put_get_across_pages() {
        let pool = pool_with(&MemoryFile::new(), 4);
        let data: Vec<u8> = (0..6000u32).map(|i| (i % 251) as u8).collect();
        pool.put(PAGE - 100, &data).unwrap();
        assert_eq!(pool.get(PAGE - 100, data.len()).unwrap(), data);
    }

    #[test]
    fn test_copy() {
        let pool = pool_with(&MemoryFile::new(), 0);
        let data: Vec<u8> = (0..9000u32).map(|i| (i % 13) as u8).collect();
        pool.put(0, &data).unwrap();
        pool.copy(8 * PAGE, 0, data.len() as u64).unwrap();
        assert_eq!(pool.get(8 * PAGE, data.len()).unwrap(), data);
    }

    #[test]
    fn test_concurrent_loaders_share_one_read() {
        let file = MemoryFile::new();
        file.write(0, &[7u8; PAGE_SIZE]).unwrap();
        let pool = Arc::new(pool_with(&file, 16));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let page = pool.get_page(0).unwrap();
                    assert_eq!(page.data()[100], 7);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 7);
    }
}
