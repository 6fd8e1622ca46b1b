//! The storage handle and the engine core behind it.
//!
//! [`Storage`] is a cheap, cloneable handle. All engine state lives in a
//! [`Core`] behind a single mutex; a second mutex (the collector monitor)
//! serializes commits against collection cycles. Locks are always taken in
//! that order: collector monitor first, then core.
//!
//! # Example
//!
//! ```
//! use nacre_store::{FieldDescriptor, FieldType, Persistent, RecordReader, RecordWriter, Result, Storage, StorageConfig};
//!
//! struct Counter {
//!     hits: u64,
//! }
//!
//! impl Persistent for Counter {
//!     const TYPE_NAME: &'static str = "demo.Counter";
//!
//!     fn fields() -> Vec<FieldDescriptor> {
//!         vec![FieldDescriptor::new("hits", FieldType::U64)]
//!     }
//!
//!     fn encode(&self, w: &mut RecordWriter<'_>) {
//!         w.write_u64(self.hits);
//!     }
//!
//!     fn decode(r: &mut RecordReader<'_>) -> Result<Self> {
//!         Ok(Self { hits: r.read_u64()? })
//!     }
//! }
//!
//! # fn main() -> Result<()> {
//! let storage = Storage::new(StorageConfig::default());
//! storage.open_in_memory()?;
//! let counter = storage.make_persistent(Counter { hits: 1 })?;
//! storage.set_root(&counter)?;
//! storage.commit()?;
//!
//! let mut root = storage.root::<Counter>()?.expect("root was set");
//! assert_eq!(root.get(&storage)?.hits, 1);
//! storage.close()?;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    fmt,
    io::Write,
    path::Path,
    sync::Arc,
};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};

use crate::{
    allocator::{AllocState, fill_bits},
    cache::{CacheStats, DirtyObject, Object, ObjectCache},
    config::StorageConfig,
    error::{Error, Oid, Result},
    file::{CipherFile, MemoryFile, MultiFile, OsFile, PageFile},
    gc::GcWorker,
    handle::Handle,
    index::DirtyMap,
    layout::{
        BITMAP_ID, BITMAP_PAGE_BITS, BITMAP_PAGES, BITMAP_SEGMENT_SIZE, FIRST_USER_OID,
        FREE_HANDLE_FLAG, HANDLES_PER_PAGE, Header, PAGE_OBJECT_FLAG, PAGE_SIZE, QUANTUM_LOG,
        RootPage, align_to_page,
    },
    listener::StorageListener,
    pool::PagePool,
    schema::{Persistent, RecordReader, SchemaRegistry, TypeDescriptor, TypeKind, TypedCodec},
    stats::{MemoryUsage, StorageStats},
    transaction::{Transaction, TransactionMode, TransactionMonitor},
    btree::{Index, KeyKind},
};

/// Type name reported for type descriptor records.
pub const DESCRIPTOR_TYPE_NAME: &str = "nacre.TypeDescriptor";

/// Collector bookkeeping kept with the core.
#[derive(Debug, Default)]
pub(crate) struct GcState {
    /// Bytes allocated since the last cycle that trigger the next one.
    pub(crate) threshold: Option<u64>,
    pub(crate) allocated_delta: u64,
    /// A background cycle is between its mark and sweep phases.
    pub(crate) active: bool,
}

/// Engine state of an open storage.
pub(crate) struct Core {
    pub(crate) pool: Arc<PagePool>,
    pub(crate) header: Header,
    pub(crate) dirty_pages: DirtyMap,
    pub(crate) alloc: AllocState,
    /// Index entries in use by the open transaction.
    pub(crate) curr_index_size: Oid,
    /// Index entries in use in the committed snapshot.
    pub(crate) committed_index_size: Oid,
    pub(crate) used_size: u64,
    /// The open transaction changed something.
    pub(crate) modified: bool,
    pub(crate) gc: GcState,
    pub(crate) config: StorageConfig,
    pub(crate) schema: SchemaRegistry,
    pub(crate) cache: ObjectCache,
    /// Structural change counters per index, checked by iterators.
    pub(crate) index_mods: HashMap<Oid, u64>,
    /// Bumped by every rollback; invalidates every live iterator.
    pub(crate) epoch: u64,
}

impl Core {
    /// Opens the database held by `file`, initializing an empty one.
    ///
    /// Returns the core and whether a dirty database was rolled back to its
    /// last commit.
    pub(crate) fn open(file: Box<dyn PageFile>, config: StorageConfig) -> Result<(Self, bool)> {
        config.validate()?;
        if config.lock_file {
            file.lock()?;
        }
        let pool = Arc::new(PagePool::new(file, config.page_pool_size, config.read_only));
        let header = Header::read_from(&pool.get(0, Header::SIZE)?)?;
        let mut core = Self {
            pool,
            header,
            dirty_pages: DirtyMap::default(),
            alloc: AllocState::default(),
            curr_index_size: 0,
            committed_index_size: 0,
            used_size: 0,
            modified: false,
            gc: GcState { threshold: config.gc_threshold, ..GcState::default() },
            schema: SchemaRegistry::default(),
            cache: ObjectCache::new(config.object_cache_kind, config.object_cache_init_size),
            index_mods: HashMap::new(),
            epoch: 0,
            config,
        };
        if !core.header.initialized {
            if core.config.read_only {
                return Err(Error::ReadOnly);
            }
            core.initialize()?;
            return Ok((core, false));
        }
        core.attach()?;
        let recovered = core.header.dirty;
        if recovered {
            core.recover()?;
        }
        core.load_schema()?;
        Ok((core, recovered))
    }

    /// Lays out an empty database: header, both index copies and the
    /// bitmap pages describing them.
    fn initialize(&mut self) -> Result<()> {
        let index_size = self.config.object_index_init_size.max(FIRST_USER_OID).next_multiple_of(HANDLES_PER_PAGE);
        let index_bytes = align_to_page(u64::from(index_size) << 3);
        let page = PAGE_SIZE as u64;
        let index = page;
        let shadow_index = index + index_bytes;
        let bitmap_pos = shadow_index + index_bytes;

        // Bitmap pages describe themselves too.
        let mut bitmap_pages = 1u64;
        while bitmap_pos + bitmap_pages * page > bitmap_pages * BITMAP_SEGMENT_SIZE {
            bitmap_pages += 1;
        }
        if bitmap_pages > u64::from(BITMAP_PAGES) {
            return Err(Error::NotEnoughSpace);
        }
        let size = bitmap_pos + bitmap_pages * page;

        let used_bits = size >> QUANTUM_LOG;
        for i in 0..bitmap_pages {
            let mut data = vec![0u8; PAGE_SIZE];
            let first = i * BITMAP_PAGE_BITS;
            if used_bits > first {
                fill_bits(&mut data, 0, (used_bits - first).min(BITMAP_PAGE_BITS), true);
            }
            self.pool.put(bitmap_pos + i * page, &data)?;
        }

        let mut entries = vec![0u8; index_bytes as usize];
        for oid in BITMAP_ID..FIRST_USER_OID {
            let n = u64::from(oid - BITMAP_ID);
            let entry = if n < bitmap_pages { (bitmap_pos + n * page) | PAGE_OBJECT_FLAG } else { FREE_HANDLE_FLAG };
            let at = (oid as usize) << 3;
            LittleEndian::write_u64(&mut entries[at..at + 8], entry);
        }
        self.pool.put(index, &entries)?;
        self.pool.put(shadow_index, &entries)?;

        let root = RootPage {
            size,
            index,
            shadow_index,
            used_size: size,
            index_size,
            shadow_index_size: index_size,
            index_used: FIRST_USER_OID,
            free_list: 0,
            bitmap_end: bitmap_pages as u32,
            root_object: 0,
            type_list: 0,
            bitmap_extent: 0,
        };
        self.header = Header { curr: 0, dirty: false, initialized: false, root: [root, RootPage::mirrored(&root)] };
        self.write_header()?;
        self.pool.flush()?;
        self.header.initialized = true;
        self.write_header()?;
        self.pool.flush()?;
        self.attach()?;
        tracing::info!(index_size, bitmap_pages, size, "initialized new database");
        Ok(())
    }

    /// Loads the volatile counters from the committed root.
    fn attach(&mut self) -> Result<()> {
        let committed = self.header.root[self.header.committed()];
        if committed.index_used > committed.index_size || committed.index_used < FIRST_USER_OID {
            return Err(Error::corrupted(format!(
                "index uses {} of {} entries",
                committed.index_used, committed.index_size
            )));
        }
        self.curr_index_size = committed.index_used;
        self.committed_index_size = committed.index_used;
        self.used_size = committed.used_size;
        Ok(())
    }

    /// Discards whatever a crashed session left in the working generation.
    fn recover(&mut self) -> Result<()> {
        let curr = self.header.committed();
        let w = self.header.working();
        tracing::warn!(curr, "database was not closed cleanly, restoring the last commit");
        let committed = self.header.root[curr];
        self.header.root[w] = RootPage::mirrored(&committed);
        let entries = align_to_page(u64::from(committed.index_used) << 3);
        self.pool.copy(self.header.root[w].index, committed.index, entries)?;
        if !self.config.read_only {
            self.header.dirty = false;
            self.write_header()?;
            self.pool.flush()?;
        }
        tracing::info!(objects = committed.index_used, size = committed.size, "recovery completed");
        Ok(())
    }

    /// Writes back objects registered through `modify_object`.
    pub(crate) fn flush_dirty_objects(&mut self) -> Result<()> {
        let dirty = self.cache.take_dirty();
        if dirty.is_empty() {
            return Ok(());
        }
        let encoding = self.config.string_encoding;
        for (&oid, object) in &dirty {
            let payload = object.codec.encode(object.value.as_ref(), encoding)?;
            self.update_record(oid, object.type_oid, &payload)?;
        }
        tracing::trace!(count = dirty.len(), "stored modified objects");
        Ok(())
    }

    pub(crate) fn commit(&mut self) -> Result<()> {
        self.flush_dirty_objects()?;
        if !self.modified {
            return Ok(());
        }
        self.commit_index()
    }

    pub(crate) fn rollback(&mut self) -> Result<()> {
        self.cache.invalidate();
        if self.modified {
            self.rollback_index()?;
            self.load_schema()?;
        }
        self.epoch += 1;
        Ok(())
    }

    /// Commits, clears the dirty flag and releases the file.
    fn close(&mut self) -> Result<()> {
        if !self.config.read_only {
            self.commit()?;
            if self.header.dirty {
                self.pool.flush()?;
                self.header.dirty = false;
                self.write_header()?;
            }
        }
        self.pool.close()
    }

    pub(crate) fn gc_due(&self) -> bool {
        !self.gc.active && self.gc.threshold.is_some_and(|threshold| self.gc.allocated_delta > threshold)
    }

    /// Descriptor of the record at `oid`; `None` for a type descriptor record.
    pub(crate) fn record_type(&self, oid: Oid) -> Result<Option<Arc<TypeDescriptor>>> {
        let header = self.record_header(self.object_pos(oid)?)?;
        if header.type_oid == 0 {
            return Ok(None);
        }
        self.descriptor(header.type_oid).map(Some)
    }

    /// Fails unless the record at `oid` was stored as a `T`.
    pub(crate) fn check_type<T: Persistent>(&self, oid: Oid) -> Result<Arc<TypeDescriptor>> {
        match self.record_type(oid)? {
            Some(descriptor) if descriptor.name == T::TYPE_NAME => Ok(descriptor),
            other => Err(Error::TypeMismatch {
                oid,
                expected: T::TYPE_NAME.to_owned(),
                found: other.map_or_else(|| DESCRIPTOR_TYPE_NAME.to_owned(), |d| d.name.clone()),
            }),
        }
    }

    /// Stores `value` as a new object.
    pub(crate) fn store_new<T: Persistent>(&mut self, value: &T) -> Result<Oid> {
        let type_oid = self.type_oid_of::<T>()?;
        let payload = TypedCodec::<T>::encode_value(value, self.config.string_encoding)?;
        self.create_record(type_oid, &payload)
    }

    /// Replaces the record of an existing `T`.
    pub(crate) fn store_existing<T: Persistent>(&mut self, oid: Oid, value: &T) -> Result<()> {
        self.check_type::<T>(oid)?;
        let type_oid = self.type_oid_of::<T>()?;
        let payload = TypedCodec::<T>::encode_value(value, self.config.string_encoding)?;
        self.update_record(oid, type_oid, &payload)
    }

    /// Decodes the record of `oid` with the layout it was stored with.
    pub(crate) fn load_typed<T: Persistent>(&self, oid: Oid) -> Result<T> {
        let descriptor = self.check_type::<T>(oid)?;
        let (_, payload) = self.load_record(oid)?;
        let mut reader = RecordReader::new(&payload, &descriptor.fields, self.config.string_encoding);
        T::decode(&mut reader)
    }

    /// Frees an object; B-tree headers take their pages with them.
    ///
    /// Returns the type name of the freed object.
    pub(crate) fn deallocate(&mut self, oid: Oid) -> Result<String> {
        let Some(descriptor) = self.record_type(oid)? else {
            return Err(Error::access(format!("object {oid} is a type descriptor")));
        };
        self.cache.remove(oid);
        if descriptor.kind == TypeKind::BTree {
            self.deallocate_tree(oid)?;
        } else {
            self.deallocate_record(oid)?;
        }
        Ok(descriptor.name.clone())
    }
}

/// Untyped view of a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawObject {
    /// Object id.
    pub oid: Oid,
    /// Registered type name.
    pub type_name: String,
    /// Collector treatment of the type.
    pub kind: TypeKind,
    /// Encoded fields. A record that shrank in place may carry trailing bytes.
    pub payload: Vec<u8>,
    /// Oids the record refers to; for an index, the indexed objects.
    pub references: Vec<Oid>,
}

pub(crate) struct Inner {
    pub(crate) config: StorageConfig,
    pub(crate) core: Mutex<Option<Core>>,
    /// Held by commits and collection cycles.
    pub(crate) gc_monitor: Mutex<()>,
    pub(crate) gc_worker: Mutex<Option<GcWorker>>,
    pub(crate) transactions: TransactionMonitor,
    pub(crate) listener: RwLock<Option<Arc<dyn StorageListener>>>,
}

/// Handle to an object store.
///
/// Clones share the same storage. A storage starts closed; every other call
/// fails with [`Error::StorageNotOpened`] until one of the `open` methods
/// succeeds.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage").field("opened", &self.is_opened()).finish_non_exhaustive()
    }
}

impl Storage {
    /// Creates a closed storage.
    pub fn new(config: StorageConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                core: Mutex::new(None),
                gc_monitor: Mutex::new(()),
                gc_worker: Mutex::new(None),
                transactions: TransactionMonitor::default(),
                listener: RwLock::new(None),
            }),
        }
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Configuration the storage was created with.
    pub fn config(&self) -> &StorageConfig {
        &self.inner.config
    }

    /// Opens a database file, creating it if needed.
    ///
    /// A path starting with `@` names a multi-file description: one segment
    /// per line, `path [size]`, relative to the description's directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageAlreadyOpened`] if the storage is open,
    /// [`Error::StorageIsUsed`] if another process holds the file lock, and
    /// [`Error::DatabaseCorrupted`] for an unreadable header.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<()> {
        if self.is_opened() {
            return Err(Error::StorageAlreadyOpened);
        }
        let path = path.as_ref();
        let config = &self.inner.config;
        let file: Box<dyn PageFile> = match path.to_str().and_then(|p| p.strip_prefix('@')) {
            Some(description) => {
                Box::new(MultiFile::open_description(description, config.read_only, config.no_flush)?)
            },
            None => Box::new(OsFile::open(path, config.read_only, config.no_flush)?),
        };
        self.open_file(file)
    }

    /// Opens a fresh database kept in memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageAlreadyOpened`] if the storage is open.
    pub fn open_in_memory(&self) -> Result<()> {
        self.open_file(Box::new(MemoryFile::new()))
    }

    /// Opens the database held by an arbitrary page file.
    ///
    /// # Errors
    ///
    /// See [`Storage::open`].
    pub fn open_file(&self, file: Box<dyn PageFile>) -> Result<()> {
        let mut guard = self.inner.core.lock();
        if guard.is_some() {
            return Err(Error::StorageAlreadyOpened);
        }
        let file: Box<dyn PageFile> = match &self.inner.config.cipher_key {
            Some(key) => Box::new(CipherFile::new(file, key.as_bytes())?),
            None => file,
        };
        let (core, recovered) = match Core::open(file, self.inner.config.clone()) {
            Ok(opened) => opened,
            Err(e) => {
                drop(guard);
                if matches!(e, Error::DatabaseCorrupted { .. })
                    && let Some(listener) = self.listener()
                {
                    listener.database_corrupted();
                }
                return Err(e);
            },
        };
        tracing::info!(
            objects = core.curr_index_size,
            size = core.header.root[core.header.committed()].size,
            recovered,
            "storage opened"
        );
        *guard = Some(core);
        drop(guard);

        if recovered && let Some(listener) = self.listener() {
            listener.recovery_completed();
        }
        if self.inner.config.background_gc {
            let worker = GcWorker::start(Arc::downgrade(&self.inner))?;
            *self.inner.gc_worker.lock() = Some(worker);
        }
        Ok(())
    }

    /// Whether the storage is open.
    pub fn is_opened(&self) -> bool {
        self.inner.core.lock().is_some()
    }

    /// Commits pending changes, marks the file clean and closes it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageNotOpened`] if the storage is closed.
    pub fn close(&self) -> Result<()> {
        let worker = self.inner.gc_worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        let _gc = self.inner.gc_monitor.lock();
        let mut core = self.inner.core.lock().take().ok_or(Error::StorageNotOpened)?;
        core.close()?;
        tracing::info!("storage closed");
        Ok(())
    }

    /// Runs `f` on the open core.
    pub(crate) fn with_core<R>(&self, f: impl FnOnce(&mut Core) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.core.lock();
        let core = guard.as_mut().ok_or(Error::StorageNotOpened)?;
        f(core)
    }

    pub(crate) fn listener(&self) -> Option<Arc<dyn StorageListener>> {
        self.inner.listener.read().clone()
    }

    /// Installs or removes the event listener.
    pub fn set_listener(&self, listener: Option<Arc<dyn StorageListener>>) {
        *self.inner.listener.write() = listener;
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Makes every change since the last commit durable.
    ///
    /// Objects registered with [`Storage::modify_object`] are stored first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`] if writing or syncing fails; the
    /// previous commit stays authoritative in that case.
    pub fn commit(&self) -> Result<()> {
        {
            let _gc = self.inner.gc_monitor.lock();
            self.with_core(Core::commit)?;
        }
        self.collect_if_due()
    }

    /// Stores buffered objects and commits them as one unit.
    pub(crate) fn commit_pending(&self, pending: Vec<(Oid, DirtyObject)>) -> Result<()> {
        let _gc = self.inner.gc_monitor.lock();
        self.with_core(|core| {
            let encoding = core.config.string_encoding;
            for (oid, object) in pending {
                let payload = object.codec.encode(object.value.as_ref(), encoding)?;
                core.update_record(oid, object.type_oid, &payload)?;
                core.cache.remove(oid);
                core.cache.put(oid, object.value);
            }
            core.commit()
        })
    }

    /// Discards every change since the last commit.
    ///
    /// The object cache is emptied and all index iterators are invalidated.
    /// Handles keep whatever state they hold; call [`Handle::invalidate`]
    /// to reload them.
    pub fn rollback(&self) -> Result<()> {
        self.with_core(Core::rollback)
    }

    /// Starts a transaction in `mode`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageNotOpened`] if the storage is closed.
    pub fn begin_transaction(&self, mode: TransactionMode) -> Result<Transaction> {
        if !self.is_opened() {
            return Err(Error::StorageNotOpened);
        }
        Ok(Transaction::begin(self.clone(), mode))
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Root object of the graph, if one was set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if the root is not a `T`.
    pub fn root<T: Persistent>(&self) -> Result<Option<Handle<T>>> {
        let oid = self.with_core(|core| Ok(core.header.root[core.header.working()].root_object))?;
        if oid == 0 {
            return Ok(None);
        }
        let state = self.load_object::<T>(oid)?;
        Ok(Some(Handle::loaded(oid, state)))
    }

    /// Makes `handle` the root of the graph.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeletedObject`] or [`Error::InvalidOid`] if the handle
    /// does not name a live object.
    pub fn set_root<T>(&self, handle: &Handle<T>) -> Result<()> {
        let oid = handle.oid();
        self.with_core(|core| {
            core.object_pos(oid)?;
            core.begin_write()?;
            let w = core.header.working();
            core.header.root[w].root_object = oid;
            Ok(())
        })
    }

    /// Stores `value` as a new object.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] on a read-only storage and
    /// [`Error::NotEnoughSpace`] if the index or bitmap cannot grow.
    pub fn make_persistent<T: Persistent>(&self, value: T) -> Result<Handle<T>> {
        let handle = self.with_core(|core| {
            let oid = core.store_new(&value)?;
            let state = Arc::new(value);
            core.cache.put(oid, Arc::clone(&state) as Object);
            Ok(Handle::loaded(oid, state))
        })?;
        self.collect_if_due()?;
        Ok(handle)
    }

    /// Replaces the stored state of `handle` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if the object is not a `T`.
    pub fn store_object<T: Persistent>(&self, handle: &mut Handle<T>, value: T) -> Result<()> {
        let oid = handle.oid();
        let state = Arc::new(value);
        self.with_core(|core| {
            core.store_existing(oid, state.as_ref())?;
            core.cache.remove(oid);
            core.cache.put(oid, Arc::clone(&state) as Object);
            Ok(())
        })?;
        handle.set_state(state);
        self.collect_if_due()
    }

    /// Replaces the state of `handle` in memory; it is stored at the next
    /// commit, collection or backup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if the object is not a `T`.
    pub fn modify_object<T: Persistent>(&self, handle: &mut Handle<T>, value: T) -> Result<()> {
        let oid = handle.oid();
        let state = Arc::new(value);
        self.with_core(|core| {
            core.check_type::<T>(oid)?;
            core.begin_write()?;
            let type_oid = core.type_oid_of::<T>()?;
            core.cache.mark_dirty(oid, DirtyObject {
                value: Arc::clone(&state) as Object,
                codec: Arc::new(TypedCodec::<T>::new()),
                type_oid,
            });
            Ok(())
        })?;
        handle.set_state(state);
        Ok(())
    }

    /// Loads object `oid` as a `T`, going through the object cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeletedObject`] for a freed oid and
    /// [`Error::TypeMismatch`] if the record belongs to another type.
    pub fn load_object<T: Persistent>(&self, oid: Oid) -> Result<Arc<T>> {
        self.with_core(|core| {
            if let Some(object) = core.cache.get(oid) {
                return object.downcast::<T>().map_err(|_| match core.check_type::<T>(oid) {
                    Ok(_) => Error::access(format!("cached object {oid} is not a {}", T::TYPE_NAME)),
                    Err(e) => e,
                });
            }
            let state = Arc::new(core.load_typed::<T>(oid)?);
            core.cache.put(oid, Arc::clone(&state) as Object);
            Ok(state)
        })
    }

    /// Frees object `oid`. Freeing an index also frees its pages.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeletedObject`] if the object is already gone.
    pub fn deallocate_object(&self, oid: Oid) -> Result<()> {
        self.with_core(|core| core.deallocate(oid).map(|_| ()))
    }

    /// Untyped view of object `oid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeletedObject`] or [`Error::InvalidOid`] if the oid
    /// does not name a live record.
    pub fn object_by_oid(&self, oid: Oid) -> Result<RawObject> {
        self.with_core(|core| {
            let (_, payload) = core.load_record(oid)?;
            let Some(descriptor) = core.record_type(oid)? else {
                return Ok(RawObject {
                    oid,
                    type_name: DESCRIPTOR_TYPE_NAME.to_owned(),
                    kind: TypeKind::Plain,
                    payload,
                    references: Vec::new(),
                });
            };
            let references = match descriptor.kind {
                TypeKind::BTree => core.tree_references(oid)?,
                TypeKind::Plain => {
                    let mut refs = Vec::new();
                    descriptor.scan_references(&payload, &mut |r| refs.push(r))?;
                    refs
                },
            };
            Ok(RawObject { oid, type_name: descriptor.name.clone(), kind: descriptor.kind, payload, references })
        })
    }

    // ------------------------------------------------------------------
    // Indices
    // ------------------------------------------------------------------

    /// Creates an empty index over keys of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReadOnly`] on a read-only storage.
    pub fn create_index(&self, kind: KeyKind, unique: bool) -> Result<Index> {
        let oid = self.with_core(|core| core.create_tree(kind, unique))?;
        Ok(Index::new(self.clone(), oid))
    }

    /// Reopens the index stored at `oid`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if `oid` is not an index.
    pub fn open_index(&self, oid: Oid) -> Result<Index> {
        self.with_core(|core| core.load_tree(oid).map(|_| ()))?;
        Ok(Index::new(self.clone(), oid))
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Writes a compacted image of the current state to `out`.
    ///
    /// Pending modifications are stored first. The image opens as a clean
    /// database with the same objects under the same oids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`] if writing to `out` fails.
    pub fn backup<W: Write>(&self, out: &mut W) -> Result<()> {
        let _gc = self.inner.gc_monitor.lock();
        self.with_core(|core| {
            core.flush_dirty_objects()?;
            crate::backup::write_image(core, out)
        })
    }

    /// Frees every object unreachable from the root.
    ///
    /// Objects created or changed since the last commit are kept. With
    /// background collection enabled this only wakes the collector thread
    /// and returns 0.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseCorrupted`] if the object graph is unreadable.
    pub fn gc(&self) -> Result<usize> {
        if let Some(worker) = self.inner.gc_worker.lock().as_ref() {
            worker.request();
            return Ok(0);
        }
        let listener = self.listener();
        if let Some(listener) = &listener {
            listener.gc_started();
        }
        let freed = {
            let _gc = self.inner.gc_monitor.lock();
            self.with_core(crate::gc::collect)?
        };
        if let Some(listener) = &listener {
            for (type_name, oid) in &freed {
                listener.deallocate_object(type_name, *oid);
            }
            listener.gc_completed(freed.len());
        }
        Ok(freed.len())
    }

    /// Runs a collection if the allocation threshold was crossed.
    pub(crate) fn collect_if_due(&self) -> Result<()> {
        if self.with_core(|core| Ok(core.gc_due()))? {
            self.gc()?;
        }
        Ok(())
    }

    /// Sets the number of allocated bytes that triggers a collection.
    /// `None` disables implicit collection.
    pub fn set_gc_threshold(&self, threshold: Option<u64>) -> Result<()> {
        self.with_core(|core| {
            core.gc.threshold = threshold;
            Ok(())
        })
    }

    /// Bytes allocated in the current state.
    pub fn used_size(&self) -> Result<u64> {
        self.with_core(|core| Ok(core.used_size))
    }

    /// Logical size of the database file.
    pub fn database_size(&self) -> Result<u64> {
        self.with_core(|core| Ok(core.header.root[core.header.working()].size))
    }

    /// Per-type usage of the objects reachable from the root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DatabaseCorrupted`] if the object graph is unreadable.
    pub fn memory_usage(&self) -> Result<MemoryUsage> {
        let _gc = self.inner.gc_monitor.lock();
        self.with_core(|core| {
            core.flush_dirty_objects()?;
            crate::gc::memory_usage(core)
        })
    }

    /// Object cache counters.
    pub fn cache_stats(&self) -> Result<CacheStats> {
        self.with_core(|core| Ok(core.cache.stats()))
    }

    /// Space, index and cache counters.
    pub fn stats(&self) -> Result<StorageStats> {
        self.with_core(|core| {
            Ok(StorageStats {
                used_size: core.used_size,
                database_size: core.header.root[core.header.working()].size,
                index_used: core.curr_index_size,
                dirty_index_pages: core.dirty_pages.count(),
                pool: core.pool.stats(),
                cache: core.cache.stats(),
            })
        })
    }
}

/// Opens an empty in-memory core for unit tests.
#[cfg(test)]
#[allow(clippy::expect_used)]
pub(crate) fn test_core() -> Core {
    Core::open(Box::new(MemoryFile::new()), StorageConfig::default())
        .map(|(core, _)| core)
        .expect("in-memory core opens")
}
