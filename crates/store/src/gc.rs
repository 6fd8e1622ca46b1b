//! Mark-and-sweep garbage collection.
//!
//! Marking follows references from the root object. Mark bits are kept per
//! record position, one bit per allocation quantum, so the same marker can
//! trace the committed generation first and the working one afterwards:
//! records unchanged by the open transaction sit at the same position in
//! both.
//!
//! The sweep only frees records that the open transaction has not touched
//! (their working entry still equals the committed one). Records created or
//! changed since the last commit survive the cycle, and everything they
//! reference is traced as well, so a surviving record never points at a
//! freed one.
//!
//! A background cycle marks the committed generation without holding the
//! core lock; commits wait on the collector monitor meanwhile. It then takes
//! the core lock, traces what the open transaction changed and sweeps.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    thread::JoinHandle,
    time::Instant,
};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Condvar, Mutex};

use crate::{
    btree::{KeyKind, PageReader, TreeHeader, walk_pages},
    config::StringEncoding,
    error::{Error, Oid, Result},
    index::entry_pos,
    layout::{
        FIRST_USER_OID, FREE_HANDLE_FLAG, MODIFIED_FLAG, ObjectHeader, PAGE_OBJECT_FLAG, PAGE_SIZE,
        QUANTUM_LOG, align_to_quantum,
    },
    pool::PagePool,
    schema::{TypeDescriptor, TypeKind, TypedCodec},
    stats::{BTREE_PAGE_TYPE, MemoryUsage},
    storage::{Core, Inner, Storage},
};

/// Read-only view of one generation of the object index.
struct Generation {
    pool: Arc<PagePool>,
    index: u64,
    size: Oid,
}

impl Generation {
    fn of(core: &Core, generation: usize, size: Oid) -> Self {
        Self { pool: Arc::clone(&core.pool), index: core.header.root[generation].index, size }
    }

    /// Entry of `oid`; 0 for oids outside the generation.
    fn entry(&self, oid: Oid) -> Result<u64> {
        if oid == 0 || oid >= self.size {
            return Ok(0);
        }
        let raw = self.pool.get(self.index + (u64::from(oid) << 3), 8)?;
        Ok(LittleEndian::read_u64(&raw))
    }

    /// Position of the record of `oid`, if it is one.
    fn record_pos(&self, oid: Oid) -> Result<Option<u64>> {
        let entry = self.entry(oid)?;
        if entry & (FREE_HANDLE_FLAG | PAGE_OBJECT_FLAG) != 0 || entry_pos(entry) == 0 {
            return Ok(None);
        }
        Ok(Some(entry_pos(entry)))
    }

    fn record(&self, pos: u64) -> Result<(ObjectHeader, Vec<u8>)> {
        let header = ObjectHeader::read(&self.pool.get(pos, ObjectHeader::SIZE)?);
        if (header.size as usize) < ObjectHeader::SIZE {
            return Err(Error::corrupted(format!("record at {pos} has size {}", header.size)));
        }
        let payload = self.pool.get(pos + ObjectHeader::SIZE as u64, header.size as usize - ObjectHeader::SIZE)?;
        Ok((header, payload))
    }
}

impl PageReader for Generation {
    fn read_page(&self, page: Oid) -> Result<Vec<u8>> {
        let entry = self.entry(page)?;
        if entry & PAGE_OBJECT_FLAG == 0 {
            return Err(Error::corrupted(format!("tree page {page} is not a page object")));
        }
        self.pool.get(entry_pos(entry), PAGE_SIZE)
    }
}

#[derive(Default)]
struct Marker {
    /// One bit per quantum position of a marked record.
    black: Vec<u64>,
    pending: Vec<Oid>,
    descriptors: HashMap<Oid, Arc<TypeDescriptor>>,
    usage: Option<MemoryUsage>,
}

impl Marker {
    fn is_marked(&self, pos: u64) -> bool {
        let bit = pos >> QUANTUM_LOG;
        self.black.get((bit / 64) as usize).is_some_and(|word| word & (1 << (bit % 64)) != 0)
    }

    /// Sets the mark of `pos`; false if it was already set.
    fn mark(&mut self, pos: u64) -> bool {
        let bit = pos >> QUANTUM_LOG;
        let word = (bit / 64) as usize;
        if word >= self.black.len() {
            self.black.resize(word + 1, 0);
        }
        let mask = 1 << (bit % 64);
        let fresh = self.black[word] & mask == 0;
        self.black[word] |= mask;
        fresh
    }

    fn push(&mut self, generation: &Generation, oid: Oid) -> Result<()> {
        if let Some(pos) = generation.record_pos(oid)?
            && self.mark(pos)
        {
            self.pending.push(oid);
        }
        Ok(())
    }

    /// Marks everything reachable from `root`.
    fn trace(&mut self, generation: &Generation, root: Oid) -> Result<()> {
        self.push(generation, root)?;
        self.drain(generation)
    }

    /// Traces from every record the open transaction created or changed.
    fn trace_modified(&mut self, generation: &Generation) -> Result<()> {
        for oid in FIRST_USER_OID..generation.size {
            let entry = generation.entry(oid)?;
            if entry & MODIFIED_FLAG != 0 && entry & (FREE_HANDLE_FLAG | PAGE_OBJECT_FLAG) == 0 {
                self.push(generation, oid)?;
            }
        }
        self.drain(generation)
    }

    fn descriptor(&mut self, generation: &Generation, type_oid: Oid) -> Result<Arc<TypeDescriptor>> {
        if let Some(descriptor) = self.descriptors.get(&type_oid) {
            return Ok(Arc::clone(descriptor));
        }
        let pos = generation
            .record_pos(type_oid)?
            .ok_or_else(|| Error::corrupted(format!("type descriptor {type_oid} is missing")))?;
        let (header, payload) = generation.record(pos)?;
        if header.type_oid != 0 {
            return Err(Error::corrupted(format!("object {type_oid} is not a type descriptor")));
        }
        let descriptor = Arc::new(TypeDescriptor::decode(&payload)?);
        self.descriptors.insert(type_oid, Arc::clone(&descriptor));
        Ok(descriptor)
    }

    fn drain(&mut self, generation: &Generation) -> Result<()> {
        while let Some(oid) = self.pending.pop() {
            let Some(pos) = generation.record_pos(oid)? else { continue };
            let (header, payload) = generation.record(pos)?;
            if header.type_oid == 0 {
                continue;
            }
            let descriptor = self.descriptor(generation, header.type_oid)?;
            if let Some(usage) = &mut self.usage {
                let size = u64::from(header.size);
                usage.by_type.entry(descriptor.name.clone()).or_default().add(size, align_to_quantum(size));
            }
            let mut found = Vec::new();
            match descriptor.kind {
                TypeKind::BTree => self.scan_tree(generation, &payload, &mut found)?,
                TypeKind::Plain if descriptor.has_references() => {
                    descriptor.scan_references(&payload, &mut |r| found.push(r))?;
                },
                TypeKind::Plain => {},
            }
            for r in found {
                self.push(generation, r)?;
            }
        }
        Ok(())
    }

    fn scan_tree(&mut self, generation: &Generation, payload: &[u8], found: &mut Vec<Oid>) -> Result<()> {
        let tree = TypedCodec::<TreeHeader>::decode_value(payload, StringEncoding::default())?;
        if tree.root == 0 {
            return Ok(());
        }
        let usage = &mut self.usage;
        walk_pages(generation, tree.kind, tree.root, tree.height, &mut |_, level, view| {
            if let Some(usage) = usage.as_mut() {
                usage.by_type.entry(BTREE_PAGE_TYPE.to_owned()).or_default().add(PAGE_SIZE as u64, PAGE_SIZE as u64);
            }
            if level == 1 {
                for i in 0..view.len() {
                    found.push(view.reference(i));
                    if tree.kind == KeyKind::Object {
                        found.push(LittleEndian::read_u32(view.key(i)));
                    }
                }
            }
            Ok(())
        })
    }
}

/// Frees committed records that were not marked and that the open
/// transaction left alone. Returns `(type name, oid)` of every freed object.
fn sweep(core: &mut Core, marker: &Marker) -> Result<Vec<(String, Oid)>> {
    let curr = core.header.committed();
    let mut freed = Vec::new();
    for oid in FIRST_USER_OID..core.committed_index_size {
        let committed = core.index_entry(curr, oid)?;
        if committed & (FREE_HANDLE_FLAG | PAGE_OBJECT_FLAG) != 0 || entry_pos(committed) == 0 {
            continue;
        }
        let pos = entry_pos(committed);
        if marker.is_marked(pos) || core.index_entry(core.header.working(), oid)? != committed {
            continue;
        }
        if core.record_header(pos)?.type_oid == 0 {
            continue;
        }
        let type_name = core.deallocate(oid)?;
        freed.push((type_name, oid));
    }
    Ok(freed)
}

/// Runs a full cycle on the working generation.
pub(crate) fn collect(core: &mut Core) -> Result<Vec<(String, Oid)>> {
    let started = Instant::now();
    core.flush_dirty_objects()?;
    let w = core.header.working();
    let working = Generation::of(core, w, core.curr_index_size);
    let mut marker = Marker::default();
    marker.trace(&working, core.header.root[w].root_object)?;
    marker.trace_modified(&working)?;
    let freed = sweep(core, &marker)?;
    core.gc.allocated_delta = 0;
    tracing::info!(
        freed = freed.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "garbage collection completed"
    );
    Ok(freed)
}

/// Per-type usage of everything reachable from the working root.
pub(crate) fn memory_usage(core: &Core) -> Result<MemoryUsage> {
    let w = core.header.working();
    let working = Generation::of(core, w, core.curr_index_size);
    let mut marker = Marker { usage: Some(MemoryUsage::default()), ..Marker::default() };
    marker.trace(&working, core.header.root[w].root_object)?;
    Ok(marker.usage.take().unwrap_or_default())
}

/// Background cycle: mark the committed generation concurrently, then
/// finish under the core lock.
fn collect_in_background(inner: &Inner) -> Result<Vec<(String, Oid)>> {
    let started = Instant::now();
    let _gc = inner.gc_monitor.lock();
    let (committed, root) = {
        let mut guard = inner.core.lock();
        let Some(core) = guard.as_mut() else { return Ok(Vec::new()) };
        core.gc.active = true;
        let curr = core.header.committed();
        (Generation::of(core, curr, core.committed_index_size), core.header.root[curr].root_object)
    };
    let mut marker = Marker::default();
    let marked = marker.trace(&committed, root);

    let mut guard = inner.core.lock();
    let Some(core) = guard.as_mut() else { return Ok(Vec::new()) };
    let result = marked.and_then(|()| {
        core.flush_dirty_objects()?;
        let w = core.header.working();
        let working = Generation::of(core, w, core.curr_index_size);
        marker.trace(&working, core.header.root[w].root_object)?;
        marker.trace_modified(&working)?;
        sweep(core, &marker)
    });
    core.gc.active = false;
    core.gc.allocated_delta = 0;
    if let Ok(freed) = &result {
        tracing::info!(
            freed = freed.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "background garbage collection completed"
        );
    }
    result
}

#[derive(Default)]
struct SignalState {
    requested: bool,
    stop: bool,
}

#[derive(Default)]
struct Signal {
    state: Mutex<SignalState>,
    wake: Condvar,
}

impl Signal {
    fn shutdown(&self) {
        self.state.lock().stop = true;
        self.wake.notify_all();
    }
}

/// Collector thread of a storage opened with background collection.
pub(crate) struct GcWorker {
    signal: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl GcWorker {
    pub(crate) fn start(inner: Weak<Inner>) -> Result<Self> {
        let signal = Arc::new(Signal::default());
        let thread = std::thread::Builder::new().name("nacre-gc".to_owned()).spawn({
            let signal = Arc::clone(&signal);
            move || run_worker(&inner, &signal)
        })?;
        Ok(Self { signal, thread: Some(thread) })
    }

    /// Asks for a cycle; requests made while one is pending coalesce.
    pub(crate) fn request(&self) {
        self.signal.state.lock().requested = true;
        self.signal.wake.notify_all();
    }

    /// Stops the thread and waits for the current cycle to finish.
    pub(crate) fn stop(mut self) {
        self.signal.shutdown();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("collector thread panicked");
        }
    }
}

impl Drop for GcWorker {
    fn drop(&mut self) {
        self.signal.shutdown();
    }
}

fn run_worker(inner: &Weak<Inner>, signal: &Signal) {
    loop {
        {
            let mut state = signal.state.lock();
            while !state.requested && !state.stop {
                signal.wake.wait(&mut state);
            }
            if state.stop {
                return;
            }
            state.requested = false;
        }
        let Some(inner) = inner.upgrade() else { return };
        let storage = Storage::from_inner(inner);
        let listener = storage.listener();
        if let Some(listener) = &listener {
            listener.gc_started();
        }
        match collect_in_background(storage.inner()) {
            Ok(freed) => {
                if let Some(listener) = &listener {
                    for (type_name, oid) in &freed {
                        listener.deallocate_object(type_name, *oid);
                    }
                    listener.gc_completed(freed.len());
                }
            },
            Err(e) => tracing::warn!(error = %e, "background garbage collection failed"),
        }
    }
}
