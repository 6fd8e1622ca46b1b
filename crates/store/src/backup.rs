//! Compacted database images.
//!
//! An image is a fresh, clean database file holding the working state:
//!
//! ```text
//! page 0        header (curr 0, clean, initialized)
//! index         compacted object index
//! shadow index  identical copy
//! bitmap        regenerated allocation bitmap
//! pages         page objects in oid order
//! records       records in their old file order, quantum aligned
//! padding       up to the next page boundary
//! ```
//!
//! Oids are kept, so references inside records stay valid. Free-list
//! entries are copied as they are; oids of a bitmap extent become unlinked
//! free handles.

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    allocator::fill_bits,
    error::{Error, Oid, Result},
    index::entry_pos,
    layout::{
        BITMAP_ID, BITMAP_PAGE_BITS, BITMAP_PAGES, BITMAP_SEGMENT_SIZE, FIRST_USER_OID,
        FREE_HANDLE_FLAG, HANDLES_PER_PAGE, Header, MODIFIED_FLAG, PAGE_OBJECT_FLAG, PAGE_SIZE,
        QUANTUM_LOG, RootPage, align_to_page, align_to_quantum,
    },
    storage::Core,
};

enum Slot {
    Keep(u64),
    Page(u64),
    Record { pos: u64, size: u64 },
}

/// Writes an image of `core`'s working generation to `out`.
pub(crate) fn write_image<W: Write>(core: &Core, out: &mut W) -> Result<()> {
    let w = core.header.working();
    let working = core.header.root[w];
    let used = core.curr_index_size;
    let extent = (working.bitmap_extent != 0)
        .then(|| working.bitmap_extent + BITMAP_PAGES..working.bitmap_extent + working.bitmap_end.max(BITMAP_PAGES));

    // Classify every user entry.
    let mut slots = Vec::with_capacity((used - FIRST_USER_OID) as usize);
    for oid in FIRST_USER_OID..used {
        let entry = core.index_entry(w, oid)?;
        let slot = if extent.as_ref().is_some_and(|e| e.contains(&oid)) {
            Slot::Keep(FREE_HANDLE_FLAG)
        } else if entry & FREE_HANDLE_FLAG != 0 || entry_pos(entry) == 0 {
            Slot::Keep(entry & !MODIFIED_FLAG)
        } else if entry & PAGE_OBJECT_FLAG != 0 {
            Slot::Page(entry_pos(entry))
        } else {
            let pos = entry_pos(entry);
            Slot::Record { pos, size: u64::from(core.record_header(pos)?.size) }
        };
        slots.push((oid, slot));
    }

    let page = PAGE_SIZE as u64;
    let index_size = used.max(FIRST_USER_OID).next_multiple_of(HANDLES_PER_PAGE);
    let index_bytes = align_to_page(u64::from(index_size) << 3);
    let index = page;
    let shadow_index = index + index_bytes;
    let bitmap_pos = shadow_index + index_bytes;

    let n_pages = slots.iter().filter(|(_, s)| matches!(s, Slot::Page(_))).count() as u64;
    let records_bytes: u64 = slots
        .iter()
        .map(|(_, s)| match s {
            Slot::Record { size, .. } => align_to_quantum(*size),
            _ => 0,
        })
        .sum();

    // Bitmap pages describe themselves too.
    let mut bitmap_pages = 1u64;
    let data_end = loop {
        let end = bitmap_pos + (bitmap_pages + n_pages) * page + records_bytes;
        let needed = align_to_page(end).div_ceil(BITMAP_SEGMENT_SIZE);
        if needed <= bitmap_pages {
            break end;
        }
        bitmap_pages = needed;
    };
    if bitmap_pages > u64::from(BITMAP_PAGES) {
        return Err(Error::NotEnoughSpace);
    }
    let size = align_to_page(data_end);

    // New positions: pages first, then records in their old order.
    let mut entries = vec![0u8; index_bytes as usize];
    let mut put_entry = |oid: Oid, entry: u64| {
        let at = (oid as usize) << 3;
        LittleEndian::write_u64(&mut entries[at..at + 8], entry);
    };
    for oid in BITMAP_ID..FIRST_USER_OID {
        let n = u64::from(oid - BITMAP_ID);
        put_entry(oid, if n < bitmap_pages { (bitmap_pos + n * page) | PAGE_OBJECT_FLAG } else { FREE_HANDLE_FLAG });
    }
    let mut next = bitmap_pos + bitmap_pages * page;
    let mut pages = Vec::with_capacity(n_pages as usize);
    let mut records = Vec::new();
    for (oid, slot) in &slots {
        match *slot {
            Slot::Keep(entry) => put_entry(*oid, entry),
            Slot::Page(old) => {
                put_entry(*oid, next | PAGE_OBJECT_FLAG);
                pages.push(old);
                next += page;
            },
            Slot::Record { pos, size } => records.push((pos, size, *oid)),
        }
    }
    records.sort_unstable_by_key(|&(pos, ..)| pos);
    for &(_, size, oid) in &records {
        put_entry(oid, next);
        next += align_to_quantum(size);
    }

    let root = RootPage {
        size,
        index,
        shadow_index,
        used_size: data_end,
        index_size,
        shadow_index_size: index_size,
        index_used: used,
        free_list: working.free_list,
        bitmap_end: bitmap_pages as u32,
        root_object: working.root_object,
        type_list: working.type_list,
        bitmap_extent: 0,
    };
    let header = Header { curr: 0, dirty: false, initialized: true, root: [root, RootPage::mirrored(&root)] };

    let mut header_page = vec![0u8; PAGE_SIZE];
    header.write_to(&mut header_page);
    out.write_all(&header_page)?;
    out.write_all(&entries)?;
    out.write_all(&entries)?;

    let used_bits = data_end >> QUANTUM_LOG;
    for i in 0..bitmap_pages {
        let mut bitmap = vec![0u8; PAGE_SIZE];
        let first = i * BITMAP_PAGE_BITS;
        if used_bits > first {
            fill_bits(&mut bitmap, 0, (used_bits - first).min(BITMAP_PAGE_BITS), true);
        }
        out.write_all(&bitmap)?;
    }
    for old in pages {
        out.write_all(&core.pool.get(old, PAGE_SIZE)?)?;
    }
    let padding = [0u8; 1 << QUANTUM_LOG];
    for (pos, size, _) in records {
        out.write_all(&core.pool.get(pos, size as usize)?)?;
        out.write_all(&padding[..(align_to_quantum(size) - size) as usize])?;
    }
    out.write_all(&vec![0u8; (size - data_end) as usize])?;
    out.flush()?;

    tracing::info!(size, objects = used - FIRST_USER_OID, "backup written");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::{
        btree::KeyKind,
        config::StorageConfig,
        file::MemoryFile,
        schema::{FieldDescriptor, FieldType, Persistent, RecordReader, RecordWriter},
        storage::Storage,
    };

    #[derive(Debug, Clone, PartialEq)]
    struct Entry {
        name: String,
        next: Oid,
    }

    impl Persistent for Entry {
        const TYPE_NAME: &'static str = "test.Entry";

        fn fields() -> Vec<FieldDescriptor> {
            vec![FieldDescriptor::new("name", FieldType::String), FieldDescriptor::new("next", FieldType::Reference)]
        }

        fn encode(&self, w: &mut RecordWriter<'_>) {
            w.write_string(Some(&self.name));
            w.write_oid(self.next);
        }

        fn decode(r: &mut RecordReader<'_>) -> Result<Self> {
            Ok(Self { name: r.read_string()?.unwrap_or_default(), next: r.read_oid()? })
        }
    }

    fn storage() -> Storage {
        let storage = Storage::new(StorageConfig::default());
        storage.open_in_memory().unwrap();
        storage
    }

    fn restore(image: Vec<u8>) -> Storage {
        let storage = Storage::new(StorageConfig::default());
        storage.open_file(Box::new(MemoryFile::from_bytes(image))).unwrap();
        storage
    }

    #[test]
    fn test_image_reopens_with_same_objects() {
        let storage = storage();
        let mut chain = Vec::new();
        let mut next = 0;
        for i in 0..100 {
            let entry = storage.make_persistent(Entry { name: format!("entry {i}"), next }).unwrap();
            next = entry.oid();
            chain.push(entry.oid());
        }
        let index = storage.create_index(KeyKind::Str, true).unwrap();
        for (i, oid) in chain.iter().enumerate() {
            index.insert(format!("key {i:03}"), *oid).unwrap();
        }
        let head = storage.make_persistent(Entry { name: "head".to_owned(), next: index.oid() }).unwrap();
        storage.set_root(&head).unwrap();
        storage.commit().unwrap();

        let mut image = Vec::new();
        storage.backup(&mut image).unwrap();
        assert_eq!(image.len() % PAGE_SIZE, 0);

        let restored = restore(image);
        let root = restored.root::<Entry>().unwrap().unwrap();
        assert_eq!(root.oid(), head.oid());
        let index = restored.open_index(index.oid()).unwrap();
        index.verify().unwrap();
        assert_eq!(index.len().unwrap(), 100);
        for (i, oid) in chain.iter().enumerate() {
            assert_eq!(index.get(format!("key {i:03}")).unwrap(), Some(*oid));
            assert_eq!(restored.load_object::<Entry>(*oid).unwrap().name, format!("entry {i}"));
        }
    }

    #[test]
    fn test_image_includes_uncommitted_state() {
        let storage = storage();
        let entry = storage.make_persistent(Entry { name: "fresh".to_owned(), next: 0 }).unwrap();
        storage.set_root(&entry).unwrap();

        let mut image = Vec::new();
        storage.backup(&mut image).unwrap();
        let restored = restore(image);
        assert_eq!(restored.root::<Entry>().unwrap().unwrap().oid(), entry.oid());
        assert_eq!(restored.load_object::<Entry>(entry.oid()).unwrap().name, "fresh");
    }

    #[test]
    fn test_image_is_compacted() {
        let storage = storage();
        let keep = storage.make_persistent(Entry { name: "keep".to_owned(), next: 0 }).unwrap();
        storage.set_root(&keep).unwrap();
        let mut garbage = Vec::new();
        for i in 0..500 {
            garbage.push(storage.make_persistent(Entry { name: format!("garbage {i:0>200}"), next: 0 }).unwrap());
        }
        storage.commit().unwrap();
        for handle in &garbage {
            storage.deallocate_object(handle.oid()).unwrap();
        }
        storage.commit().unwrap();
        let before = storage.database_size().unwrap();

        let mut image = Vec::new();
        storage.backup(&mut image).unwrap();
        assert!((image.len() as u64) < before);

        let restored = restore(image);
        assert!(matches!(restored.load_object::<Entry>(garbage[0].oid()), Err(Error::DeletedObject { .. })));
        // Freed oids stay on the free list and are handed out again.
        let reused = restored.make_persistent(Entry { name: "new".to_owned(), next: 0 }).unwrap();
        assert!(garbage.iter().any(|h| h.oid() == reused.oid()));
    }

    #[test]
    fn test_image_allocates_after_restore() {
        let storage = storage();
        let root = storage.make_persistent(Entry { name: "root".to_owned(), next: 0 }).unwrap();
        storage.set_root(&root).unwrap();
        storage.commit().unwrap();
        let mut image = Vec::new();
        storage.backup(&mut image).unwrap();

        let restored = restore(image);
        let mut added = Vec::new();
        for i in 0..200 {
            added.push(restored.make_persistent(Entry { name: format!("added {i}"), next: root.oid() }).unwrap());
        }
        restored.commit().unwrap();
        assert_eq!(restored.load_object::<Entry>(root.oid()).unwrap().name, "root");
        for (i, handle) in added.iter().enumerate() {
            assert_eq!(restored.load_object::<Entry>(handle.oid()).unwrap().name, format!("added {i}"));
        }
    }
}
