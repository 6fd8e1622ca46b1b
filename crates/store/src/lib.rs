//! nacre-store: an embedded, single-file object store.
//!
//! Objects are records addressed by a stable oid. An object index maps each
//! oid to a file position and is kept in two generations, so a commit is a
//! single root flip and a crash at any point leaves the last commit intact:
//!
//! - **Shadow paging**: the working index and bitmap pages are written
//!   copy-on-write and published by flipping the header selector
//! - **Bitmap allocation**: one bit per 32-byte quantum, with a hole-search
//!   cursor
//! - **Typed B-tree indices**: 17 key kinds over 4 KiB pages
//! - **Mark-sweep GC**: foreground or on a background thread
//! - **Transactions**: exclusive, cooperative (batched commits) and
//!   serializable (buffered stores)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Storage / Transaction           │
//! │  (objects, indices, commit, gc, backup)     │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │        Schema registry / object cache        │
//! │    (codecs, type descriptors, handles)      │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │      Object index / allocator / B-tree       │
//! │  (two generations, bitmap, tree pages)      │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │                 Page pool                    │
//! │        (LRU pages, dirty write-back)        │
//! └────────────────┬────────────────────────────┘
//!                  │
//! ┌────────────────▼────────────────────────────┐
//! │                 Page file                    │
//! │   (OsFile / MemoryFile / MultiFile / ...)   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```
//! use nacre_store::{KeyKind, Storage, StorageConfig};
//!
//! let storage = Storage::new(StorageConfig::default());
//! storage.open_in_memory()?;
//!
//! let index = storage.create_index(KeyKind::Str, true)?;
//! index.insert("answer", index.oid())?;
//! storage.commit()?;
//!
//! assert_eq!(index.get("answer")?, Some(index.oid()));
//! storage.close()?;
//! # Ok::<(), nacre_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
// Page and index arithmetic converts between u32 oids, u64 offsets and usize lengths.
#![allow(clippy::cast_possible_truncation)]
#![cfg_attr(test, allow(clippy::field_reassign_with_default))]

mod allocator;
mod backup;
pub mod btree;
mod cache;
mod config;
mod error;
pub mod file;
mod gc;
mod handle;
mod index;
pub mod layout;
mod listener;
mod pool;
mod schema;
mod stats;
mod storage;
mod transaction;

pub use btree::{Bound, Index, IndexIter, Key, KeyKind, MAX_KEY_SIZE, Order};
pub use cache::CacheStats;
pub use config::{CacheKind, ConfigError, StorageConfig, StringEncoding};
pub use error::{Error, Oid, Result};
pub use file::{CipherFile, MemoryFile, MultiFile, OsFile, PageFile, Segment};
pub use handle::Handle;
pub use listener::StorageListener;
pub use pool::{PagePool, PageRef, PoolStats};
pub use schema::{
    Codec, FieldDescriptor, FieldType, Persistent, RecordReader, RecordWriter, Scalar,
    TypeDescriptor, TypeKind, TypedCodec,
};
pub use stats::{MemoryUsage, StorageStats, TypeMemoryUsage};
pub use storage::{DESCRIPTOR_TYPE_NAME, RawObject, Storage};
pub use transaction::{Transaction, TransactionMode};

/// On-disk format version.
pub const VERSION: u16 = 1;
