//! Page file abstraction.
//!
//! A [`PageFile`] is a seekable byte store addressed by absolute offsets.
//! The page pool is its only client inside the engine, so every variant only
//! has to honour positional reads and writes plus `sync`.
//!
//! Variants:
//! - [`OsFile`]: a single OS file using positional I/O.
//! - [`MultiFile`]: a logical address space split across segment files.
//! - [`MemoryFile`]: a growable in-memory buffer, shareable between opens.
//! - [`CipherFile`]: a byte filter encrypting every page of an inner file.

mod cipher;
mod memory;
mod multi;
mod os;

pub use cipher::CipherFile;
pub use memory::MemoryFile;
pub use multi::{MultiFile, Segment};
pub use os::OsFile;

use crate::error::Result;

/// Seekable byte store underneath the page pool.
pub trait PageFile: Send + Sync {
    /// Reads up to `buf.len()` bytes at `pos`, returning the number of bytes read.
    ///
    /// Reading at or past the end of the file returns fewer bytes (possibly zero)
    /// rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if the read fails.
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize>;

    /// Writes all of `buf` at `pos`, extending the file when needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if the write fails.
    fn write(&self, pos: u64, buf: &[u8]) -> Result<()>;

    /// Flushes written data to durable storage.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if the sync fails.
    fn sync(&self) -> Result<()>;

    /// Returns the current length in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if the metadata query fails.
    fn length(&self) -> Result<u64>;

    /// Takes an exclusive lock against other processes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StorageIsUsed`](crate::Error::StorageIsUsed) if another process holds it.
    fn lock(&self) -> Result<()> {
        Ok(())
    }

    /// Releases OS resources. Further calls are not expected.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`](crate::Error::FileAccess) if a final flush fails.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl<F: PageFile + ?Sized> PageFile for Box<F> {
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        (**self).read(pos, buf)
    }

    fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        (**self).write(pos, buf)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn length(&self) -> Result<u64> {
        (**self).length()
    }

    fn lock(&self) -> Result<()> {
        (**self).lock()
    }

    fn close(&self) -> Result<()> {
        (**self).close()
    }
}
