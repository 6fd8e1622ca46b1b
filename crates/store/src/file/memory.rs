//! In-memory page file.

use std::sync::Arc;

use parking_lot::RwLock;

use super::PageFile;
use crate::error::Result;

/// Growable in-memory byte store.
///
/// Clones share the same buffer, so a storage can be closed and a clone
/// reopened to observe exactly what was written.
#[derive(Clone, Default)]
pub struct MemoryFile {
    data: Arc<RwLock<Vec<u8>>>,
}

impl MemoryFile {
    /// Creates an empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a file holding `bytes`, e.g. a backup image.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { data: Arc::new(RwLock::new(bytes)) }
    }

    /// Returns a copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl PageFile for MemoryFile {
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.data.read();
        let pos = pos as usize;
        if pos >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - pos);
        buf[..n].copy_from_slice(&data[pos..pos + n]);
        Ok(n)
    }

    fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.data.write();
        let pos = pos as usize;
        let end = pos + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[pos..end].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.data.read().len() as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_write_extends_with_zeros() {
        let file = MemoryFile::new();
        file.write(10, &[7, 7]).unwrap();
        assert_eq!(file.length().unwrap(), 12);
        assert_eq!(&file.snapshot()[..12], &[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 7, 7]);
    }

    #[test]
    fn test_clones_share_contents() {
        let file = MemoryFile::new();
        let clone = file.clone();
        file.write(0, b"nacre").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(clone.read(0, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"nacre");
    }
}
