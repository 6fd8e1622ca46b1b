//! Single OS file using position-based I/O (`pread`/`pwrite`).
//!
//! Reads take `&self` and never touch the file cursor. Writes are serialized
//! through a unit mutex so that concurrent extensions cannot interleave.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
};

use parking_lot::Mutex;

use super::PageFile;
use crate::error::{Error, Result};

/// A database file on the local file system.
pub struct OsFile {
    file: File,
    /// Serializes writes and file extension.
    write_lock: Mutex<()>,
    /// `sync` becomes a no-op.
    no_flush: bool,
    read_only: bool,
    path: PathBuf,
}

impl OsFile {
    /// Opens `path`, creating it unless `read_only` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileAccess`] if the file cannot be opened.
    pub fn open(path: impl AsRef<Path>, read_only: bool, no_flush: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?
        };
        Ok(Self { file, write_lock: Mutex::new(()), no_flush, read_only, path })
    }

    /// Path the file was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PageFile for OsFile {
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        read_at(&self.file, buf, pos)
    }

    fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let _guard = self.write_lock.lock();
        write_all_at(&self.file, buf, pos)
    }

    fn sync(&self) -> Result<()> {
        if self.no_flush || self.read_only {
            return Ok(());
        }
        self.file.sync_data()?;
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn lock(&self) -> Result<()> {
        // Called through the trait: `std::fs::File` has inherent methods of
        // the same names with a different error type.
        let locked = if self.read_only {
            fs2::FileExt::try_lock_shared(&self.file)
        } else {
            fs2::FileExt::try_lock_exclusive(&self.file)
        };
        match locked {
            Ok(()) => Ok(()),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                tracing::warn!(path = %self.path.display(), "database file is locked by another process");
                Err(Error::StorageIsUsed)
            },
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        // Unlocking a file that was never locked is harmless.
        let _ = fs2::FileExt::unlock(&self.file);
        Ok(())
    }
}

/// Reads as many bytes as are available at `offset`, stopping at end of file.
#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.seek_read(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut done = 0;
    while done < data.len() {
        done += file.seek_write(&data[done..], offset + done as u64)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let file = OsFile::open(dir.path().join("test.dbs"), false, false).unwrap();

        file.write(4096, &[0xAB; 100]).unwrap();
        file.sync().unwrap();

        let mut buf = [0u8; 100];
        assert_eq!(file.read(4096, &mut buf).unwrap(), 100);
        assert!(buf.iter().all(|&b| b == 0xAB));
        assert_eq!(file.length().unwrap(), 4196);
    }

    #[test]
    fn test_read_past_end_is_short() {
        let dir = tempdir().unwrap();
        let file = OsFile::open(dir.path().join("test.dbs"), false, false).unwrap();
        file.write(0, &[1, 2, 3]).unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(file.read(0, &mut buf).unwrap(), 3);
        assert_eq!(file.read(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_read_only_rejects_writes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dbs");
        OsFile::open(&path, false, false).unwrap().write(0, &[1]).unwrap();

        let file = OsFile::open(&path, true, false).unwrap();
        assert!(matches!(file.write(0, &[2]), Err(Error::ReadOnly)));
    }

    #[test]
    fn test_read_only_missing_file_fails() {
        let dir = tempdir().unwrap();
        let err = OsFile::open(dir.path().join("absent.dbs"), true, false);
        assert!(matches!(err, Err(Error::FileAccess { .. })));
    }

    #[test]
    fn test_lock_modes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.dbs");
        let writer = OsFile::open(&path, false, false).unwrap();
        writer.lock().unwrap();
        let other = OsFile::open(&path, false, false).unwrap();
        assert!(matches!(other.lock(), Err(Error::StorageIsUsed)));
        writer.close().unwrap();
        other.lock().unwrap();
        other.close().unwrap();

        let first = OsFile::open(&path, true, false).unwrap();
        let second = OsFile::open(&path, true, false).unwrap();
        first.lock().unwrap();
        second.lock().unwrap();
        assert!(matches!(writer.lock(), Err(Error::StorageIsUsed)));
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let dir = tempdir().unwrap();
        let file = Arc::new(OsFile::open(dir.path().join("test.dbs"), false, true).unwrap());
        file.write(0, &[0x11; 4096]).unwrap();

        let writer = {
            let file = Arc::clone(&file);
            std::thread::spawn(move || {
                for i in 0u8..32 {
                    file.write(8192, &[i; 4096]).unwrap();
                }
            })
        };
        let reader = {
            let file = Arc::clone(&file);
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                for _ in 0..32 {
                    file.read(0, &mut buf).unwrap();
                    assert!(buf.iter().all(|&b| b == 0x11));
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
