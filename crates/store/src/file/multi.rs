//! Multi-segment page file.
//!
//! A logical linear address space is split across several physical files of
//! declared sizes. The last segment is unbounded. Reads and writes crossing
//! a segment boundary are split transparently.

use std::path::{Path, PathBuf};

use super::{OsFile, PageFile};
use crate::error::{Error, Result};

/// One physical file of a [`MultiFile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Path of the segment file.
    pub path: PathBuf,
    /// Declared size in bytes. Ignored for the last segment.
    pub size: u64,
}

/// A page file spread over several segment files.
pub struct MultiFile {
    /// Open segments with their effective sizes (`u64::MAX` for the last).
    segments: Vec<(OsFile, u64)>,
}

impl MultiFile {
    /// Opens every segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessViolation`] if `segments` is empty and
    /// [`Error::FileAccess`] if a segment cannot be opened.
    pub fn open(segments: &[Segment], read_only: bool, no_flush: bool) -> Result<Self> {
        if segments.is_empty() {
            return Err(Error::access("multi-file needs at least one segment"));
        }
        let last = segments.len() - 1;
        let segments = segments
            .iter()
            .enumerate()
            .map(|(i, seg)| {
                let size = if i == last { u64::MAX } else { seg.size };
                Ok((OsFile::open(&seg.path, read_only, no_flush)?, size))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { segments })
    }

    /// Opens the segments listed in a description file.
    ///
    /// Each non-empty line holds a segment file name followed by an optional
    /// size in kilobytes; relative names resolve against the description
    /// file's directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessViolation`] on a malformed description and
    /// [`Error::FileAccess`] if a file cannot be read or opened.
    pub fn open_description(path: impl AsRef<Path>, read_only: bool, no_flush: bool) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let segments = parse_description(&text, &base)?;
        Self::open(&segments, read_only, no_flush)
    }

    /// Maps a logical position to (segment, offset inside it, bytes left in it).
    fn locate(&self, mut pos: u64) -> (usize, u64, u64) {
        for (i, (_, size)) in self.segments.iter().enumerate() {
            if pos < *size {
                return (i, pos, size - pos);
            }
            pos -= size;
        }
        // The last segment is unbounded, so the loop always returns.
        (self.segments.len() - 1, pos, u64::MAX)
    }
}

/// Parses `name [size_kb]` lines.
pub(crate) fn parse_description(text: &str, base: &Path) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    for line in text.lines() {
        let mut words = line.split_whitespace();
        let Some(name) = words.next() else { continue };
        let size_kb = match words.next() {
            Some(word) => word
                .parse::<u64>()
                .map_err(|_| Error::access(format!("bad segment size {word:?} for {name}")))?,
            None => 0,
        };
        let path = Path::new(name);
        let path = if path.is_absolute() { path.to_path_buf() } else { base.join(path) };
        segments.push(Segment { path, size: size_kb * 1024 });
    }
    if segments.is_empty() {
        return Err(Error::access("multi-file description lists no segments"));
    }
    Ok(segments)
}

impl PageFile for MultiFile {
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            let (seg, offs, avail) = self.locate(pos + done as u64);
            let want = (buf.len() - done).min(usize::try_from(avail).unwrap_or(usize::MAX));
            let n = self.segments[seg].0.read(offs, &mut buf[done..done + want])?;
            done += n;
            if n < want {
                break;
            }
        }
        Ok(done)
    }

    fn write(&self, pos: u64, buf: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let (seg, offs, avail) = self.locate(pos + done as u64);
            let want = (buf.len() - done).min(usize::try_from(avail).unwrap_or(usize::MAX));
            self.segments[seg].0.write(offs, &buf[done..done + want])?;
            done += want;
        }
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        for (file, _) in &self.segments {
            file.sync()?;
        }
        Ok(())
    }

    fn length(&self) -> Result<u64> {
        let mut total = 0;
        for (file, size) in &self.segments {
            let len = file.length()?;
            total += len;
            if len < *size {
                break;
            }
        }
        Ok(total)
    }

    fn lock(&self) -> Result<()> {
        self.segments[0].0.lock()
    }

    fn close(&self) -> Result<()> {
        for (file, _) in &self.segments {
            file.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_parse_description() {
        let segments =
            parse_description("a.dbs 4\n\n  b.dbs 8\nc.dbs\n", Path::new("/data")).unwrap();
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment { path: PathBuf::from("/data/a.dbs"), size: 4096 });
        assert_eq!(segments[1].size, 8192);
        assert_eq!(segments[2].size, 0);
    }

    #[test]
    fn test_parse_description_rejects_bad_size() {
        let err = parse_description("a.dbs lots\n", Path::new("/")).unwrap_err();
        assert!(matches!(err, Error::AccessViolation { .. }));
        assert!(parse_description("\n\n", Path::new("/")).is_err());
    }

    #[test]
    fn test_io_crosses_segment_boundary() {
        let dir = tempdir().unwrap();
        let segments = vec![
            Segment { path: dir.path().join("s0"), size: 100 },
            Segment { path: dir.path().join("s1"), size: 50 },
            Segment { path: dir.path().join("s2"), size: 0 },
        ];
        let file = MultiFile::open(&segments, false, true).unwrap();

        let data: Vec<u8> = (0..255u8).collect();
        file.write(20, &data).unwrap();

        let mut back = vec![0u8; data.len()];
        assert_eq!(file.read(20, &mut back).unwrap(), data.len());
        assert_eq!(back, data);
        assert_eq!(file.length().unwrap(), 275);

        assert_eq!(std::fs::metadata(dir.path().join("s0")).unwrap().len(), 100);
        assert_eq!(std::fs::metadata(dir.path().join("s1")).unwrap().len(), 50);
        assert_eq!(std::fs::metadata(dir.path().join("s2")).unwrap().len(), 125);
    }

    #[test]
    fn test_open_description_file() {
        let dir = tempdir().unwrap();
        let desc = dir.path().join("db.mfd");
        std::fs::write(&desc, "first.dbs 1\nsecond.dbs\n").unwrap();

        let file = MultiFile::open_description(&desc, false, true).unwrap();
        file.write(1000, &[9u8; 100]).unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("first.dbs")).unwrap().len(), 1024);
        assert_eq!(std::fs::metadata(dir.path().join("second.dbs")).unwrap().len(), 76);
    }
}
