//! Temporary directories for database files.

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A temporary directory removed on drop.
///
/// # Example
///
/// ```
/// use nacre_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let db_path = dir.join("test.nacre");
/// assert!(db_path.starts_with(dir.path()));
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Create a new temporary directory.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        let inner = TempDir::new().expect("failed to create temp directory");
        Self { inner }
    }

    /// Returns the path to the temporary directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Joins a relative path to the temporary directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.inner.path().join(path)
    }

    /// Writes a multi-file description listing `segments` as
    /// `(file name, size in KiB)`, relative to this directory, and returns the `@`-prefixed path that
    /// opens it. A size of 0 marks the unbounded last segment.
    ///
    /// # Panics
    ///
    /// Panics if the description file cannot be written.
    #[must_use]
    pub fn multi_file_description(&self, name: &str, segments: &[(&str, u64)]) -> String {
        let mut text = String::new();
        for (file, size_kb) in segments {
            if *size_kb == 0 {
                text.push_str(&format!("{file}\n"));
            } else {
                text.push_str(&format!("{file} {size_kb}\n"));
            }
        }
        let description = self.join(name);
        std::fs::write(&description, text).expect("failed to write multi-file description");
        format!("@{}", description.display())
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
