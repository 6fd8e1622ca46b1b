//! Shared test utilities for nacre crates.
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`CrashInjector`] - Deterministic crash points for commit tests
//! - [`lcg_keys`] - The pseudo-random key sequence used by index scenarios
//! - [`strategies`] - Proptest generators

#![deny(unsafe_code)]

mod test_dir;
pub use test_dir::TestDir;

mod assertions;
pub use assertions::assert_eventually;

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint, IoEvent};

pub mod strategies;

/// Keys of the index scenario: starting from `seed`, each key is
/// `(3141592621 * key + 2718281829) mod 1000000007`.
///
/// # Example
///
/// ```
/// let keys: Vec<i64> = nacre_test_utils::lcg_keys(1999, 3).collect();
/// assert_eq!(keys.len(), 3);
/// assert_eq!(keys[0], (3141592621i64 * 1999 + 2718281829) % 1000000007);
/// ```
pub fn lcg_keys(seed: i64, count: usize) -> impl Iterator<Item = i64> {
    let mut key = seed;
    std::iter::repeat_with(move || {
        key = (3_141_592_621 * key + 2_718_281_829) % 1_000_000_007;
        key
    })
    .take(count)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::{
        collections::HashSet,
        sync::{
            Arc,
            atomic::{AtomicBool, AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use super::*;

    // ============================================
    // TestDir tests
    // ============================================

    #[test]
    fn test_dir_creates_temp_directory() {
        let dir = TestDir::new();
        assert!(dir.path().exists(), "temp directory should exist");
        assert!(dir.path().is_dir(), "should be a directory");
    }

    #[test]
    fn test_dir_join_creates_subdirectory_path() {
        let dir = TestDir::new();
        let subpath = dir.join("subdir/nested");
        assert!(subpath.starts_with(dir.path()));
        assert!(subpath.ends_with("subdir/nested"));
    }

    #[test]
    fn test_dir_cleanup_on_drop() {
        let path = {
            let dir = TestDir::new();
            let p = dir.path().to_path_buf();
            std::fs::write(p.join("file.txt"), "data").expect("write file");
            p
        };
        assert!(!path.exists(), "temp directory should be cleaned up on drop");
    }

    #[test]
    fn test_multi_file_description() {
        let dir = TestDir::new();
        let description = dir.multi_file_description("db.mfd", &[("a.seg", 64), ("b.seg", 0)]);
        assert!(description.starts_with('@'));
        let text = std::fs::read_to_string(dir.join("db.mfd")).unwrap();
        assert_eq!(text, "a.seg 64\nb.seg\n");
    }

    // ============================================
    // assert_eventually tests
    // ============================================

    #[test]
    fn test_assert_eventually_immediate_success() {
        assert!(assert_eventually(Duration::from_millis(100), || true));
    }

    #[test]
    fn test_assert_eventually_delayed_success() {
        let counter = AtomicUsize::new(0);
        let result = assert_eventually(Duration::from_millis(500), || counter.fetch_add(1, Ordering::SeqCst) >= 3);
        assert!(result);
        assert!(counter.load(Ordering::SeqCst) >= 4);
    }

    #[test]
    fn test_assert_eventually_timeout() {
        assert!(!assert_eventually(Duration::from_millis(50), || false));
    }

    #[test]
    fn test_assert_eventually_sees_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = std::thread::spawn({
            let flag = Arc::clone(&flag);
            move || {
                std::thread::sleep(Duration::from_millis(30));
                flag.store(true, Ordering::SeqCst);
            }
        });
        assert!(assert_eventually(Duration::from_secs(2), || flag.load(Ordering::SeqCst)));
        setter.join().unwrap();
    }

    // ============================================
    // Key sequence tests
    // ============================================

    #[test]
    fn test_lcg_keys_are_deterministic_and_distinct() {
        let a: Vec<i64> = lcg_keys(1999, 1000).collect();
        let b: Vec<i64> = lcg_keys(1999, 1000).collect();
        assert_eq!(a, b);
        assert!(a.iter().all(|k| (0..1_000_000_007).contains(k)));
        assert_eq!(a.iter().collect::<HashSet<_>>().len(), 1000);
    }
}
