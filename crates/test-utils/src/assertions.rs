//! Polling assertions for tests that wait on background threads.

use std::time::{Duration, Instant};

/// Default polling interval for [`assert_eventually`].
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a condition until it returns true or the timeout expires.
///
/// Useful when a background collector or a second transaction thread
/// changes state at a time the test cannot control. Avoids fixed sleeps.
///
/// # Returns
///
/// `true` if the condition became true before timeout, `false` otherwise.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::time::Duration;
/// use nacre_test_utils::assert_eventually;
///
/// let flag = Arc::new(AtomicBool::new(false));
/// let setter = std::thread::spawn({
///     let flag = Arc::clone(&flag);
///     move || flag.store(true, Ordering::SeqCst)
/// });
///
/// assert!(assert_eventually(Duration::from_secs(1), || flag.load(Ordering::SeqCst)));
/// setter.join().unwrap();
/// ```
pub fn assert_eventually<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let start = Instant::now();

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(DEFAULT_POLL_INTERVAL);
    }

    // Final check after timeout
    condition()
}
