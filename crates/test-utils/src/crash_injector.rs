//! Crash injection for commit-atomicity tests.
//!
//! A commit writes dirty pages (including the header page with the new
//! working root), syncs, rewrites the header with the flipped root selector
//! and syncs again:
//!
//! ```text
//! Write pages → Sync → Write header (flip) → Sync
//!       ↑         ↑            ↑               ↑
//! DuringPageWrite BeforeFirstSync BeforeRootFlip DuringSecondSync
//! ```
//!
//! A file wrapper in the test reports every write and sync as an [`IoEvent`];
//! once the injector answers that the crash happened, the wrapper drops that
//! operation and every later one, which is what a killed process leaves
//! behind.

use std::sync::{Arc, Mutex, PoisonError};

/// Points in the commit sequence where a crash can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Crash at the data page write with this 0-based number, before any
    /// sync. The previous commit must survive.
    DuringPageWrite {
        /// Number of page writes that complete first.
        after: u32,
    },

    /// Crash at the first sync. Pages and the working root have been
    /// written but the selector still names the previous commit.
    BeforeFirstSync,

    /// Crash at the header write that flips the root selector. The new root
    /// is in the file but inactive.
    BeforeRootFlip,

    /// Crash at the second sync, after the flipped header was written. The
    /// new commit is what reopening sees.
    DuringSecondSync,
}

/// File operations reported to the injector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// Write of page 0.
    HeaderWrite,
    /// Write anywhere else.
    PageWrite,
    /// Durability barrier.
    Sync,
}

#[derive(Debug, Default)]
struct Trace {
    armed: bool,
    crashed: bool,
    syncs: u32,
    header_writes: u32,
    page_writes: u32,
}

impl Trace {
    /// Counts `event` and decides whether it is the crash.
    fn record(&mut self, point: CrashPoint, event: IoEvent) -> bool {
        let fires = match event {
            IoEvent::Sync => {
                self.syncs += 1;
                matches!(
                    (point, self.syncs),
                    (CrashPoint::BeforeFirstSync, 1) | (CrashPoint::DuringSecondSync, 2)
                )
            },
            IoEvent::HeaderWrite => {
                self.header_writes += 1;
                point == CrashPoint::BeforeRootFlip && self.syncs > 0
            },
            IoEvent::PageWrite => {
                self.page_writes += 1;
                matches!(point, CrashPoint::DuringPageWrite { after } if self.page_writes > after)
            },
        };
        self.crashed = fires;
        fires
    }
}

/// Decides when a simulated crash happens.
///
/// Shared between the file wrapper and the test through an `Arc`.
#[derive(Debug)]
pub struct CrashInjector {
    point: CrashPoint,
    trace: Mutex<Trace>,
}

impl CrashInjector {
    /// Creates a disarmed injector targeting `point`.
    pub fn new(point: CrashPoint) -> Arc<Self> {
        Arc::new(Self { point, trace: Mutex::new(Trace::default()) })
    }

    fn with_trace<R>(&self, f: impl FnOnce(&mut Trace) -> R) -> R {
        f(&mut self.trace.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Arms the injector with fresh counters.
    ///
    /// Arm right before the commit under test so setup I/O passes through.
    pub fn arm(&self) {
        self.with_trace(|trace| *trace = Trace { armed: true, ..Trace::default() });
    }

    /// Lets every later operation through.
    pub fn disarm(&self) {
        self.with_trace(|trace| trace.armed = false);
    }

    /// Whether the crash has happened.
    pub fn has_crashed(&self) -> bool {
        self.with_trace(|trace| trace.crashed)
    }

    /// Reports `event`; `true` means the operation must be dropped because
    /// this is the crash.
    ///
    /// Events are only counted while armed and before the crash.
    pub fn observe(&self, event: IoEvent) -> bool {
        self.with_trace(|trace| trace.armed && !trace.crashed && trace.record(self.point, event))
    }

    /// Shorthand for [`IoEvent::Sync`].
    pub fn on_sync(&self) -> bool {
        self.observe(IoEvent::Sync)
    }

    /// Shorthand for [`IoEvent::HeaderWrite`].
    pub fn on_header_write(&self) -> bool {
        self.observe(IoEvent::HeaderWrite)
    }

    /// Shorthand for [`IoEvent::PageWrite`].
    pub fn on_page_write(&self) -> bool {
        self.observe(IoEvent::PageWrite)
    }

    /// The configured crash point.
    pub fn crash_point(&self) -> CrashPoint {
        self.point
    }

    /// Syncs seen since arming.
    pub fn sync_count(&self) -> u32 {
        self.with_trace(|trace| trace.syncs)
    }

    /// Header writes seen since arming.
    pub fn header_write_count(&self) -> u32 {
        self.with_trace(|trace| trace.header_writes)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn run(point: CrashPoint, events: &[IoEvent]) -> Vec<bool> {
        let injector = CrashInjector::new(point);
        injector.arm();
        events.iter().map(|&e| injector.observe(e)).collect()
    }

    use IoEvent::{HeaderWrite as H, PageWrite as P, Sync as S};

    /// The event sequence of one commit.
    const COMMIT: [IoEvent; 6] = [H, P, P, S, H, S];

    #[test]
    fn test_unarmed_injector_never_fires() {
        let injector = CrashInjector::new(CrashPoint::BeforeFirstSync);
        assert!(COMMIT.iter().all(|&e| !injector.observe(e)));
        assert!(!injector.has_crashed());
        assert_eq!(injector.sync_count(), 0);
    }

    #[test]
    fn test_each_point_fires_once_at_its_step() {
        let cases = [
            (CrashPoint::DuringPageWrite { after: 0 }, 1),
            (CrashPoint::DuringPageWrite { after: 1 }, 2),
            (CrashPoint::BeforeFirstSync, 3),
            (CrashPoint::BeforeRootFlip, 4),
            (CrashPoint::DuringSecondSync, 5),
        ];
        for (point, step) in cases {
            let fired = run(point, &COMMIT);
            let expected: Vec<bool> = (0..COMMIT.len()).map(|i| i == step).collect();
            assert_eq!(fired, expected, "{point:?}");
        }
    }

    #[test]
    fn test_root_flip_spares_header_before_sync() {
        let injector = CrashInjector::new(CrashPoint::BeforeRootFlip);
        injector.arm();
        assert!(!injector.on_header_write());
        assert!(!injector.on_sync());
        assert!(injector.on_header_write());
        assert_eq!(injector.header_write_count(), 2);
    }

    #[test]
    fn test_rearming_clears_crash() {
        let injector = CrashInjector::new(CrashPoint::DuringSecondSync);
        injector.arm();
        assert!(!injector.on_sync());
        assert!(injector.on_sync());
        assert!(injector.has_crashed());

        injector.arm();
        assert!(!injector.has_crashed());
        assert_eq!(injector.sync_count(), 0);
        assert_eq!(injector.crash_point(), CrashPoint::DuringSecondSync);
    }

    #[test]
    fn test_disarm_lets_everything_through() {
        let injector = CrashInjector::new(CrashPoint::DuringPageWrite { after: 0 });
        injector.arm();
        injector.disarm();
        assert!(!injector.on_page_write());
        assert!(!injector.has_crashed());
    }
}
