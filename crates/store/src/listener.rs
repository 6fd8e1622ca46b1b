//! Storage event callbacks.

use crate::error::Oid;

/// Receives notifications about storage-level events.
///
/// Every method has an empty default, so implementors override only what
/// they need. Callbacks run on the thread that raised the event, outside
/// the storage's internal locks, and must not block for long.
///
/// ```
/// use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
/// use nacre_store::{Oid, StorageListener};
///
/// #[derive(Default)]
/// struct Counter(AtomicUsize);
///
/// impl StorageListener for Counter {
///     fn deallocate_object(&self, _type_name: &str, _oid: Oid) {
///         self.0.fetch_add(1, Ordering::Relaxed);
///     }
/// }
///
/// let listener: Arc<dyn StorageListener> = Arc::new(Counter::default());
/// # let _ = listener;
/// ```
pub trait StorageListener: Send + Sync {
    /// Open found an inconsistent header or index.
    fn database_corrupted(&self) {}

    /// Open rolled a dirty database back to its last commit.
    fn recovery_completed(&self) {}

    /// A collection cycle is about to mark.
    fn gc_started(&self) {}

    /// A collection cycle finished after freeing `deallocated` objects.
    fn gc_completed(&self, deallocated: usize) {
        let _ = deallocated;
    }

    /// The collector freed object `oid` of type `type_name`.
    fn deallocate_object(&self, type_name: &str, oid: Oid) {
        let _ = (type_name, oid);
    }
}
