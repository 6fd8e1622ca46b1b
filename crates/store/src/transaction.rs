//! Multi-threaded transactions.
//!
//! All modes funnel into the single storage commit. They differ in who may
//! run at the same time and when that commit happens:
//!
//! - [`TransactionMode::Exclusive`]: one transaction at a time; it commits
//!   when it ends.
//! - [`TransactionMode::Cooperative`]: any number run together and share the
//!   working state. The commit happens when the last of them ends, so small
//!   concurrent transactions pay for one flush. A transaction can ask for its
//!   changes to be committed within a deadline; once a deadline passes, new
//!   cooperative transactions wait until the batch is committed.
//! - [`TransactionMode::Serializable`]: stores are buffered in the
//!   transaction and written together with the commit at its outermost end.
//!   Isolation between serializable transactions comes from the per-object
//!   locks taken with [`Transaction::lock_shared`] and
//!   [`Transaction::lock_exclusive`].
//!
//! Object locks are reentrant and released when the transaction ends. They
//! are not checked for deadlocks.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{
    cache::{DirtyObject, Object},
    error::{Error, Oid, Result},
    handle::Handle,
    schema::{Persistent, TypedCodec},
    storage::Storage,
};

/// Concurrency discipline of a [`Transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// Single writer; excludes every other transaction.
    Exclusive,
    /// Shared working state, commit batched at the last end.
    Cooperative,
    /// Buffered stores, committed at the outermost end.
    Serializable,
}

#[derive(Debug, Default)]
struct GateState {
    shared: usize,
    exclusive: bool,
}

/// Shared/exclusive admission of transactions.
#[derive(Debug, Default)]
struct Gate {
    state: Mutex<GateState>,
    released: Condvar,
}

impl Gate {
    fn enter(&self, exclusive: bool) {
        let mut state = self.state.lock();
        if exclusive {
            while state.exclusive || state.shared > 0 {
                self.released.wait(&mut state);
            }
            state.exclusive = true;
        } else {
            while state.exclusive {
                self.released.wait(&mut state);
            }
            state.shared += 1;
        }
    }

    fn leave(&self, exclusive: bool) {
        let mut state = self.state.lock();
        if exclusive {
            state.exclusive = false;
        } else {
            state.shared = state.shared.saturating_sub(1);
        }
        self.released.notify_all();
    }
}

#[derive(Debug, Default)]
struct CooperativeState {
    /// Cooperative transactions that have not ended yet.
    active: usize,
    /// Number of batch commits so far.
    committed: u64,
    /// Earliest deadline requested for the pending batch.
    scheduled: Option<Instant>,
}

#[derive(Debug, Default)]
struct ObjectLock {
    readers: HashMap<u64, usize>,
    writer: Option<(u64, usize)>,
}

impl ObjectLock {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none()
    }
}

/// Transaction bookkeeping owned by a storage instance.
#[derive(Debug)]
pub(crate) struct TransactionMonitor {
    gate: Gate,
    cooperative: Mutex<CooperativeState>,
    batch_committed: Condvar,
    locks: Mutex<HashMap<Oid, ObjectLock>>,
    lock_released: Condvar,
    next_id: AtomicU64,
}

impl Default for TransactionMonitor {
    fn default() -> Self {
        Self {
            gate: Gate::default(),
            cooperative: Mutex::new(CooperativeState::default()),
            batch_committed: Condvar::new(),
            locks: Mutex::new(HashMap::new()),
            lock_released: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl TransactionMonitor {
    fn lock_shared(&self, id: u64, oid: Oid) {
        let mut locks = self.locks.lock();
        loop {
            let lock = locks.entry(oid).or_default();
            if lock.writer.is_none_or(|(owner, _)| owner == id) {
                *lock.readers.entry(id).or_default() += 1;
                return;
            }
            self.lock_released.wait(&mut locks);
        }
    }

    fn lock_exclusive(&self, id: u64, oid: Oid) {
        let mut locks = self.locks.lock();
        loop {
            let lock = locks.entry(oid).or_default();
            let writer_ok = lock.writer.is_none_or(|(owner, _)| owner == id);
            let readers_ok = lock.readers.keys().all(|&reader| reader == id);
            if writer_ok && readers_ok {
                let depth = lock.writer.map_or(0, |(_, depth)| depth);
                lock.writer = Some((id, depth + 1));
                return;
            }
            self.lock_released.wait(&mut locks);
        }
    }

    fn release_locks(&self, id: u64, oids: &[Oid]) {
        if oids.is_empty() {
            return;
        }
        let mut locks = self.locks.lock();
        for oid in oids {
            if let Some(lock) = locks.get_mut(oid) {
                lock.readers.remove(&id);
                if lock.writer.is_some_and(|(owner, _)| owner == id) {
                    lock.writer = None;
                }
                if lock.is_free() {
                    locks.remove(oid);
                }
            }
        }
        self.lock_released.notify_all();
    }
}

/// An explicit transaction context.
///
/// Obtained from [`Storage::begin_transaction`]. Nesting is counted on the
/// context itself: every [`Transaction::begin_nested`] needs a matching
/// [`Transaction::end`], and only the outermost end finishes the
/// transaction. A context dropped before it finishes is rolled back.
pub struct Transaction {
    storage: Storage,
    mode: TransactionMode,
    id: u64,
    depth: u32,
    finished: bool,
    pending: BTreeMap<Oid, DirtyObject>,
    held: Vec<Oid>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("mode", &self.mode)
            .field("id", &self.id)
            .field("depth", &self.depth)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl Transaction {
    /// Waits for admission in `mode` and starts a transaction.
    pub(crate) fn begin(storage: Storage, mode: TransactionMode) -> Self {
        let monitor = &storage.inner().transactions;
        let id = monitor.next_id.fetch_add(1, Ordering::Relaxed);
        match mode {
            TransactionMode::Exclusive => monitor.gate.enter(true),
            TransactionMode::Serializable => monitor.gate.enter(false),
            TransactionMode::Cooperative => {
                monitor.gate.enter(false);
                let mut coop = monitor.cooperative.lock();
                while let Some(deadline) = coop.scheduled
                    && Instant::now() >= deadline
                {
                    monitor.batch_committed.wait(&mut coop);
                }
                coop.active += 1;
            },
        }
        tracing::trace!(id, ?mode, "transaction started");
        Self { storage, mode, id, depth: 1, finished: false, pending: BTreeMap::new(), held: Vec::new() }
    }

    /// Mode the transaction was started in.
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// Current nesting depth; 0 once finished.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn check_active(&self) -> Result<()> {
        if self.finished {
            return Err(Error::InvalidTransactionState { reason: format!("transaction {} already finished", self.id) });
        }
        Ok(())
    }

    /// Enters a nested transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransactionState`] if the transaction has
    /// already finished.
    pub fn begin_nested(&mut self) -> Result<()> {
        self.check_active()?;
        self.depth += 1;
        Ok(())
    }

    /// Leaves one nesting level; the outermost end finishes the transaction.
    ///
    /// `max_delay` only matters for a cooperative transaction that ends
    /// while others are still running: `None` leaves the commit to the last
    /// one, `Some(Duration::ZERO)` waits until the batch is committed and any
    /// other value asks for the commit to happen within that delay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransactionState`] if the transaction has
    /// already finished, and any error of the commit itself.
    pub fn end(&mut self, max_delay: Option<Duration>) -> Result<()> {
        self.check_active()?;
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }
        self.finished = true;
        let result = match self.mode {
            TransactionMode::Exclusive => self.storage.commit(),
            TransactionMode::Serializable => {
                let pending = std::mem::take(&mut self.pending).into_iter().collect();
                self.storage.commit_pending(pending)
            },
            TransactionMode::Cooperative => return self.end_cooperative(max_delay),
        };
        self.release();
        result
    }

    fn end_cooperative(&mut self, max_delay: Option<Duration>) -> Result<()> {
        let monitor = &self.storage.inner().transactions;
        let mut coop = monitor.cooperative.lock();
        coop.active -= 1;
        if coop.active == 0 {
            let result = self.storage.commit();
            coop.committed += 1;
            coop.scheduled = None;
            monitor.batch_committed.notify_all();
            drop(coop);
            self.release();
            return result;
        }
        match max_delay {
            Some(delay) if delay.is_zero() => {
                let batch = coop.committed;
                monitor.gate.leave(false);
                monitor.release_locks(self.id, &std::mem::take(&mut self.held));
                while coop.committed == batch {
                    monitor.batch_committed.wait(&mut coop);
                }
                tracing::trace!(id = self.id, "transaction finished");
                return Ok(());
            },
            Some(delay) => {
                let deadline = Instant::now() + delay;
                coop.scheduled = Some(coop.scheduled.map_or(deadline, |current| current.min(deadline)));
            },
            None => {},
        }
        drop(coop);
        self.release();
        Ok(())
    }

    /// Discards the transaction.
    ///
    /// An exclusive or cooperative rollback discards the whole working state
    /// of the storage, including changes of other cooperative transactions.
    /// A serializable rollback only drops the buffered stores. Handles that
    /// were updated keep their new state; invalidate them to reload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransactionState`] if the transaction has
    /// already finished.
    pub fn rollback(mut self) -> Result<()> {
        self.abort()
    }

    fn abort(&mut self) -> Result<()> {
        self.check_active()?;
        self.finished = true;
        self.depth = 0;
        let result = match self.mode {
            TransactionMode::Serializable => {
                self.pending.clear();
                Ok(())
            },
            TransactionMode::Exclusive => self.storage.rollback(),
            TransactionMode::Cooperative => {
                let monitor = &self.storage.inner().transactions;
                let mut coop = monitor.cooperative.lock();
                coop.active -= 1;
                let result = self.storage.rollback();
                if coop.active == 0 {
                    coop.committed += 1;
                    coop.scheduled = None;
                    monitor.batch_committed.notify_all();
                }
                result
            },
        };
        self.release();
        result
    }

    /// Leaves the admission gate and drops every object lock.
    fn release(&mut self) {
        let monitor = &self.storage.inner().transactions;
        monitor.release_locks(self.id, &std::mem::take(&mut self.held));
        monitor.gate.leave(self.mode == TransactionMode::Exclusive);
        tracing::trace!(id = self.id, "transaction finished");
    }

    /// Replaces the state of `handle` within the transaction.
    ///
    /// A serializable transaction buffers the value until its outermost end;
    /// the other modes store it right away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransactionState`] if the transaction has
    /// already finished and [`Error::TypeMismatch`] if the object is not a
    /// `T`.
    pub fn store<T: Persistent>(&mut self, handle: &mut Handle<T>, value: T) -> Result<()> {
        self.check_active()?;
        if self.mode != TransactionMode::Serializable {
            return self.storage.store_object(handle, value);
        }
        let oid = handle.oid();
        let type_oid = self.storage.with_core(|core| {
            core.check_type::<T>(oid)?;
            core.begin_write()?;
            core.type_oid_of::<T>()
        })?;
        let state = Arc::new(value);
        self.pending.insert(oid, DirtyObject {
            value: Arc::clone(&state) as Object,
            codec: Arc::new(TypedCodec::<T>::new()),
            type_oid,
        });
        handle.set_state(state);
        Ok(())
    }

    /// Loads `oid`, seeing this transaction's buffered stores first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TypeMismatch`] if the object is not a `T`.
    pub fn load<T: Persistent>(&self, oid: Oid) -> Result<Arc<T>> {
        if let Some(object) = self.pending.get(&oid) {
            return Arc::clone(&object.value)
                .downcast::<T>()
                .map_err(|_| Error::access(format!("buffered object {oid} is not a {}", T::TYPE_NAME)));
        }
        self.storage.load_object::<T>(oid)
    }

    /// Number of stores waiting for the commit.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Takes a shared lock on `oid`, waiting while another transaction holds
    /// it exclusively.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransactionState`] if the transaction has
    /// already finished.
    pub fn lock_shared(&mut self, oid: Oid) -> Result<()> {
        self.check_active()?;
        self.storage.inner().transactions.lock_shared(self.id, oid);
        self.held.push(oid);
        Ok(())
    }

    /// Takes an exclusive lock on `oid`, waiting while another transaction
    /// holds it in any mode.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTransactionState`] if the transaction has
    /// already finished.
    pub fn lock_exclusive(&mut self, oid: Oid) -> Result<()> {
        self.check_active()?;
        self.storage.inner().transactions.lock_exclusive(self.id, oid);
        self.held.push(oid);
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!(id = self.id, mode = ?self.mode, "transaction dropped while active, rolling back");
        if let Err(e) = self.abort() {
            tracing::warn!(error = %e, "rollback of dropped transaction failed");
        }
    }
}
