//! Typed references to persistent objects.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use crate::{
    error::{Oid, Result},
    schema::Persistent,
    storage::Storage,
};

/// Reference to a persistent object of type `T`.
///
/// A handle always knows its oid and may carry the loaded state. A stub
/// built with [`Handle::from_oid`] (or read from a reference field) loads
/// on the first [`Handle::get`]. Equality and hashing use the oid only.
pub struct Handle<T> {
    oid: Oid,
    state: Option<Arc<T>>,
}

impl<T> Handle<T> {
    /// Creates an unloaded handle.
    pub fn from_oid(oid: Oid) -> Self {
        Self { oid, state: None }
    }

    pub(crate) fn loaded(oid: Oid, state: Arc<T>) -> Self {
        Self { oid, state: Some(state) }
    }

    /// Object id.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Loaded state, if any, without touching the storage.
    pub fn cached(&self) -> Option<&Arc<T>> {
        self.state.as_ref()
    }

    /// Drops the loaded state so the next [`Handle::get`] reloads it.
    pub fn invalidate(&mut self) {
        self.state = None;
    }

    pub(crate) fn set_state(&mut self, state: Arc<T>) {
        self.state = Some(state);
    }
}

impl<T: Persistent> Handle<T> {
    /// Returns the object state, loading it from `storage` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeletedObject`](crate::Error::DeletedObject) if the
    /// object was deallocated and [`Error::TypeMismatch`](crate::Error::TypeMismatch)
    /// if the record belongs to another type.
    pub fn get(&mut self, storage: &Storage) -> Result<Arc<T>> {
        if let Some(state) = &self.state {
            return Ok(Arc::clone(state));
        }
        let state = storage.load_object::<T>(self.oid)?;
        self.state = Some(Arc::clone(&state));
        Ok(state)
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self { oid: self.oid, state: self.state.clone() }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("oid", &self.oid).field("loaded", &self.state.is_some()).finish()
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.oid == other.oid
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.oid.hash(state);
    }
}
