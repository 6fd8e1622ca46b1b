//! Error types for the nacre storage engine.

use std::io;

use snafu::Snafu;

use crate::{btree::KeyKind, config::ConfigError};

/// Object identifier: a dense index into the object index.
pub type Oid = u32;

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during storage operations.
///
/// Every error is fatal to the operation that raised it. The only automatic
/// recovery the engine performs is the dirty-open rollback to the last
/// committed root descriptor.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// The oid is zero, beyond the index, or does not name an object of the requested shape.
    #[snafu(display("Invalid object id {oid}"))]
    InvalidOid {
        /// The offending object id.
        oid: Oid,
    },

    /// Access through a reference to an object that was already deallocated.
    #[snafu(display("Object {oid} was deleted"))]
    DeletedObject {
        /// The deallocated object id.
        oid: Oid,
    },

    /// Key not found in an index.
    #[snafu(display("Key not found"))]
    KeyNotFound,

    /// A single-result lookup matched more than one entry.
    #[snafu(display("Key is not unique"))]
    KeyNotUnique,

    /// The supplied key kind does not match the kind the index was created with.
    #[snafu(display("Incompatible key type: index uses {expected:?}, got {found:?}"))]
    IncompatibleKeyType {
        /// Key kind stored in the index.
        expected: KeyKind,
        /// Key kind that was supplied.
        found: KeyKind,
    },

    /// Header, index or record layout is inconsistent.
    #[snafu(display("Database corrupted: {reason}"))]
    DatabaseCorrupted {
        /// Description of the inconsistency.
        reason: String,
    },

    /// Operation on a storage that is not open.
    #[snafu(display("Storage not opened"))]
    StorageNotOpened,

    /// `open` called on a storage that is already open.
    #[snafu(display("Storage already opened"))]
    StorageAlreadyOpened,

    /// The database file is locked by another process.
    #[snafu(display("Storage file is used by another process"))]
    StorageIsUsed,

    /// The object index or the allocation bitmap cannot grow any further.
    #[snafu(display("Not enough space: object index or allocation bitmap is exhausted"))]
    NotEnoughSpace,

    /// I/O failure in the underlying page file.
    #[snafu(display("File access error: {source}"))]
    FileAccess {
        /// The underlying I/O error.
        source: io::Error,
    },

    /// A record could not be encoded or decoded with its field layout.
    #[snafu(display("Access violation: {reason}"))]
    AccessViolation {
        /// What went wrong while reading or writing a field.
        reason: String,
    },

    /// The stored record belongs to another type than the one requested.
    #[snafu(display("Object {oid} has type {found}, expected {expected}"))]
    TypeMismatch {
        /// Object id of the record.
        oid: Oid,
        /// Requested type name.
        expected: String,
        /// Stored type name.
        found: String,
    },

    /// Mutation attempted on a read-only storage.
    #[snafu(display("Storage is read-only"))]
    ReadOnly,

    /// A string-keyed property had a value of the wrong shape.
    #[snafu(display("Bad value {value:?} for property {key}"))]
    BadPropertyValue {
        /// Property key.
        key: String,
        /// Rejected value.
        value: String,
    },

    /// An index iterator observed a structural change of its tree.
    #[snafu(display("Index was modified during iteration"))]
    ConcurrentModification,

    /// Variable-length key does not fit the page layout.
    #[snafu(display("Key too large: {size} bytes (max {max})"))]
    KeyTooLarge {
        /// Encoded key size.
        size: usize,
        /// Largest accepted encoded key size.
        max: usize,
    },

    /// Transaction API misuse, such as ending a transaction that was never begun.
    #[snafu(display("Invalid transaction state: {reason}"))]
    InvalidTransactionState {
        /// Description of the misuse.
        reason: String,
    },

    /// Configuration rejected by validation.
    #[snafu(display("Invalid configuration: {source}"))]
    Config {
        /// The validation failure.
        source: ConfigError,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::FileAccess { source }
    }
}

impl From<ConfigError> for Error {
    fn from(source: ConfigError) -> Self {
        Error::Config { source }
    }
}

impl Error {
    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Error::DatabaseCorrupted { reason: reason.into() }
    }

    pub(crate) fn access(reason: impl Into<String>) -> Self {
        Error::AccessViolation { reason: reason.into() }
    }
}
