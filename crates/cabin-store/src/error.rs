//! Error types for catalog and artifact storage.

use thiserror::Error;

/// Errors that can occur in version catalog operations.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A version with the same identity triple already exists.
    #[error("version already exists: {0}")]
    Conflict(String),

    /// The version is still listed as an input by other versions.
    #[error("version {seq} is still referenced by {dependents:?}")]
    Referenced { seq: u64, dependents: Vec<u64> },

    /// Version not found.
    #[error("version not found: {0}")]
    NotFound(u64),

    /// An input reference points at a version that does not exist.
    #[error("unknown input version: {0}")]
    UnknownInput(u64),

    /// A stored row could not be decoded.
    #[error("corrupt catalog row {seq}: {reason}")]
    Corrupt { seq: u64, reason: String },

    /// The connection lock was poisoned by a panicking holder.
    #[error("catalog connection lock poisoned")]
    Poisoned,
}

/// Errors that can occur in artifact storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Table name exceeds the allowed identifier length.
    #[error("table name `{name}` exceeds the maximum allowed {max} characters")]
    TableNameTooLong { name: String, max: usize },

    /// The artifact location does not match what the operation expects.
    #[error("invalid artifact location: {0}")]
    InvalidLocation(String),

    /// The connection lock was poisoned by a panicking holder.
    #[error("table store lock poisoned")]
    Poisoned,
}
