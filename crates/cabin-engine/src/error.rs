//! Error types for the engine.

use cabin_store::{CatalogError, StoreError};
use thiserror::Error;

/// Errors that abort an engine operation as a whole.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Name (or pattern) does not match any registered dataset.
    #[error("unknown dataset: {0}")]
    UnknownDataset(String),

    /// Two definitions share a name.
    #[error("duplicate dataset: {0}")]
    DuplicateDataset(String),

    /// The input graph contains a cycle.
    #[error("cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A definition is internally inconsistent.
    #[error("invalid definition for {dataset}: {reason}")]
    InvalidDefinition { dataset: String, reason: String },

    /// A version reference does not match any catalog row.
    #[error("unknown version: {0}")]
    UnknownVersion(String),

    /// A dataset pattern could not be compiled.
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Concurrent mutation of the same identity triple, still unresolved after a retry.
    #[error("catalog write conflict on {0}")]
    CatalogWriteConflict(String),

    /// Catalog error.
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Artifact storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Errors reported by a transformation. They are local to one dataset.
#[derive(Debug, Error)]
pub enum TransformError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// A declared input was not supplied.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// The import was cancelled while the transformation ran.
    #[error("cancelled")]
    Cancelled,

    /// The produced artifact failed its consistency check.
    #[error("check failed: {0}")]
    Check(String),

    /// Any other failure.
    #[error("{0}")]
    Failed(String),
}
