//! Durable storage for cabin.
//!
//! This crate provides:
//! - The version model: identity triples, formula fingerprints, catalog rows
//! - A SQLite-backed version catalog with input edges between versions
//! - An artifact store abstraction with a local (files + SQLite tables) backend

mod artifacts;
mod catalog;
mod error;
mod tables;
mod types;

pub use artifacts::{ArtifactLocation, ArtifactStore, LocalArtifactStore, StagedRemoval};
pub use catalog::{Catalog, CatalogSnapshot};
pub use error::{CatalogError, StoreError};
pub use tables::{MAX_TABLE_NAME_LEN, TableStore};
pub use types::{DatasetKind, Fingerprint, NewVersion, VersionKey, VersionRecord, VersionRef};
