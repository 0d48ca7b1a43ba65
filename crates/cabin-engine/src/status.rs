//! Freshness of catalogued versions.
//!
//! A version is current when its identity triple equals the one its dataset
//! would produce from the present registry. Everything else, including versions
//! of datasets that are no longer registered, is outdated.

use std::collections::HashMap;
use std::fmt;

use cabin_store::{CatalogSnapshot, VersionKey, VersionRecord};

use crate::error::EngineError;
use crate::fingerprint::FormulaHasher;
use crate::pattern::DatasetPattern;
use crate::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Freshness {
    Current,
    Outdated,
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Freshness::Current => f.write_str("current"),
            Freshness::Outdated => f.write_str("outdated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub version: VersionRecord,
    pub freshness: Freshness,
    /// Number of input versions consumed.
    pub input_count: usize,
    /// Number of catalogued versions consuming this one.
    pub output_count: usize,
}

impl StatusEntry {
    pub fn is_outdated(&self) -> bool {
        self.freshness == Freshness::Outdated
    }
}

/// Classify every version in `snapshot`, ordered by sequence number.
pub fn evaluate(registry: &Registry, snapshot: &CatalogSnapshot) -> Result<Vec<StatusEntry>, EngineError> {
    let mut hasher = FormulaHasher::new(registry);
    let mut current: HashMap<&str, VersionKey> = HashMap::new();
    for name in registry.names() {
        current.insert(name, hasher.key(name)?);
    }

    Ok(snapshot
        .iter()
        .map(|version| {
            let freshness = match current.get(version.key.dataset.as_str()) {
                Some(key) if *key == version.key => Freshness::Current,
                _ => Freshness::Outdated,
            };
            StatusEntry {
                input_count: version.inputs.len(),
                output_count: snapshot.dependents(version.seq).len(),
                version: version.clone(),
                freshness,
            }
        })
        .collect())
}

/// Narrow entries to datasets matching any of `patterns` (all when empty).
pub fn filter_entries(
    entries: Vec<StatusEntry>,
    patterns: &[DatasetPattern],
    outdated_only: bool,
) -> Vec<StatusEntry> {
    entries
        .into_iter()
        .filter(|e| !outdated_only || e.is_outdated())
        .filter(|e| patterns.is_empty() || patterns.iter().any(|p| p.matches(&e.version.key.dataset)))
        .collect()
}
