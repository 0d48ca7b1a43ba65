//! Safe removal of versions.
//!
//! Candidates come from a [`PruneSelector`]. A candidate is removable only if
//! every version consuming it is removed as well; this is computed as a
//! greatest fixed point, so a whole chain of outdated versions goes at once
//! while anything still consumed by a survivor stays. Prune never cascades to
//! versions that were not selected.
//!
//! Removal runs newest first. For each version the artifact is staged, the
//! catalog row deleted, and only then is the staged artifact destroyed; if the
//! row cannot be deleted the artifact is put back.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use cabin_store::{ArtifactStore, Catalog, CatalogSnapshot, VersionRecord, VersionRef};
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::pattern::DatasetPattern;
use crate::registry::Registry;
use crate::status::{self, Freshness};

/// Which versions to consider for removal.
#[derive(Debug, Clone)]
pub enum PruneSelector {
    /// Explicit versions by sequence number or display name.
    Versions(Vec<VersionRef>),
    /// Versions whose dataset or display name matches, optionally only the outdated ones.
    Patterns {
        patterns: Vec<DatasetPattern>,
        outdated_only: bool,
    },
    /// Every outdated version.
    Outdated,
}

/// What happens (or happened) to one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PruneAction {
    Remove,
    /// Kept because surviving versions consume it.
    Blocked { dependents: Vec<String> },
    /// Removal was attempted and failed.
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneEntry {
    pub version: VersionRecord,
    pub action: PruneAction,
}

/// Per-candidate actions, ordered by sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub dry_run: bool,
    pub entries: Vec<PruneEntry>,
}

impl PruneReport {
    pub fn removed(&self) -> impl Iterator<Item = &PruneEntry> {
        self.entries
            .iter()
            .filter(|e| e.action == PruneAction::Remove)
    }

    pub fn blocked(&self) -> impl Iterator<Item = &PruneEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.action, PruneAction::Blocked { .. }))
    }

    pub fn failed(&self) -> impl Iterator<Item = &PruneEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.action, PruneAction::Failed { .. }))
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }
}

/// Candidates split into removable and blocked versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrunePlan {
    removable: BTreeSet<u64>,
    /// Blocked candidate -> surviving dependents.
    blocked: BTreeMap<u64, Vec<u64>>,
}

impl PrunePlan {
    /// Compute the largest removable subset of `candidates`.
    pub fn compute(snapshot: &CatalogSnapshot, candidates: &BTreeSet<u64>) -> Self {
        let mut removable: BTreeSet<u64> = candidates
            .iter()
            .copied()
            .filter(|seq| snapshot.get(*seq).is_some())
            .collect();

        loop {
            let referenced: Vec<u64> = removable
                .iter()
                .copied()
                .filter(|seq| {
                    snapshot
                        .dependents(*seq)
                        .iter()
                        .any(|d| !removable.contains(d))
                })
                .collect();
            if referenced.is_empty() {
                break;
            }
            for seq in referenced {
                removable.remove(&seq);
            }
        }

        let blocked = candidates
            .iter()
            .copied()
            .filter(|seq| snapshot.get(*seq).is_some() && !removable.contains(seq))
            .map(|seq| {
                let survivors = snapshot
                    .dependents(seq)
                    .iter()
                    .copied()
                    .filter(|d| !removable.contains(d))
                    .collect();
                (seq, survivors)
            })
            .collect();

        Self { removable, blocked }
    }

    pub fn removable(&self) -> &BTreeSet<u64> {
        &self.removable
    }

    pub fn blocked(&self) -> &BTreeMap<u64, Vec<u64>> {
        &self.blocked
    }
}

/// Resolve a selector to candidate sequence numbers.
///
/// Every explicit version reference must match a catalogued version.
pub fn select(
    selector: &PruneSelector,
    registry: &Registry,
    snapshot: &CatalogSnapshot,
) -> Result<BTreeSet<u64>, EngineError> {
    match selector {
        PruneSelector::Versions(refs) => {
            let mut selected = BTreeSet::new();
            for r in refs {
                let matched: Vec<u64> = snapshot.iter().filter(|v| r.matches(v)).map(|v| v.seq).collect();
                if matched.is_empty() {
                    return Err(EngineError::UnknownVersion(r.to_string()));
                }
                selected.extend(matched);
            }
            Ok(selected)
        }
        PruneSelector::Patterns {
            patterns,
            outdated_only,
        } => {
            let entries = status::evaluate(registry, snapshot)?;
            Ok(entries
                .into_iter()
                .filter(|e| !outdated_only || e.freshness == Freshness::Outdated)
                .filter(|e| {
                    let display = e.version.display_name();
                    patterns
                        .iter()
                        .any(|p| p.matches(&e.version.key.dataset) || p.matches(&display))
                })
                .map(|e| e.version.seq)
                .collect())
        }
        PruneSelector::Outdated => Ok(status::evaluate(registry, snapshot)?
            .into_iter()
            .filter(|e| e.freshness == Freshness::Outdated)
            .map(|e| e.version.seq)
            .collect()),
    }
}

/// Carries out (or, for a dry run, reports) a prune plan.
pub struct Pruner<'a> {
    catalog: &'a Catalog,
    store: &'a dyn ArtifactStore,
}

impl<'a> Pruner<'a> {
    pub fn new(catalog: &'a Catalog, store: &'a dyn ArtifactStore) -> Self {
        Self { catalog, store }
    }

    #[tracing::instrument(skip_all, fields(removable = plan.removable().len(), blocked = plan.blocked().len(), dry_run = dry_run))]
    pub async fn execute(
        &self,
        snapshot: &CatalogSnapshot,
        plan: &PrunePlan,
        dry_run: bool,
    ) -> Result<PruneReport, EngineError> {
        let mut actions: BTreeMap<u64, PruneAction> = BTreeMap::new();

        for (seq, survivors) in plan.blocked() {
            actions.insert(
                *seq,
                PruneAction::Blocked {
                    dependents: display_names(snapshot, survivors),
                },
            );
        }

        // Versions whose removal failed stay in the catalog and keep their inputs alive.
        let mut kept: HashSet<u64> = HashSet::new();
        for &seq in plan.removable().iter().rev() {
            let Some(version) = snapshot.get(seq) else {
                continue;
            };

            let live: Vec<u64> = snapshot
                .dependents(seq)
                .iter()
                .copied()
                .filter(|d| kept.contains(d))
                .collect();
            if !live.is_empty() {
                warn!(version = %version.display_name(), "kept, a dependent could not be removed");
                kept.insert(seq);
                actions.insert(
                    seq,
                    PruneAction::Blocked {
                        dependents: display_names(snapshot, &live),
                    },
                );
                continue;
            }

            if dry_run {
                info!(version = %version.display_name(), seq, "would remove");
                actions.insert(seq, PruneAction::Remove);
                continue;
            }

            match self.remove(version).await {
                Ok(()) => {
                    info!(version = %version.display_name(), seq, "removed");
                    actions.insert(seq, PruneAction::Remove);
                }
                Err(e) => {
                    warn!(version = %version.display_name(), seq, error = %e, "removal failed");
                    kept.insert(seq);
                    actions.insert(seq, PruneAction::Failed { error: e.to_string() });
                }
            }
        }

        let entries = actions
            .into_iter()
            .filter_map(|(seq, action)| {
                snapshot.get(seq).map(|version| PruneEntry {
                    version: version.clone(),
                    action,
                })
            })
            .collect();

        Ok(PruneReport { dry_run, entries })
    }

    /// Stage the artifact, delete the row, then destroy the artifact.
    async fn remove(&self, version: &VersionRecord) -> Result<(), EngineError> {
        let location = self.store.locate(&version.key, version.kind)?;
        let staged = self.store.stage_removal(&location).await?;

        if let Err(e) = self.catalog.remove(version.seq) {
            if let Err(restore_err) = self.store.restore(staged).await {
                error!(
                    version = %version.display_name(),
                    error = %restore_err,
                    "could not restore staged artifact"
                );
            }
            return Err(e.into());
        }

        if let Err(e) = self.store.finish_removal(staged).await {
            warn!(version = %version.display_name(), error = %e, "catalog row removed, staged artifact left behind");
        }
        Ok(())
    }
}

fn display_names(snapshot: &CatalogSnapshot, seqs: &[u64]) -> Vec<String> {
    seqs.iter()
        .map(|seq| match snapshot.get(*seq) {
            Some(v) => v.display_name(),
            None => format!("#{}", seq),
        })
        .collect()
}
