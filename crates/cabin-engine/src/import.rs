//! Plan execution.
//!
//! The [`Importer`] walks a [`BuildPlan`]: reused steps are resolved
//! immediately, build steps are started once every input is committed, with at
//! most `jobs` transformations in flight. A failed step skips its transitive
//! dependents but leaves independent branches running. Catalog commits happen
//! on the executor itself, one at a time, so every recorded version points at
//! committed inputs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use cabin_store::{ArtifactLocation, ArtifactStore, Catalog, CatalogError, NewVersion, VersionRecord};
use tokio::sync::watch;
use tokio::task::{Id, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{EngineError, TransformError};
use crate::registry::Registry;
use crate::resolver::{BuildPlan, Decision, PlanStep};
use crate::transform::{BuildContext, Cancellation, InputHandle, ProducedArtifact};

/// Default number of concurrent transformations.
pub const DEFAULT_JOBS: usize = 4;

/// Whether to run transformations or only report what would run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    Execute,
    /// Dry run: no transformation runs and nothing is written.
    Simulate,
}

/// Why a step was not built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipCause {
    /// The transformation (or its check) failed.
    Failed(String),
    /// An input failed or was skipped.
    UpstreamFailed(String),
    /// Cancellation was requested before the step completed.
    Cancelled,
    /// The catalog rejected the version twice.
    WriteConflict,
}

impl fmt::Display for SkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipCause::Failed(reason) => write!(f, "failed: {}", reason),
            SkipCause::UpstreamFailed(input) => write!(f, "input {} not available", input),
            SkipCause::Cancelled => f.write_str("cancelled"),
            SkipCause::WriteConflict => f.write_str("catalog write conflict"),
        }
    }
}

/// What happened to one plan step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// An existing version was reused.
    Reused(VersionRecord),
    /// A new version was produced and committed.
    Built(VersionRecord),
    /// Would be built (simulation only).
    WouldBuild,
    /// Not built.
    Skipped(SkipCause),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub dataset: String,
    /// Display name of the version.
    pub version: String,
    pub outcome: StepOutcome,
}

/// Per-step results, in plan order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub mode: ImportMode,
    pub steps: Vec<StepReport>,
}

impl ImportReport {
    pub fn outcome(&self, dataset: &str) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|s| s.dataset == dataset)
            .map(|s| &s.outcome)
    }

    pub fn built(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Built(_) | StepOutcome::WouldBuild))
    }

    pub fn reused(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Reused(_)))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &StepReport> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, StepOutcome::Skipped(_)))
    }

    /// Whether any step was skipped.
    pub fn has_failures(&self) -> bool {
        self.skipped().next().is_some()
    }
}

/// A build in flight.
struct Running<'p> {
    step: &'p PlanStep,
    output: ArtifactLocation,
}

/// Result of committing a produced version.
enum Committed {
    Inserted(VersionRecord),
    /// Another writer recorded the same identity first.
    Existing(VersionRecord),
}

/// Executes build plans.
pub struct Importer<'a> {
    registry: &'a Registry,
    catalog: &'a Catalog,
    store: &'a dyn ArtifactStore,
    jobs: usize,
}

impl<'a> Importer<'a> {
    pub fn new(registry: &'a Registry, catalog: &'a Catalog, store: &'a dyn ArtifactStore) -> Self {
        Self {
            registry,
            catalog,
            store,
            jobs: DEFAULT_JOBS,
        }
    }

    /// Limit concurrent transformations (at least one).
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// Execute (or simulate) `plan`.
    ///
    /// When `shutdown` flips to `true`, no new step starts and the
    /// [`Cancellation`] of every in-flight transformation is raised. Each one
    /// is awaited to completion before its output is discarded, so nothing
    /// written afterwards can outlive the discard. Every step not yet
    /// committed is reported as cancelled; versions committed before that
    /// stay valid.
    #[tracing::instrument(skip_all, fields(steps = plan.len(), mode = ?mode, jobs = self.jobs))]
    pub async fn execute(
        &self,
        plan: &BuildPlan,
        mode: ImportMode,
        mut shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<ImportReport, EngineError> {
        let mut outcomes: HashMap<&str, StepOutcome> = HashMap::new();
        let mut available: HashMap<&str, Option<VersionRecord>> = HashMap::new();
        let mut failed: HashSet<&str> = HashSet::new();
        let mut pending: Vec<&PlanStep> = Vec::new();

        for step in plan.steps() {
            match &step.decision {
                Decision::Reuse(record) => {
                    info!(dataset = %step.dataset, version = %record.display_name(), "reusing existing version");
                    available.insert(&step.dataset, Some(record.clone()));
                    outcomes.insert(&step.dataset, StepOutcome::Reused(record.clone()));
                }
                Decision::Build => pending.push(step),
            }
        }

        let mut tasks: JoinSet<Result<ProducedArtifact, TransformError>> = JoinSet::new();
        let mut running: HashMap<Id, Running<'_>> = HashMap::new();
        let mut cancelled = shutdown.as_ref().is_some_and(|rx| *rx.borrow());
        let (cancel_tx, cancel_rx) = watch::channel(cancelled);

        loop {
            // Pending steps are in plan order, so inputs are settled before dependents are visited.
            let mut i = 0;
            while i < pending.len() {
                let step = pending[i];

                if cancelled {
                    pending.remove(i);
                    failed.insert(&step.dataset);
                    outcomes.insert(&step.dataset, StepOutcome::Skipped(SkipCause::Cancelled));
                    continue;
                }

                if let Some(upstream) = step.inputs.iter().find(|input| failed.contains(input.as_str())) {
                    warn!(dataset = %step.dataset, input = %upstream, "skipping, input not available");
                    pending.remove(i);
                    failed.insert(&step.dataset);
                    outcomes.insert(
                        &step.dataset,
                        StepOutcome::Skipped(SkipCause::UpstreamFailed(upstream.clone())),
                    );
                    continue;
                }

                if !step.inputs.iter().all(|input| available.contains_key(input.as_str())) {
                    i += 1;
                    continue;
                }

                if mode == ImportMode::Simulate {
                    info!(dataset = %step.dataset, version = %step.display_name(), "would build");
                    pending.remove(i);
                    available.insert(&step.dataset, None);
                    outcomes.insert(&step.dataset, StepOutcome::WouldBuild);
                    continue;
                }

                if tasks.len() >= self.jobs {
                    i += 1;
                    continue;
                }

                pending.remove(i);
                match self.start(step, &available, &cancel_rx, &mut tasks).await {
                    Ok((id, output)) => {
                        running.insert(id, Running { step, output });
                    }
                    Err(e) => {
                        warn!(dataset = %step.dataset, error = %e, "could not start build");
                        failed.insert(&step.dataset);
                        outcomes.insert(&step.dataset, StepOutcome::Skipped(SkipCause::Failed(e.to_string())));
                    }
                }
            }

            if tasks.is_empty() {
                // Only reachable with steps whose inputs are missing from the plan.
                for step in pending.drain(..) {
                    outcomes.insert(
                        &step.dataset,
                        StepOutcome::Skipped(SkipCause::Failed("inputs missing from plan".to_string())),
                    );
                }
                break;
            }

            let joined = tokio::select! {
                joined = tasks.join_next_with_id() => joined,
                _ = shutdown_requested(&mut shutdown), if !cancelled => {
                    warn!(in_flight = running.len(), "cancellation requested, waiting for running builds to stop");
                    cancelled = true;
                    cancel_tx.send_replace(true);
                    continue;
                }
            };

            let (id, result) = match joined {
                Some(Ok((id, result))) => (id, result),
                Some(Err(err)) => (
                    err.id(),
                    Err(TransformError::Failed(format!("transformation did not finish: {}", err))),
                ),
                None => continue,
            };
            let Some(Running { step, output }) = running.remove(&id) else {
                debug!(task = %id, "untracked task finished");
                continue;
            };

            let outcome = match result {
                Ok(_) if cancelled => {
                    self.discard(step, &output).await;
                    StepOutcome::Skipped(SkipCause::Cancelled)
                }
                Err(_) if cancelled => {
                    self.discard(step, &output).await;
                    StepOutcome::Skipped(SkipCause::Cancelled)
                }
                Err(e) => {
                    warn!(dataset = %step.dataset, error = %e, "build failed");
                    self.discard(step, &output).await;
                    StepOutcome::Skipped(SkipCause::Failed(e.to_string()))
                }
                Ok(artifact) => match self.commit(step, artifact, &available) {
                    Ok(Committed::Inserted(record)) => {
                        info!(
                            dataset = %step.dataset,
                            version = %record.display_name(),
                            seq = record.seq,
                            rows = record.row_count,
                            bytes = record.byte_size,
                            "built"
                        );
                        StepOutcome::Built(record)
                    }
                    Ok(Committed::Existing(record)) => {
                        info!(dataset = %step.dataset, version = %record.display_name(), "recorded concurrently, reusing");
                        StepOutcome::Reused(record)
                    }
                    Err(e) => {
                        warn!(dataset = %step.dataset, error = %e, "commit failed");
                        self.discard(step, &output).await;
                        match e {
                            EngineError::CatalogWriteConflict(_) => StepOutcome::Skipped(SkipCause::WriteConflict),
                            other => StepOutcome::Skipped(SkipCause::Failed(other.to_string())),
                        }
                    }
                },
            };

            match &outcome {
                StepOutcome::Built(record) | StepOutcome::Reused(record) => {
                    available.insert(&step.dataset, Some(record.clone()));
                }
                _ => {
                    failed.insert(&step.dataset);
                }
            }
            outcomes.insert(&step.dataset, outcome);
        }

        let steps = plan
            .steps()
            .iter()
            .map(|step| StepReport {
                dataset: step.dataset.clone(),
                version: step.display_name(),
                outcome: outcomes
                    .remove(step.dataset.as_str())
                    .unwrap_or(StepOutcome::Skipped(SkipCause::Cancelled)),
            })
            .collect();

        Ok(ImportReport { mode, steps })
    }

    async fn start(
        &self,
        step: &PlanStep,
        available: &HashMap<&str, Option<VersionRecord>>,
        cancel: &watch::Receiver<bool>,
        tasks: &mut JoinSet<Result<ProducedArtifact, TransformError>>,
    ) -> Result<(Id, ArtifactLocation), EngineError> {
        let def = self.registry.require(&step.dataset)?;
        let output = self.store.locate(&step.key, step.kind)?;

        let mut inputs = Vec::with_capacity(step.inputs.len());
        for name in &step.inputs {
            let version = committed(available, name)?;
            let location = self.store.locate(&version.key, version.kind)?;
            inputs.push(InputHandle {
                dataset: name.clone(),
                version,
                location,
            });
        }

        // Leftovers at a content address belong to no committed version.
        self.store.discard(&output).await?;

        let ctx = BuildContext {
            key: step.key.clone(),
            dataset_version: def.version().to_string(),
            output: output.clone(),
            inputs,
            cancel: Cancellation::from(cancel.clone()),
        };
        let transformation = Arc::clone(def.transformation());

        info!(dataset = %step.dataset, version = %step.display_name(), "building");
        let handle = tasks.spawn(async move {
            let artifact = transformation.produce(&ctx).await?;
            ctx.cancel.check()?;
            transformation.check(&ctx, &artifact).await?;
            Ok::<_, TransformError>(artifact)
        });

        Ok((handle.id(), output))
    }

    /// Record a produced version, retrying once on a write conflict.
    fn commit(
        &self,
        step: &PlanStep,
        artifact: ProducedArtifact,
        available: &HashMap<&str, Option<VersionRecord>>,
    ) -> Result<Committed, EngineError> {
        let inputs = step
            .inputs
            .iter()
            .map(|name| committed(available, name).map(|v| v.seq))
            .collect::<Result<Vec<_>, _>>()?;

        let new = NewVersion {
            key: step.key.clone(),
            kind: step.kind,
            formula: step.formula.clone(),
            row_count: artifact.row_count,
            byte_size: artifact.byte_size,
            inputs,
        };

        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.catalog.insert(&new) {
                Ok(record) => return Ok(Committed::Inserted(record)),
                Err(CatalogError::Conflict(reason)) => {
                    if let Some(existing) = self.catalog.find(&new.key)? {
                        return Ok(Committed::Existing(existing));
                    }
                    if attempts >= 2 {
                        return Err(EngineError::CatalogWriteConflict(reason));
                    }
                    debug!(dataset = %step.dataset, reason = %reason, "write conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn discard(&self, step: &PlanStep, output: &ArtifactLocation) {
        if let Err(e) = self.store.discard(output).await {
            warn!(dataset = %step.dataset, error = %e, "could not discard partial output");
        }
    }
}

fn committed(
    available: &HashMap<&str, Option<VersionRecord>>,
    name: &str,
) -> Result<VersionRecord, EngineError> {
    available
        .get(name)
        .cloned()
        .flatten()
        .ok_or_else(|| EngineError::UnknownVersion(format!("no committed version of {}", name)))
}

/// Resolves once the shutdown flag is set. Never resolves without a receiver.
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    let Some(rx) = shutdown else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}
