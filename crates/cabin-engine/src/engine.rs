//! The engine facade used by front ends.

use std::sync::Arc;

use cabin_store::{ArtifactStore, Catalog};
use tokio::sync::{Mutex, watch};
use tracing::info;

use crate::error::EngineError;
use crate::import::{DEFAULT_JOBS, ImportMode, ImportReport, Importer};
use crate::prune::{PrunePlan, PruneReport, PruneSelector, Pruner, select};
use crate::registry::Registry;
use crate::resolver::{BuildPlan, Targets, resolve};
use crate::status::{self, StatusEntry};

/// Ties a registry to a catalog and an artifact store.
///
/// Mutating operations (a real import or prune) are serialized through a
/// writer lock. Simulations, dry runs and status queries work on a catalog
/// snapshot and never take it.
pub struct Engine {
    registry: Arc<Registry>,
    catalog: Arc<Catalog>,
    store: Arc<dyn ArtifactStore>,
    jobs: usize,
    writer: Mutex<()>,
}

impl Engine {
    pub fn new(registry: Arc<Registry>, catalog: Arc<Catalog>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            registry,
            catalog,
            store,
            jobs: DEFAULT_JOBS,
            writer: Mutex::new(()),
        }
    }

    /// Maximum concurrent transformations during import.
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn store(&self) -> &dyn ArtifactStore {
        self.store.as_ref()
    }

    /// Plan an import without executing anything.
    pub fn plan(&self, targets: &Targets) -> Result<BuildPlan, EngineError> {
        // Fail on unknown targets before touching the catalog.
        targets.expand(&self.registry)?;
        let snapshot = self.catalog.snapshot()?;
        resolve(&self.registry, &snapshot, targets)
    }

    pub async fn import(&self, targets: &Targets, mode: ImportMode) -> Result<ImportReport, EngineError> {
        self.import_until(targets, mode, None).await
    }

    /// Import, stopping early when `shutdown` flips to `true`.
    pub async fn import_until(
        &self,
        targets: &Targets,
        mode: ImportMode,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> Result<ImportReport, EngineError> {
        targets.expand(&self.registry)?;

        let _guard = match mode {
            ImportMode::Execute => Some(self.writer.lock().await),
            ImportMode::Simulate => None,
        };

        let plan = self.plan(targets)?;
        info!(
            steps = plan.len(),
            to_build = plan.to_build().count(),
            "resolved build plan"
        );

        Importer::new(&self.registry, &self.catalog, self.store.as_ref())
            .jobs(self.jobs)
            .execute(&plan, mode, shutdown)
            .await
    }

    /// Classify every catalogued version.
    pub fn status(&self) -> Result<Vec<StatusEntry>, EngineError> {
        let snapshot = self.catalog.snapshot()?;
        status::evaluate(&self.registry, &snapshot)
    }

    pub async fn prune(&self, selector: &PruneSelector, dry_run: bool) -> Result<PruneReport, EngineError> {
        let _guard = if dry_run {
            None
        } else {
            Some(self.writer.lock().await)
        };

        let snapshot = self.catalog.snapshot()?;
        let candidates = select(selector, &self.registry, &snapshot)?;
        let plan = PrunePlan::compute(&snapshot, &candidates);
        info!(
            candidates = candidates.len(),
            removable = plan.removable().len(),
            "computed prune plan"
        );

        Pruner::new(&self.catalog, self.store.as_ref())
            .execute(&snapshot, &plan, dry_run)
            .await
    }
}
