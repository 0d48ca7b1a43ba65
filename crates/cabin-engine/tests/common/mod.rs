//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use cabin_engine::{
    BuildContext, DatasetDefinition, Engine, ExternalSource, ProducedArtifact, Registry,
    TransformError, Transformation,
};
use cabin_store::{ArtifactLocation, Catalog, DatasetKind, LocalArtifactStore, TableStore};

/// Records which datasets were produced and how many ran at once.
#[derive(Default)]
pub struct Recorder {
    pub produced: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl Recorder {
    pub fn produced(&self) -> Vec<String> {
        self.produced.lock().unwrap().clone()
    }
}

/// Test transformation writing a small artifact at the output location.
pub struct Writer {
    recorder: Arc<Recorder>,
    tables: Arc<TableStore>,
    fail: Option<String>,
    delay: Option<Duration>,
    blocking: Option<Duration>,
}

impl Writer {
    pub fn failing(mut self, reason: &str) -> Self {
        self.fail = Some(reason.to_string());
        self
    }

    /// Hold the written artifact for `delay`, returning early on cancellation.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Write a file artifact from a blocking thread after `delay`, ignoring cancellation.
    pub fn blocking(mut self, delay: Duration) -> Self {
        self.blocking = Some(delay);
        self
    }
}

#[async_trait]
impl Transformation for Writer {
    async fn produce(&self, ctx: &BuildContext) -> Result<ProducedArtifact, TransformError> {
        self.recorder.produced.lock().unwrap().push(ctx.dataset().to_string());
        let now = self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.recorder.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let result = self.write(ctx).await;

        self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl Writer {
    async fn write(&self, ctx: &BuildContext) -> Result<ProducedArtifact, TransformError> {
        let body = format!("dataset,root\n{},{}\n", ctx.dataset(), ctx.root());

        if let (Some(delay), ArtifactLocation::File(path)) = (self.blocking, &ctx.output) {
            let path = path.clone();
            let len = body.len() as u64;
            tokio::task::spawn_blocking(move || {
                std::thread::sleep(delay);
                std::fs::write(path, body)
            })
            .await
            .map_err(|e| TransformError::Failed(e.to_string()))??;
            return Ok(ProducedArtifact {
                row_count: 1,
                byte_size: len,
            });
        }
        let artifact = match &ctx.output {
            ArtifactLocation::Nothing => ProducedArtifact::default(),
            ArtifactLocation::File(path) => {
                tokio::fs::write(path, &body).await?;
                ProducedArtifact {
                    row_count: 1,
                    byte_size: body.len() as u64,
                }
            }
            ArtifactLocation::Table(name) => {
                self.tables.create_table(name, &["dataset", "root"])?;
                let rows = self.tables.insert_rows(
                    name,
                    &["dataset", "root"],
                    vec![vec![ctx.dataset().to_string(), ctx.root().to_string()]],
                )?;
                ProducedArtifact {
                    row_count: rows,
                    byte_size: 0,
                }
            }
        };

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = ctx.cancel.cancelled() => return Err(TransformError::Cancelled),
            }
        }
        if let Some(reason) = &self.fail {
            return Err(TransformError::Failed(reason.clone()));
        }
        Ok(artifact)
    }
}

/// A catalog, data store and downloads directory in a temp dir.
pub struct Harness {
    pub dir: TempDir,
    pub catalog: Arc<Catalog>,
    pub tables: Arc<TableStore>,
    pub store: Arc<LocalArtifactStore>,
    pub recorder: Arc<Recorder>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(Catalog::open(dir.path().join("catalog.db")).unwrap());
        let tables = Arc::new(TableStore::open(dir.path().join("data.db")).unwrap());
        let store = Arc::new(LocalArtifactStore::new(
            dir.path().join("downloads"),
            Arc::clone(&tables),
        ));
        store.ensure_dirs().await.unwrap();
        Self {
            dir,
            catalog,
            tables,
            store,
            recorder: Arc::new(Recorder::default()),
        }
    }

    pub fn writer(&self) -> Writer {
        Writer {
            recorder: Arc::clone(&self.recorder),
            tables: Arc::clone(&self.tables),
            fail: None,
            delay: None,
            blocking: None,
        }
    }

    pub fn engine(&self, registry: Registry) -> Engine {
        Engine::new(
            Arc::new(registry),
            Arc::clone(&self.catalog),
            self.store.clone(),
        )
    }

    /// Display names of every catalogued version.
    pub fn catalogued(&self) -> HashSet<String> {
        self.catalog
            .snapshot()
            .unwrap()
            .iter()
            .map(|v| v.display_name())
            .collect()
    }
}

pub fn external(name: &str, root: &str) -> DatasetDefinition {
    DatasetDefinition::new(name, DatasetKind::External, "1", ExternalSource::new()).root(root)
}

/// `A` (external, rooted at `root`) <- `B` (file) <- `C` (table).
pub fn chain(h: &Harness, root: &str) -> Registry {
    Registry::builder()
        .dataset(external("A", root))
        .dataset(DatasetDefinition::new("B", DatasetKind::File, "1", h.writer()).input("A"))
        .dataset(DatasetDefinition::new("C", DatasetKind::Table, "1", h.writer()).input("B"))
        .build()
        .unwrap()
}
