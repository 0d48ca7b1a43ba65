//! The pluggable transformation interface.
//!
//! A [`Transformation`] turns the artifacts of a dataset's inputs into the
//! artifact of the dataset itself. The engine treats it as opaque: it supplies
//! a [`BuildContext`] naming the output location and the resolved inputs, and
//! records whatever [`ProducedArtifact`] comes back.

use async_trait::async_trait;
use cabin_store::{ArtifactLocation, VersionKey, VersionRecord};
use tokio::sync::watch;

use crate::error::TransformError;

/// A resolved input handed to a transformation.
#[derive(Debug, Clone)]
pub struct InputHandle {
    /// Dataset name of the input.
    pub dataset: String,
    /// The committed version being consumed.
    pub version: VersionRecord,
    /// Where its artifact lives.
    pub location: ArtifactLocation,
}

/// Cancellation signal handed to a running transformation.
///
/// The engine never aborts a transformation. It raises this flag and waits
/// for `produce` to return, so work moved onto blocking threads must poll
/// [`Cancellation::check`] and async work can race [`Cancellation::cancelled`].
#[derive(Debug, Clone)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    /// A signal that is never raised.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// `Err(TransformError::Cancelled)` once the signal is raised.
    pub fn check(&self) -> Result<(), TransformError> {
        if self.is_cancelled() {
            Err(TransformError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves when the signal is raised, never if it cannot be anymore.
    pub async fn cancelled(&self) {
        let mut rx = self.0.clone();
        let closed = rx.wait_for(|c| *c).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

impl From<watch::Receiver<bool>> for Cancellation {
    fn from(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }
}

/// Everything a transformation needs to produce one version.
#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Identity of the version being produced.
    pub key: VersionKey,
    /// Dataset version tag (the `version` field of the definition).
    pub dataset_version: String,
    /// Where the artifact must be written.
    pub output: ArtifactLocation,
    /// Inputs in declaration order.
    pub inputs: Vec<InputHandle>,
    /// Raised when the import is cancelled.
    pub cancel: Cancellation,
}

impl BuildContext {
    /// Dataset being built.
    pub fn dataset(&self) -> &str {
        &self.key.dataset
    }

    /// Root-source identifier of the version being built.
    pub fn root(&self) -> &str {
        &self.key.root
    }

    /// Input by dataset name.
    pub fn input(&self, dataset: &str) -> Result<&InputHandle, TransformError> {
        self.inputs
            .iter()
            .find(|i| i.dataset == dataset)
            .ok_or_else(|| TransformError::MissingInput(dataset.to_string()))
    }

    /// The only input, for single-input transformations.
    pub fn sole_input(&self) -> Result<&InputHandle, TransformError> {
        match self.inputs.as_slice() {
            [only] => Ok(only),
            [] => Err(TransformError::MissingInput(format!(
                "{} has no inputs",
                self.dataset()
            ))),
            _ => Err(TransformError::Failed(format!(
                "{} expects a single input, got {}",
                self.dataset(),
                self.inputs.len()
            ))),
        }
    }
}

/// Statistics about a freshly produced artifact.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducedArtifact {
    pub row_count: u64,
    pub byte_size: u64,
}

/// Produces a dataset's artifact from its inputs.
#[async_trait]
pub trait Transformation: Send + Sync {
    /// Write the artifact to `ctx.output`.
    ///
    /// On error the engine discards whatever was left at the output location.
    /// Long-running work should stop early once `ctx.cancel` is raised.
    async fn produce(&self, ctx: &BuildContext) -> Result<ProducedArtifact, TransformError>;

    /// Validate a produced artifact before it is committed.
    async fn check(&self, _ctx: &BuildContext, _artifact: &ProducedArtifact) -> Result<(), TransformError> {
        Ok(())
    }

    /// Extra content folded into the formula fingerprint, such as a source URL template.
    fn formula_content(&self) -> Option<serde_json::Value> {
        None
    }
}

/// A root source outside cabin, like a published file at a versioned URL.
///
/// Nothing is produced locally; the version only records that the source
/// at the given root was consulted.
#[derive(Debug, Clone, Default)]
pub struct ExternalSource {
    locator: Option<String>,
}

impl ExternalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source described by a locator template (e.g. a URL with `{root}`).
    pub fn at(locator: impl Into<String>) -> Self {
        Self {
            locator: Some(locator.into()),
        }
    }

    /// The locator with `{root}` substituted, if one was given.
    pub fn locate(&self, root: &str) -> Option<String> {
        self.locator.as_ref().map(|l| l.replace("{root}", root))
    }
}

#[async_trait]
impl Transformation for ExternalSource {
    async fn produce(&self, _ctx: &BuildContext) -> Result<ProducedArtifact, TransformError> {
        Ok(ProducedArtifact::default())
    }

    fn formula_content(&self) -> Option<serde_json::Value> {
        self.locator
            .as_ref()
            .map(|l| serde_json::json!({ "locator": l }))
    }
}
