//! Build engine for cabin datasets.
//!
//! This crate provides:
//! - A validated, immutable registry of dataset definitions
//! - Formula fingerprints and root identifiers for content addressing
//! - Build planning against the version catalog, reusing what already exists
//! - Concurrent plan execution with failure isolation and cancellation
//! - Freshness evaluation and safe pruning of catalogued versions

mod engine;
mod error;
mod fingerprint;
mod import;
mod pattern;
mod prune;
mod registry;
mod resolver;
mod status;
mod transform;

pub use engine::Engine;
pub use error::{EngineError, TransformError};
pub use fingerprint::{Formula, FormulaHasher, ROOT_SEPARATOR};
pub use import::{DEFAULT_JOBS, ImportMode, ImportReport, Importer, SkipCause, StepOutcome, StepReport};
pub use pattern::DatasetPattern;
pub use prune::{PruneAction, PruneEntry, PrunePlan, PruneReport, PruneSelector, Pruner, select};
pub use registry::{DatasetDefinition, Registry, RegistryBuilder};
pub use resolver::{BuildPlan, Decision, PlanStep, Targets, resolve};
pub use status::{Freshness, StatusEntry, evaluate, filter_entries};
pub use transform::{BuildContext, Cancellation, ExternalSource, InputHandle, ProducedArtifact, Transformation};
