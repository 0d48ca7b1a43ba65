//! Build planning.
//!
//! Given target datasets, the resolver computes each required dataset's
//! identity triple, looks it up in a catalog snapshot and decides whether the
//! version can be reused or must be built. Expansion is demand driven: the
//! inputs of a reusable version are not visited, so an existing table does not
//! require the file it was imported from to still exist.

use std::collections::{BTreeSet, HashMap, HashSet};

use cabin_store::{CatalogSnapshot, DatasetKind, VersionKey, VersionRecord};
use tracing::debug;

use crate::error::EngineError;
use crate::fingerprint::FormulaHasher;
use crate::pattern::DatasetPattern;
use crate::registry::{Registry, find_cycle};

/// Which datasets an operation applies to.
#[derive(Debug, Clone)]
pub enum Targets {
    /// Every registered dataset.
    All,
    /// Datasets matching any of these names or globs.
    Matching(Vec<DatasetPattern>),
}

impl Targets {
    /// Parse names or globs.
    pub fn parse<S: AsRef<str>>(patterns: &[S]) -> Result<Self, EngineError> {
        let patterns = patterns
            .iter()
            .map(|p| DatasetPattern::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Targets::Matching(patterns))
    }

    /// Target dataset names in declaration order.
    pub fn expand(&self, registry: &Registry) -> Result<Vec<String>, EngineError> {
        match self {
            Targets::All => Ok(registry.names().map(str::to_string).collect()),
            Targets::Matching(patterns) => registry.expand(patterns),
        }
    }
}

/// What to do with a required dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// A version with the same identity triple exists.
    Reuse(VersionRecord),
    /// A new version must be produced.
    Build,
}

/// One dataset in a build plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStep {
    pub dataset: String,
    pub kind: DatasetKind,
    /// Identity of the version this step yields.
    pub key: VersionKey,
    /// Formula document behind the fingerprint.
    pub formula: String,
    /// Input dataset names in declaration order.
    pub inputs: Vec<String>,
    pub decision: Decision,
}

impl PlanStep {
    pub fn display_name(&self) -> String {
        self.key.display_name()
    }

    pub fn is_build(&self) -> bool {
        self.decision == Decision::Build
    }
}

/// Ordered steps: every step appears after the steps producing its inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildPlan {
    steps: Vec<PlanStep>,
    targets: Vec<String>,
}

impl BuildPlan {
    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Requested datasets in declaration order.
    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    pub fn step(&self, dataset: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.dataset == dataset)
    }

    pub fn to_build(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| s.is_build())
    }

    pub fn to_reuse(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps.iter().filter(|s| !s.is_build())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Compute the build plan for `targets` against `snapshot`.
///
/// Unknown targets fail before the snapshot is consulted.
#[tracing::instrument(skip_all, fields(catalog_versions = snapshot.len()))]
pub fn resolve(
    registry: &Registry,
    snapshot: &CatalogSnapshot,
    targets: &Targets,
) -> Result<BuildPlan, EngineError> {
    let target_names = targets.expand(registry)?;
    let mut hasher = FormulaHasher::new(registry);

    let mut steps: HashMap<String, PlanStep> = HashMap::new();
    let mut stack: Vec<String> = target_names.iter().rev().cloned().collect();
    while let Some(name) = stack.pop() {
        if steps.contains_key(&name) {
            continue;
        }
        let def = registry.require(&name)?;
        let key = hasher.key(&name)?;
        let formula = hasher.formula(&name)?.document.clone();

        let decision = match snapshot.find(&key) {
            Some(record) => {
                debug!(dataset = %name, version = %record.display_name(), "reusable");
                Decision::Reuse(record.clone())
            }
            None => {
                debug!(dataset = %name, version = %key.display_name(), "needs build");
                stack.extend(def.inputs().iter().rev().cloned());
                Decision::Build
            }
        };

        steps.insert(
            name.clone(),
            PlanStep {
                dataset: name,
                kind: def.kind(),
                key,
                formula,
                inputs: def.inputs().to_vec(),
                decision,
            },
        );
    }

    let order = topological_order(registry, &steps)?;
    let mut ordered = Vec::with_capacity(order.len());
    for name in order {
        if let Some(step) = steps.remove(&name) {
            ordered.push(step);
        }
    }

    Ok(BuildPlan {
        steps: ordered,
        targets: target_names,
    })
}

/// Kahn's algorithm over the planned steps, breaking ties by declaration order.
///
/// Only steps that will be built depend on their inputs; reused steps are
/// ready immediately.
fn topological_order(
    registry: &Registry,
    steps: &HashMap<String, PlanStep>,
) -> Result<Vec<String>, EngineError> {
    let position = |name: &str| registry.position(name).unwrap_or(usize::MAX);

    let mut remaining: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps.values() {
        let waits_on: Vec<&str> = if step.is_build() {
            step.inputs
                .iter()
                .map(String::as_str)
                .filter(|i| steps.contains_key(*i))
                .collect()
        } else {
            Vec::new()
        };
        remaining.insert(step.dataset.as_str(), waits_on.len());
        for input in waits_on {
            dependents.entry(input).or_default().push(step.dataset.as_str());
        }
    }

    let mut ready: BTreeSet<(usize, &str)> = remaining
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(name, _)| (position(*name), *name))
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    let mut emitted: HashSet<&str> = HashSet::new();
    while let Some(next) = ready.pop_first() {
        let (_, name) = next;
        order.push(name.to_string());
        emitted.insert(name);
        for &dependent in dependents.get(name).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert((position(dependent), dependent));
                }
            }
        }
    }

    if order.len() < steps.len() {
        let stuck: Vec<&str> = steps
            .keys()
            .map(String::as_str)
            .filter(|n| !emitted.contains(n))
            .collect();
        let index: HashMap<&str, usize> = stuck.iter().enumerate().map(|(i, n)| (*n, i)).collect();
        let cycle = find_cycle(stuck.len(), |i| {
            steps[stuck[i]]
                .inputs
                .iter()
                .filter_map(|input| index.get(input.as_str()).copied())
                .collect()
        })
        .map(|c| c.into_iter().map(|i| stuck[i].to_string()).collect())
        .unwrap_or_else(|| stuck.iter().map(|n| n.to_string()).collect());
        return Err(EngineError::CyclicDependency { cycle });
    }

    Ok(order)
}
