//! Formula fingerprints.
//!
//! A dataset's formula is a canonical JSON document holding its name, kind,
//! version tag, declared root source, optional transformation content and the
//! `(name, fingerprint)` pairs of its inputs. The fingerprint is the SHA-256 of
//! that document, so any change to a dataset or to anything upstream of it
//! yields a different fingerprint.

use std::collections::HashMap;

use cabin_store::{Fingerprint, VersionKey};
use serde::Serialize;

use crate::error::EngineError;
use crate::registry::Registry;

/// Separator between root identifiers of a multi-root derived dataset.
pub const ROOT_SEPARATOR: &str = "::";

/// The computed formula of one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    /// SHA-256 of [`document`](Self::document).
    pub fingerprint: Fingerprint,
    /// Distinct root identifiers of the root ancestors, in resolution order.
    pub roots: Vec<String>,
    /// Canonical JSON the fingerprint was computed from.
    pub document: String,
}

impl Formula {
    /// Root identifier as recorded in version keys.
    pub fn root(&self) -> String {
        self.roots.join(ROOT_SEPARATOR)
    }
}

#[derive(Serialize)]
struct FormulaDocument<'a> {
    name: &'a str,
    kind: &'a str,
    version: &'a str,
    root: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    inputs: Vec<(&'a str, &'a str)>,
}

/// Computes formulas with per-dataset memoization.
///
/// A hasher is scoped to one resolution: it borrows the registry and caches
/// each dataset's formula the first time it is requested.
pub struct FormulaHasher<'r> {
    registry: &'r Registry,
    memo: HashMap<String, Formula>,
}

impl<'r> FormulaHasher<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            memo: HashMap::new(),
        }
    }

    /// Formula of `name`, computing inputs first.
    pub fn formula(&mut self, name: &str) -> Result<&Formula, EngineError> {
        if !self.memo.contains_key(name) {
            let formula = self.compute(name)?;
            self.memo.insert(name.to_string(), formula);
        }
        self.memo
            .get(name)
            .ok_or_else(|| EngineError::UnknownDataset(name.to_string()))
    }

    pub fn fingerprint(&mut self, name: &str) -> Result<Fingerprint, EngineError> {
        Ok(self.formula(name)?.fingerprint.clone())
    }

    /// Root identifier of `name`.
    ///
    /// A root dataset's identifier is its declared root source. A derived
    /// dataset's is the distinct identifiers of its root ancestors joined by
    /// [`ROOT_SEPARATOR`], in input declaration order (depth first).
    pub fn root_identifier(&mut self, name: &str) -> Result<String, EngineError> {
        Ok(self.formula(name)?.root())
    }

    /// Identity triple for the version `name` would produce now.
    pub fn key(&mut self, name: &str) -> Result<VersionKey, EngineError> {
        let formula = self.formula(name)?;
        Ok(VersionKey::new(name, formula.root(), formula.fingerprint.clone()))
    }

    fn compute(&mut self, name: &str) -> Result<Formula, EngineError> {
        let registry = self.registry;
        let def = registry.require(name)?;

        let mut roots: Vec<String> = Vec::new();
        let mut input_prints: Vec<(&str, Fingerprint)> = Vec::with_capacity(def.inputs().len());
        for input in def.inputs() {
            let formula = self.formula(input)?;
            input_prints.push((input.as_str(), formula.fingerprint.clone()));
            for root in &formula.roots {
                if !roots.contains(root) {
                    roots.push(root.clone());
                }
            }
        }
        if let Some(root) = def.root_source() {
            roots = vec![root.to_string()];
        }

        let document = FormulaDocument {
            name: def.name(),
            kind: def.kind().as_str(),
            version: def.version(),
            root: def.root_source(),
            content: def.transformation().formula_content(),
            inputs: input_prints
                .iter()
                .map(|(name, fp)| (*name, fp.as_str()))
                .collect(),
        };
        let document = serde_json::to_string(&document).map_err(|e| EngineError::InvalidDefinition {
            dataset: name.to_string(),
            reason: format!("formula not serializable: {}", e),
        })?;

        Ok(Formula {
            fingerprint: Fingerprint::of(document.as_bytes()),
            roots,
            document,
        })
    }
}
