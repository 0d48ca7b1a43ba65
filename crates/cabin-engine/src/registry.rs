//! The dataset registry.
//!
//! A [`Registry`] is built once at startup from a list of
//! [`DatasetDefinition`]s and is immutable afterwards. Building validates the
//! whole graph: names are unique, every input refers to a registered dataset,
//! root datasets (no inputs) declare a root source and derived datasets do not,
//! and the input relation is acyclic.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use cabin_store::DatasetKind;

use crate::error::EngineError;
use crate::pattern::DatasetPattern;
use crate::transform::Transformation;

/// Declaration of a dataset.
#[derive(Clone)]
pub struct DatasetDefinition {
    name: String,
    kind: DatasetKind,
    version: String,
    root: Option<String>,
    inputs: Vec<String>,
    description: Option<String>,
    tags: Vec<String>,
    transformation: Arc<dyn Transformation>,
}

impl DatasetDefinition {
    pub fn new(
        name: impl Into<String>,
        kind: DatasetKind,
        version: impl Into<String>,
        transformation: impl Transformation + 'static,
    ) -> Self {
        Self::with_shared(name, kind, version, Arc::new(transformation))
    }

    /// Like [`new`](Self::new), sharing an existing transformation.
    pub fn with_shared(
        name: impl Into<String>,
        kind: DatasetKind,
        version: impl Into<String>,
        transformation: Arc<dyn Transformation>,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            version: version.into(),
            root: None,
            inputs: Vec::new(),
            description: None,
            tags: Vec::new(),
            transformation,
        }
    }

    /// Root-source identifier, required for datasets without inputs.
    pub fn root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Append an input dataset.
    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DatasetKind {
        self.kind
    }

    /// Version tag of the transformation logic.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Declared root source, `None` for derived datasets.
    pub fn root_source(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// Input dataset names in declaration order.
    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn description_text(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn transformation(&self) -> &Arc<dyn Transformation> {
        &self.transformation
    }

    /// Whether this is a root dataset (no inputs).
    pub fn is_root(&self) -> bool {
        self.inputs.is_empty()
    }
}

impl fmt::Debug for DatasetDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetDefinition")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("version", &self.version)
            .field("root", &self.root)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

/// Collects definitions and validates them into a [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    definitions: Vec<DatasetDefinition>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dataset(mut self, definition: DatasetDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    pub fn datasets(mut self, definitions: impl IntoIterator<Item = DatasetDefinition>) -> Self {
        self.definitions.extend(definitions);
        self
    }

    pub fn build(self) -> Result<Registry, EngineError> {
        let mut index = HashMap::with_capacity(self.definitions.len());
        for (i, def) in self.definitions.iter().enumerate() {
            if index.insert(def.name.clone(), i).is_some() {
                return Err(EngineError::DuplicateDataset(def.name.clone()));
            }
        }

        for def in &self.definitions {
            validate(def, &index)?;
        }

        let edges: Vec<Vec<usize>> = self
            .definitions
            .iter()
            .map(|def| def.inputs.iter().map(|input| index[input]).collect())
            .collect();

        if let Some(cycle) = find_cycle(self.definitions.len(), |i| edges[i].clone()) {
            return Err(EngineError::CyclicDependency {
                cycle: cycle
                    .into_iter()
                    .map(|i| self.definitions[i].name.clone())
                    .collect(),
            });
        }

        let mut dependents = vec![Vec::new(); self.definitions.len()];
        for (i, inputs) in edges.iter().enumerate() {
            for &input in inputs {
                dependents[input].push(i);
            }
        }

        Ok(Registry {
            definitions: self.definitions,
            index,
            dependents,
        })
    }
}

fn validate(def: &DatasetDefinition, index: &HashMap<String, usize>) -> Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::InvalidDefinition {
        dataset: def.name.clone(),
        reason: reason.to_string(),
    };

    if def.name.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if def.name.contains("::") {
        return Err(invalid("name must not contain `::`"));
    }

    match (&def.root, def.inputs.is_empty()) {
        (None, true) => return Err(invalid("root datasets must declare a root source")),
        (Some(root), true) if root.is_empty() => return Err(invalid("root source must not be empty")),
        (Some(_), false) => return Err(invalid("derived datasets inherit their root from inputs")),
        _ => {}
    }

    let mut seen = HashSet::new();
    for input in &def.inputs {
        if !index.contains_key(input) {
            return Err(EngineError::UnknownDataset(input.clone()));
        }
        if !seen.insert(input.as_str()) {
            return Err(invalid(&format!("input {} is listed twice", input)));
        }
    }

    Ok(())
}

/// Find a cycle in a graph of `n` nodes, returned as a closed path
/// (first node repeated at the end).
pub(crate) fn find_cycle<F>(n: usize, successors: F) -> Option<Vec<usize>>
where
    F: Fn(usize) -> Vec<usize>,
{
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnPath,
        Done,
    }

    fn visit<F: Fn(usize) -> Vec<usize>>(
        node: usize,
        successors: &F,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        marks[node] = Mark::OnPath;
        path.push(node);
        for next in successors(node) {
            match marks[next] {
                Mark::OnPath => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = visit(next, successors, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::Unvisited; n];
    let mut path = Vec::new();
    for node in 0..n {
        if marks[node] == Mark::Unvisited {
            if let Some(cycle) = visit(node, &successors, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// The validated, immutable set of dataset definitions.
#[derive(Debug)]
pub struct Registry {
    definitions: Vec<DatasetDefinition>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<&DatasetDefinition> {
        self.index.get(name).map(|&i| &self.definitions[i])
    }

    /// Like [`get`](Self::get), failing with [`EngineError::UnknownDataset`].
    pub fn require(&self, name: &str) -> Result<&DatasetDefinition, EngineError> {
        self.get(name)
            .ok_or_else(|| EngineError::UnknownDataset(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Declaration index of a dataset, used to order ties.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Definitions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &DatasetDefinition> {
        self.definitions.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|d| d.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Datasets that list `name` as an input, in declaration order.
    pub fn dependents(&self, name: &str) -> Vec<&DatasetDefinition> {
        match self.index.get(name) {
            Some(&i) => self.dependents[i]
                .iter()
                .map(|&d| &self.definitions[d])
                .collect(),
            None => Vec::new(),
        }
    }

    /// Definitions whose name matches `pattern`, in declaration order.
    pub fn matching(&self, pattern: &DatasetPattern) -> Vec<&DatasetDefinition> {
        self.definitions
            .iter()
            .filter(|d| pattern.matches(&d.name))
            .collect()
    }

    /// Expand names and globs to dataset names in declaration order, without duplicates.
    ///
    /// A literal name that is not registered, or a glob matching nothing,
    /// fails with [`EngineError::UnknownDataset`].
    pub fn expand(&self, patterns: &[DatasetPattern]) -> Result<Vec<String>, EngineError> {
        let mut selected = vec![false; self.definitions.len()];
        for pattern in patterns {
            let mut matched = false;
            for (i, def) in self.definitions.iter().enumerate() {
                if pattern.matches(&def.name) {
                    selected[i] = true;
                    matched = true;
                }
            }
            if !matched {
                return Err(EngineError::UnknownDataset(pattern.to_string()));
            }
        }

        Ok(self
            .definitions
            .iter()
            .zip(selected)
            .filter(|(_, s)| *s)
            .map(|(d, _)| d.name.clone())
            .collect())
    }

    /// `names` plus all of their transitive inputs, in declaration order.
    pub fn closure(&self, names: &[String]) -> Result<Vec<String>, EngineError> {
        let mut selected = vec![false; self.definitions.len()];
        let mut stack = Vec::new();
        for name in names {
            let i = *self
                .index
                .get(name)
                .ok_or_else(|| EngineError::UnknownDataset(name.clone()))?;
            stack.push(i);
        }
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut selected[i], true) {
                continue;
            }
            stack.extend(self.definitions[i].inputs.iter().map(|input| self.index[input]));
        }

        Ok(self
            .definitions
            .iter()
            .zip(selected)
            .filter(|(_, s)| *s)
            .map(|(d, _)| d.name.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::ExternalSource;

    fn root(name: &str) -> DatasetDefinition {
        DatasetDefinition::new(name, DatasetKind::External, "1", ExternalSource::new()).root("2011")
    }

    fn derived(name: &str, inputs: &[&str]) -> DatasetDefinition {
        inputs.iter().fold(
            DatasetDefinition::new(name, DatasetKind::File, "1", ExternalSource::new()),
            |def, input| def.input(*input),
        )
    }

    #[test]
    fn test_build_and_query() {
        let registry = Registry::builder()
            .dataset(root("A"))
            .dataset(derived("B", &["A"]))
            .dataset(derived("C", &["B"]))
            .dataset(derived("D", &["A"]))
            .build()
            .unwrap();

        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["A", "B", "C", "D"]);
        assert_eq!(registry.get("B").unwrap().inputs(), &["A".to_string()]);
        let dependents: Vec<_> = registry.dependents("A").iter().map(|d| d.name()).collect();
        assert_eq!(dependents, vec!["B", "D"]);
        assert!(registry.dependents("C").is_empty());
        assert_eq!(registry.position("D"), Some(3));
    }

    #[test]
    fn test_duplicate_rejected() {
        let err = Registry::builder()
            .dataset(root("A"))
            .dataset(root("A"))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateDataset(name) if name == "A"));
    }

    #[test]
    fn test_unknown_input_rejected() {
        let err = Registry::builder()
            .dataset(derived("B", &["Missing"]))
            .build()
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownDataset(name) if name == "Missing"));
    }

    #[test]
    fn test_cycle_rejected_with_path() {
        let err = Registry::builder()
            .dataset(root("R"))
            .dataset(derived("A", &["C"]))
            .dataset(derived("B", &["A"]))
            .dataset(derived("C", &["B"]))
            .build()
            .unwrap_err();
        match err {
            EngineError::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_root_rules() {
        let no_root = DatasetDefinition::new("A", DatasetKind::External, "1", ExternalSource::new());
        assert!(matches!(
            Registry::builder().dataset(no_root).build(),
            Err(EngineError::InvalidDefinition { .. })
        ));

        let derived_with_root = derived("B", &["A"]).root("2012");
        assert!(matches!(
            Registry::builder()
                .dataset(root("A"))
                .dataset(derived_with_root)
                .build(),
            Err(EngineError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn test_expand_patterns() {
        let registry = Registry::builder()
            .dataset(root("StormOfficial"))
            .dataset(derived("StormFile", &["StormOfficial"]))
            .dataset(derived("Other", &["StormOfficial"]))
            .build()
            .unwrap();

        let patterns = [
            DatasetPattern::new("Other").unwrap(),
            DatasetPattern::new("Storm*").unwrap(),
        ];
        assert_eq!(
            registry.expand(&patterns).unwrap(),
            vec!["StormOfficial", "StormFile", "Other"]
        );

        let nothing = [DatasetPattern::new("Nope*").unwrap()];
        assert!(matches!(
            registry.expand(&nothing),
            Err(EngineError::UnknownDataset(_))
        ));
    }

    #[test]
    fn test_closure() {
        let registry = Registry::builder()
            .dataset(root("A"))
            .dataset(root("X"))
            .dataset(derived("B", &["A"]))
            .dataset(derived("C", &["B", "X"]))
            .build()
            .unwrap();

        assert_eq!(
            registry.closure(&["B".to_string()]).unwrap(),
            vec!["A", "B"]
        );
        assert_eq!(
            registry.closure(&["C".to_string()]).unwrap(),
            vec!["A", "X", "B", "C"]
        );
    }
}
