//! Drawing the dataset dependency graph.

use std::collections::{HashSet, VecDeque};
use std::fmt::Write;

use cabin_engine::{DatasetDefinition, DatasetPattern, EngineError, Registry};
use cabin_store::DatasetKind;

/// Datasets matching `patterns` together with their ancestors and
/// descendants, in declaration order. Everything when `patterns` is empty.
pub fn neighbourhood(registry: &Registry, patterns: &[DatasetPattern]) -> Result<Vec<String>, EngineError> {
    if patterns.is_empty() {
        return Ok(registry.names().map(str::to_string).collect());
    }

    let matched = registry.expand(patterns)?;
    let mut selected: HashSet<String> = registry.closure(&matched)?.into_iter().collect();
    let mut queue: VecDeque<&str> = matched.iter().map(String::as_str).collect();
    while let Some(name) = queue.pop_front() {
        for dependent in registry.dependents(name) {
            if selected.insert(dependent.name().to_string()) {
                queue.push_back(dependent.name());
            }
        }
    }

    Ok(registry
        .names()
        .filter(|n| selected.contains(*n))
        .map(str::to_string)
        .collect())
}

fn label(def: &DatasetDefinition) -> String {
    match def.root_source() {
        Some(root) => format!("{} [{}, root {}]", def.name(), def.kind(), root),
        None => format!("{} [{}]", def.name(), def.kind()),
    }
}

/// Indented tree from each selected dataset without selected inputs down
/// through its dependents. A dataset reached twice is drawn once.
pub fn tree(registry: &Registry, selected: &[String]) -> String {
    let included: HashSet<&str> = selected.iter().map(String::as_str).collect();
    let mut drawn = HashSet::new();
    let mut out = String::new();

    for name in selected {
        let Some(def) = registry.get(name) else { continue };
        if def.inputs().iter().any(|i| included.contains(i.as_str())) {
            continue;
        }
        let _ = writeln!(out, "{}", label(def));
        drawn.insert(def.name());
        draw_children(registry, def, &included, &mut drawn, "", &mut out);
    }
    out
}

fn draw_children<'r>(
    registry: &'r Registry,
    parent: &DatasetDefinition,
    included: &HashSet<&str>,
    drawn: &mut HashSet<&'r str>,
    prefix: &str,
    out: &mut String,
) {
    let children: Vec<&DatasetDefinition> = registry
        .dependents(parent.name())
        .into_iter()
        .filter(|d| included.contains(d.name()))
        .collect();

    for (i, child) in children.iter().enumerate() {
        let last = i + 1 == children.len();
        let (branch, indent) = if last { ("└── ", "    ") } else { ("├── ", "│   ") };
        if !drawn.insert(child.name()) {
            let _ = writeln!(out, "{}{}{} (see above)", prefix, branch, child.name());
            continue;
        }
        let _ = writeln!(out, "{}{}{}", prefix, branch, label(child));
        draw_children(registry, child, included, drawn, &format!("{}{}", prefix, indent), out);
    }
}

/// Graphviz DOT with an edge from each input to its consumer.
pub fn dot(registry: &Registry, selected: &[String]) -> String {
    let included: HashSet<&str> = selected.iter().map(String::as_str).collect();
    let mut out = String::from("digraph cabin {\n    rankdir=LR;\n");

    for name in selected {
        let Some(def) = registry.get(name) else { continue };
        let shape = match def.kind() {
            DatasetKind::External => "ellipse",
            DatasetKind::File => "note",
            DatasetKind::Table => "box",
        };
        let _ = writeln!(
            out,
            "    \"{}\" [shape={}, label=\"{}\\n{}\"];",
            def.name(),
            shape,
            def.name(),
            def.kind()
        );
    }
    for name in selected {
        let Some(def) = registry.get(name) else { continue };
        for input in def.inputs().iter().filter(|i| included.contains(i.as_str())) {
            let _ = writeln!(out, "    \"{}\" -> \"{}\";", input, def.name());
        }
    }
    out.push_str("}\n");
    out
}
