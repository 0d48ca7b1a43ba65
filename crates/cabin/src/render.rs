//! Plain-text rendering of engine reports for stdout.

use std::fmt::Write;

use cabin_engine::{
    ImportMode, ImportReport, PruneAction, PruneReport, Registry, StatusEntry, StepOutcome,
};

/// `1234567` -> `1,234,567`.
pub fn format_count(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

/// Human-readable byte size with binary units.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

/// Pad every row's cells to the widest cell in their column.
fn table(rows: &[Vec<String>]) -> String {
    let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
    let widths: Vec<usize> = (0..columns)
        .map(|c| {
            rows.iter()
                .filter_map(|r| r.get(c))
                .map(|cell| cell.chars().count())
                .max()
                .unwrap_or(0)
        })
        .collect();

    let mut out = String::new();
    for row in rows {
        let mut line = String::new();
        for (c, cell) in row.iter().enumerate() {
            if c + 1 == row.len() {
                line.push_str(cell);
            } else {
                let _ = write!(line, "{:<width$}  ", cell, width = widths[c]);
            }
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Registered datasets in declaration order.
pub fn list(registry: &Registry, verbose: bool) -> String {
    if !verbose {
        return registry.names().map(|n| format!("{}\n", n)).collect();
    }
    let rows: Vec<Vec<String>> = registry
        .iter()
        .map(|d| {
            let inputs = if d.is_root() {
                format!("root {}", d.root_source().unwrap_or_default())
            } else {
                format!("<- {}", d.inputs().join(", "))
            };
            vec![
                d.name().to_string(),
                d.kind().to_string(),
                format!("v{}", d.version()),
                inputs,
                d.description_text().unwrap_or_default().to_string(),
            ]
        })
        .collect();
    table(&rows)
}

pub fn import(report: &ImportReport) -> String {
    let rows: Vec<Vec<String>> = report
        .steps
        .iter()
        .map(|step| match &step.outcome {
            StepOutcome::Built(v) | StepOutcome::Reused(v) => vec![
                if matches!(step.outcome, StepOutcome::Built(_)) { "built" } else { "reused" }.to_string(),
                step.version.clone(),
                format!("{} rows", format_count(v.row_count)),
                format_bytes(v.byte_size),
            ],
            StepOutcome::WouldBuild => vec!["would build".to_string(), step.version.clone()],
            StepOutcome::Skipped(cause) => {
                vec!["skipped".to_string(), step.version.clone(), cause.to_string()]
            }
        })
        .collect();

    let mut out = table(&rows);
    let verb = match report.mode {
        ImportMode::Execute => "built",
        ImportMode::Simulate => "to build",
    };
    let _ = writeln!(
        out,
        "{} {}, {} reused, {} skipped",
        report.built().count(),
        verb,
        report.reused().count(),
        report.skipped().count()
    );
    out
}

pub fn status(entries: &[StatusEntry]) -> String {
    if entries.is_empty() {
        return "no versions catalogued\n".to_string();
    }
    let mut rows = vec![vec![
        "SEQ".to_string(),
        "VERSION".to_string(),
        "STATE".to_string(),
        "ROWS".to_string(),
        "SIZE".to_string(),
        "IN".to_string(),
        "OUT".to_string(),
        "CREATED".to_string(),
    ]];
    rows.extend(entries.iter().map(|e| {
        vec![
            format!("#{}", e.version.seq),
            e.version.display_name(),
            e.freshness.to_string(),
            format_count(e.version.row_count),
            format_bytes(e.version.byte_size),
            e.input_count.to_string(),
            e.output_count.to_string(),
            e.version.created_at.format("%Y-%m-%d %H:%M").to_string(),
        ]
    }));
    table(&rows)
}

pub fn prune(report: &PruneReport) -> String {
    if report.entries.is_empty() {
        return "nothing to prune\n".to_string();
    }
    let remove = if report.dry_run { "would remove" } else { "removed" };
    let rows: Vec<Vec<String>> = report
        .entries
        .iter()
        .map(|e| match &e.action {
            PruneAction::Remove => vec![remove.to_string(), e.version.display_name()],
            PruneAction::Blocked { dependents } => vec![
                "kept".to_string(),
                e.version.display_name(),
                format!("used by {}", dependents.join(", ")),
            ],
            PruneAction::Failed { error } => {
                vec!["failed".to_string(), e.version.display_name(), error.clone()]
            }
        })
        .collect();

    let mut out = table(&rows);
    let _ = writeln!(
        out,
        "{} {}, {} kept, {} failed",
        report.removed().count(),
        remove,
        report.blocked().count(),
        report.failed().count()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabin_engine::{Freshness, SkipCause, StepReport};
    use cabin_store::{DatasetKind, Fingerprint, VersionKey, VersionRecord};
    use pretty_assertions::assert_eq;

    fn record(seq: u64, dataset: &str) -> VersionRecord {
        VersionRecord {
            seq,
            key: VersionKey::new(dataset, "2011", Fingerprint::from_hex("abcdef0123456789")),
            kind: DatasetKind::File,
            formula: String::new(),
            row_count: 48_123,
            byte_size: 3 * 1024 * 1024,
            inputs: Vec::new(),
            created_at: Default::default(),
        }
    }

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1_234_567), "1,234,567");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_table_aligns_columns() {
        let rows = vec![
            vec!["a".to_string(), "long".to_string(), "x".to_string()],
            vec!["bbb".to_string(), "s".to_string(), "y".to_string()],
        ];
        assert_eq!(table(&rows), "a    long  x\nbbb  s     y\n");
    }

    #[test]
    fn test_import_report() {
        let report = ImportReport {
            mode: ImportMode::Execute,
            steps: vec![
                StepReport {
                    dataset: "A".to_string(),
                    version: "A::2011::abcdef01".to_string(),
                    outcome: StepOutcome::Built(record(1, "A")),
                },
                StepReport {
                    dataset: "B".to_string(),
                    version: "B::2011::abcdef01".to_string(),
                    outcome: StepOutcome::Skipped(SkipCause::UpstreamFailed("A".to_string())),
                },
            ],
        };

        let out = import(&report);
        let built: Vec<&str> = out.lines().next().unwrap().split_whitespace().collect();
        assert_eq!(built, vec!["built", "A::2011::abcdef01", "48,123", "rows", "3.0", "MiB"]);
        assert!(out.contains("skipped  B::2011::abcdef01  input A not available"));
        assert!(out.ends_with("1 built, 0 reused, 1 skipped\n"));
    }

    #[test]
    fn test_status_report() {
        let entries = vec![StatusEntry {
            version: record(7, "Storm"),
            freshness: Freshness::Outdated,
            input_count: 1,
            output_count: 0,
        }];

        let out = status(&entries);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("SEQ"));
        assert!(lines[1].starts_with("#7   Storm::2011::abcdef01  outdated"));
        assert_eq!(status(&[]), "no versions catalogued\n");
    }

    #[test]
    fn test_prune_report() {
        let report = PruneReport {
            dry_run: true,
            entries: vec![
                cabin_engine::PruneEntry {
                    version: record(1, "A"),
                    action: PruneAction::Blocked {
                        dependents: vec!["B::2011::abcdef01".to_string()],
                    },
                },
                cabin_engine::PruneEntry {
                    version: record(3, "C"),
                    action: PruneAction::Remove,
                },
            ],
        };

        let out = prune(&report);
        assert!(out.contains("kept          A::2011::abcdef01  used by B::2011::abcdef01"));
        assert!(out.contains("would remove  C::2011::abcdef01"));
        assert!(out.ends_with("1 would remove, 1 kept, 0 failed\n"));
    }
}
