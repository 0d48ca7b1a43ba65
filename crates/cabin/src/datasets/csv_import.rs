//! Importing a CSV file into a table, record by record.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use cabin_engine::{BuildContext, Cancellation, ProducedArtifact, TransformError, Transformation};
use cabin_store::{ArtifactLocation, TableStore};
use tracing::{debug, info};

/// Records inserted per transaction.
const BATCH_ROWS: usize = 5_000;

/// Reads the single file input as CSV and loads the declared columns into a
/// table of text columns.
///
/// Header names are matched case-insensitively. A column can be fed from a
/// differently named header with [`map_field`](Self::map_field); headers that
/// are not declared are ignored.
pub struct CsvTableImport {
    tables: Arc<TableStore>,
    columns: Vec<String>,
    /// Column name -> source header.
    fields: BTreeMap<String, String>,
}

impl CsvTableImport {
    pub fn new(tables: Arc<TableStore>, columns: &[&str]) -> Self {
        Self {
            tables,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            fields: BTreeMap::new(),
        }
    }

    /// Fill `column` from the header named `header`.
    pub fn map_field(mut self, header: impl Into<String>, column: impl Into<String>) -> Self {
        self.fields.insert(column.into(), header.into());
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Header each column is read from.
    fn sources(&self) -> Vec<String> {
        self.columns
            .iter()
            .map(|c| self.fields.get(c).unwrap_or(c).to_lowercase())
            .collect()
    }
}

#[async_trait]
impl Transformation for CsvTableImport {
    async fn produce(&self, ctx: &BuildContext) -> Result<ProducedArtifact, TransformError> {
        let ArtifactLocation::Table(table) = &ctx.output else {
            return Err(TransformError::Failed(format!(
                "{} imports into a table, not {:?}",
                ctx.dataset(),
                ctx.output
            )));
        };
        let input = ctx.sole_input()?;
        let ArtifactLocation::File(source) = &input.location else {
            return Err(TransformError::Failed(format!(
                "{} reads a file, but input {} is {:?}",
                ctx.dataset(),
                input.dataset,
                input.location
            )));
        };

        let load = Load {
            tables: Arc::clone(&self.tables),
            table: table.clone(),
            source: source.clone(),
            columns: self.columns.clone(),
            sources: self.sources(),
            cancel: ctx.cancel.clone(),
        };

        let row_count = tokio::task::spawn_blocking(move || load.run())
            .await
            .map_err(|e| TransformError::Failed(format!("import task failed: {}", e)))??;

        let byte_size = self.tables.table_size(table)?;
        info!(dataset = %ctx.dataset(), table = %table, rows = row_count, "imported");
        Ok(ProducedArtifact { row_count, byte_size })
    }

    async fn check(&self, ctx: &BuildContext, artifact: &ProducedArtifact) -> Result<(), TransformError> {
        let ArtifactLocation::Table(table) = &ctx.output else {
            return Ok(());
        };
        if artifact.row_count == 0 {
            return Err(TransformError::Check(format!("{} imported no rows", ctx.dataset())));
        }
        let stored = self.tables.row_count(table)?;
        if stored != artifact.row_count {
            return Err(TransformError::Check(format!(
                "{} reported {} rows but the table holds {}",
                ctx.dataset(),
                artifact.row_count,
                stored
            )));
        }
        Ok(())
    }

    fn formula_content(&self) -> Option<serde_json::Value> {
        Some(serde_json::json!({
            "columns": self.columns,
            "fields": self.fields,
        }))
    }
}

/// One CSV-to-table load, run on a blocking thread.
struct Load {
    tables: Arc<TableStore>,
    table: String,
    source: std::path::PathBuf,
    columns: Vec<String>,
    /// Header each column is read from.
    sources: Vec<String>,
    cancel: Cancellation,
}

impl Load {
    /// Stream records into the table in batches, stopping between batches
    /// once cancelled. The table is only created after the header matched.
    fn run(self) -> Result<u64, TransformError> {
        let path = self.source.as_path();
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| csv_error(path, e))?;
        let indices = header_indices(&mut reader, path, &self.sources)?;

        let names: Vec<&str> = self.columns.iter().map(String::as_str).collect();
        self.tables.create_table(&self.table, &names)?;

        let mut inserted = 0u64;
        let mut batch: Vec<Vec<String>> = Vec::with_capacity(BATCH_ROWS);
        for record in reader.records() {
            let record = record.map_err(|e| csv_error(path, e))?;
            batch.push(
                indices
                    .iter()
                    .map(|i| record.get(*i).unwrap_or_default().to_string())
                    .collect(),
            );
            if batch.len() == BATCH_ROWS {
                self.cancel.check()?;
                inserted += self.tables.insert_rows(&self.table, &names, batch.drain(..))?;
                debug!(table = %self.table, rows = inserted, "inserted batch");
            }
        }
        self.cancel.check()?;
        inserted += self.tables.insert_rows(&self.table, &names, batch)?;
        Ok(inserted)
    }
}

/// Position of each source header, matched trimmed and case-insensitively.
fn header_indices(
    reader: &mut csv::Reader<std::fs::File>,
    path: &Path,
    sources: &[String],
) -> Result<Vec<usize>, TransformError> {
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| csv_error(path, e))?
        .iter()
        .map(|h| h.trim().to_lowercase())
        .collect();
    let indices = sources
        .iter()
        .map(|source| {
            headers
                .iter()
                .position(|h| h == source)
                .ok_or_else(|| TransformError::Failed(format!("{}: no `{}` column", path.display(), source)))
        })
        .collect::<Result<Vec<usize>, _>>()?;
    debug!(path = %path.display(), columns = indices.len(), "matched header");
    Ok(indices)
}

fn csv_error(path: &Path, e: csv::Error) -> TransformError {
    TransformError::Failed(format!("{}: {}", path.display(), e))
}
