//! SQLite data store holding imported tables.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params_from_iter};
use tracing::{debug, info};

use crate::error::StoreError;

/// Maximum table name length (kept compatible with MySQL's identifier limit).
pub const MAX_TABLE_NAME_LEN: usize = 64;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// SQLite database holding one table per imported table version.
pub struct TableStore {
    conn: Mutex<Connection>,
}

impl TableStore {
    /// Open or create the data store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        info!(path = %path.display(), "table store initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open a private in-memory data store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Reject names that exceed [`MAX_TABLE_NAME_LEN`].
    pub fn validate_name(name: &str) -> Result<(), StoreError> {
        if name.chars().count() > MAX_TABLE_NAME_LEN {
            return Err(StoreError::TableNameTooLong {
                name: name.to_string(),
                max: MAX_TABLE_NAME_LEN,
            });
        }
        Ok(())
    }

    /// Create a table of text columns, replacing any leftover of the same name.
    pub fn create_table(&self, name: &str, columns: &[&str]) -> Result<(), StoreError> {
        Self::validate_name(name)?;
        let cols = columns
            .iter()
            .map(|c| format!("{} TEXT NOT NULL", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({cols});",
            table = quote_ident(name),
            cols = cols,
        ))?;
        debug!(table = %name, columns = columns.len(), "created table");
        Ok(())
    }

    /// Insert rows in a single transaction. Each row must have one value per column.
    pub fn insert_rows<I>(&self, name: &str, columns: &[&str], rows: I) -> Result<u64, StoreError>
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(name),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            (1..=columns.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", "),
        );

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut inserted = 0u64;
        {
            let mut stmt = tx.prepare(&sql)?;
            for row in rows {
                stmt.execute(params_from_iter(row.iter()))?;
                inserted += 1;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Whether a table exists.
    pub fn table_exists(&self, name: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Exact number of rows in a table.
    pub fn row_count(&self, name: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(name)),
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Approximate on-disk size of a table in bytes.
    ///
    /// Uses the `dbstat` virtual table; returns 0 where it is unavailable.
    pub fn table_size(&self, name: &str) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let size: Result<Option<i64>, rusqlite::Error> = conn.query_row(
            "SELECT SUM(pgsize) FROM dbstat WHERE name = ?1",
            [name],
            |row| row.get(0),
        );
        match size {
            Ok(size) => Ok(size.unwrap_or(0).max(0) as u64),
            Err(e) => {
                debug!(table = %name, error = %e, "dbstat unavailable, reporting size 0");
                Ok(0)
            }
        }
    }

    /// Rename a table.
    pub fn rename_table(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(&format!(
            "ALTER TABLE {} RENAME TO {};",
            quote_ident(from),
            quote_ident(to)
        ))?;
        Ok(())
    }

    /// Drop a table if it exists.
    pub fn drop_table(&self, name: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(name)))?;
        debug!(table = %name, "dropped table");
        Ok(())
    }
}

/// Quote an SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
