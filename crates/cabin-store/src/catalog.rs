//! SQLite-backed version catalog.
//!
//! One row per produced version in `cabin_versions`, and one row per consumed
//! input in `cabin_version_inputs`. Foreign keys are enforced, so the catalog
//! itself refuses to delete a version that another version lists as an input.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params};
use tracing::{debug, info};

use crate::error::CatalogError;
use crate::types::{DatasetKind, Fingerprint, NewVersion, VersionKey, VersionRecord};

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cabin_versions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        dataset TEXT NOT NULL,
        kind TEXT NOT NULL,
        root TEXT NOT NULL,
        fingerprint TEXT NOT NULL,
        formula TEXT NOT NULL,
        row_count INTEGER NOT NULL DEFAULT 0,
        byte_size INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        UNIQUE (dataset, root, fingerprint)
    );
    CREATE INDEX IF NOT EXISTS idx_versions_dataset ON cabin_versions(dataset);

    CREATE TABLE IF NOT EXISTS cabin_version_inputs (
        version_seq INTEGER NOT NULL REFERENCES cabin_versions(seq) ON DELETE CASCADE,
        input_seq INTEGER NOT NULL REFERENCES cabin_versions(seq) ON DELETE RESTRICT,
        position INTEGER NOT NULL,
        PRIMARY KEY (version_seq, position)
    );
    CREATE INDEX IF NOT EXISTS idx_inputs_input ON cabin_version_inputs(input_seq);
";

const SELECT_VERSION: &str = "SELECT seq, dataset, kind, root, fingerprint, formula, row_count, byte_size, created_at
     FROM cabin_versions";

/// The version catalog.
pub struct Catalog {
    conn: Mutex<Connection>,
}

/// A version row before its input edges are attached.
struct RawVersion {
    seq: i64,
    dataset: String,
    kind: String,
    root: String,
    fingerprint: String,
    formula: String,
    row_count: i64,
    byte_size: i64,
    created_at: String,
}

impl RawVersion {
    fn from_row(row: &rusqlite::Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            seq: row.get(0)?,
            dataset: row.get(1)?,
            kind: row.get(2)?,
            root: row.get(3)?,
            fingerprint: row.get(4)?,
            formula: row.get(5)?,
            row_count: row.get(6)?,
            byte_size: row.get(7)?,
            created_at: row.get(8)?,
        })
    }

    fn decode(self, inputs: Vec<u64>) -> Result<VersionRecord, CatalogError> {
        let seq = self.seq as u64;
        let kind = self
            .kind
            .parse::<DatasetKind>()
            .map_err(|reason| CatalogError::Corrupt { seq, reason })?;
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| CatalogError::Corrupt {
                seq,
                reason: format!("bad created_at: {}", e),
            })?
            .with_timezone(&Utc);

        Ok(VersionRecord {
            seq,
            key: VersionKey::new(self.dataset, self.root, Fingerprint::from_hex(self.fingerprint)),
            kind,
            formula: self.formula,
            row_count: self.row_count.max(0) as u64,
            byte_size: self.byte_size.max(0) as u64,
            inputs,
            created_at,
        })
    }
}

impl Catalog {
    /// Open or create the catalog database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;

        // WAL lets status readers proceed while an import holds the write lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let catalog = Self::init(conn)?;
        info!(path = %path.display(), "catalog initialized");
        Ok(catalog)
    }

    /// Open a private in-memory catalog.
    pub fn open_in_memory() -> Result<Self, CatalogError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, CatalogError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, CatalogError> {
        self.conn.lock().map_err(|_| CatalogError::Poisoned)
    }

    /// Look up a version by identity triple.
    pub fn find(&self, key: &VersionKey) -> Result<Option<VersionRecord>, CatalogError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "{} WHERE dataset = ?1 AND root = ?2 AND fingerprint = ?3",
                    SELECT_VERSION
                ),
                params![key.dataset, key.root, key.fingerprint.as_str()],
                RawVersion::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => {
                let inputs = input_seqs(&conn, raw.seq)?;
                raw.decode(inputs).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Look up a version by sequence number.
    pub fn get(&self, seq: u64) -> Result<Option<VersionRecord>, CatalogError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("{} WHERE seq = ?1", SELECT_VERSION),
                params![seq as i64],
                RawVersion::from_row,
            )
            .optional()?;

        match raw {
            Some(raw) => {
                let inputs = input_seqs(&conn, raw.seq)?;
                raw.decode(inputs).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Record a new version and its input edges atomically.
    ///
    /// Fails with [`CatalogError::Conflict`] if the identity triple is already
    /// present, and with [`CatalogError::UnknownInput`] if an input reference
    /// does not exist.
    pub fn insert(&self, new: &NewVersion) -> Result<VersionRecord, CatalogError> {
        let version_name = new.key.display_name();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if key_seq(&tx, &new.key)?.is_some() {
            return Err(CatalogError::Conflict(version_name));
        }
        for input in &new.inputs {
            if !seq_exists(&tx, *input)? {
                return Err(CatalogError::UnknownInput(*input));
            }
        }

        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let inserted = tx.execute(
            "INSERT INTO cabin_versions
             (dataset, kind, root, fingerprint, formula, row_count, byte_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                new.key.dataset,
                new.kind.as_str(),
                new.key.root,
                new.key.fingerprint.as_str(),
                new.formula,
                new.row_count as i64,
                new.byte_size as i64,
                created_at,
            ],
        );
        if let Err(e) = inserted {
            return Err(match e.sqlite_error_code() {
                Some(ErrorCode::ConstraintViolation) => CatalogError::Conflict(version_name),
                _ => e.into(),
            });
        }
        let seq = tx.last_insert_rowid();

        for (position, input) in new.inputs.iter().enumerate() {
            tx.execute(
                "INSERT INTO cabin_version_inputs (version_seq, input_seq, position)
                 VALUES (?1, ?2, ?3)",
                params![seq, *input as i64, position as i64],
            )?;
        }

        let raw = tx.query_row(
            &format!("{} WHERE seq = ?1", SELECT_VERSION),
            params![seq],
            RawVersion::from_row,
        )?;
        tx.commit()?;

        debug!(seq, version = %version_name, "recorded version");
        raw.decode(new.inputs.clone())
    }

    /// Delete a version row.
    ///
    /// Refuses with [`CatalogError::Referenced`] while any other version lists
    /// it as an input.
    pub fn remove(&self, seq: u64) -> Result<(), CatalogError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !seq_exists(&tx, seq)? {
            return Err(CatalogError::NotFound(seq));
        }
        let dependents = dependent_seqs(&tx, seq)?;
        if !dependents.is_empty() {
            return Err(CatalogError::Referenced { seq, dependents });
        }

        tx.execute(
            "DELETE FROM cabin_versions WHERE seq = ?1",
            params![seq as i64],
        )?;
        tx.commit()?;

        debug!(seq, "removed version");
        Ok(())
    }

    /// Read every version and edge within a single read transaction.
    pub fn snapshot(&self) -> Result<CatalogSnapshot, CatalogError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let raws = {
            let mut stmt = tx.prepare(&format!("{} ORDER BY seq", SELECT_VERSION))?;
            stmt.query_map([], RawVersion::from_row)?
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut edges: HashMap<i64, Vec<u64>> = HashMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT version_seq, input_seq FROM cabin_version_inputs
                 ORDER BY version_seq, position",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (version, input) = row?;
                edges.entry(version).or_default().push(input as u64);
            }
        }
        tx.commit()?;

        let records = raws
            .into_iter()
            .map(|raw| {
                let inputs = edges.remove(&raw.seq).unwrap_or_default();
                raw.decode(inputs)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(CatalogSnapshot::from_records(records))
    }

    /// Number of versions in the catalog.
    pub fn len(&self) -> Result<usize, CatalogError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cabin_versions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Whether the catalog holds no versions.
    pub fn is_empty(&self) -> Result<bool, CatalogError> {
        Ok(self.len()? == 0)
    }
}

fn key_seq(tx: &Transaction<'_>, key: &VersionKey) -> Result<Option<i64>, rusqlite::Error> {
    tx.query_row(
        "SELECT seq FROM cabin_versions WHERE dataset = ?1 AND root = ?2 AND fingerprint = ?3",
        params![key.dataset, key.root, key.fingerprint.as_str()],
        |row| row.get(0),
    )
    .optional()
}

fn seq_exists(tx: &Transaction<'_>, seq: u64) -> Result<bool, rusqlite::Error> {
    let found: Option<i64> = tx
        .query_row(
            "SELECT seq FROM cabin_versions WHERE seq = ?1",
            params![seq as i64],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn dependent_seqs(conn: &Connection, seq: u64) -> Result<Vec<u64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT version_seq FROM cabin_version_inputs WHERE input_seq = ?1 ORDER BY version_seq",
    )?;
    let rows = stmt
        .query_map(params![seq as i64], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|s| s as u64).collect())
}

fn input_seqs(conn: &Connection, seq: i64) -> Result<Vec<u64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT input_seq FROM cabin_version_inputs WHERE version_seq = ?1 ORDER BY position",
    )?;
    let rows = stmt
        .query_map(params![seq], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|s| s as u64).collect())
}

/// A consistent, in-memory view of the catalog.
///
/// Besides the rows themselves it indexes identity triples and the reverse
/// input edges ("outputs" of a version).
#[derive(Debug, Clone, Default)]
pub struct CatalogSnapshot {
    versions: BTreeMap<u64, VersionRecord>,
    by_key: HashMap<VersionKey, u64>,
    dependents: HashMap<u64, Vec<u64>>,
}

impl CatalogSnapshot {
    /// Build a snapshot from records, e.g. for planning against a fixture.
    pub fn from_records(records: impl IntoIterator<Item = VersionRecord>) -> Self {
        let mut snapshot = Self::default();
        for record in records {
            for input in &record.inputs {
                snapshot
                    .dependents
                    .entry(*input)
                    .or_default()
                    .push(record.seq);
            }
            snapshot.by_key.insert(record.key.clone(), record.seq);
            snapshot.versions.insert(record.seq, record);
        }
        for dependents in snapshot.dependents.values_mut() {
            dependents.sort_unstable();
            dependents.dedup();
        }
        snapshot
    }

    /// All versions ordered by sequence number.
    pub fn iter(&self) -> impl Iterator<Item = &VersionRecord> {
        self.versions.values()
    }

    pub fn get(&self, seq: u64) -> Option<&VersionRecord> {
        self.versions.get(&seq)
    }

    /// Look up a version by identity triple.
    pub fn find(&self, key: &VersionKey) -> Option<&VersionRecord> {
        self.by_key.get(key).and_then(|seq| self.versions.get(seq))
    }

    /// Versions that list `seq` among their inputs, ordered by sequence number.
    pub fn dependents(&self, seq: u64) -> &[u64] {
        self.dependents.get(&seq).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All versions of one dataset, oldest first.
    pub fn versions_of<'a>(&'a self, dataset: &'a str) -> impl Iterator<Item = &'a VersionRecord> + 'a {
        self.versions
            .values()
            .filter(move |v| v.key.dataset == dataset)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_version(dataset: &str, root: &str, formula: &str, inputs: Vec<u64>) -> NewVersion {
        NewVersion {
            key: VersionKey::new(dataset, root, Fingerprint::of(formula.as_bytes())),
            kind: DatasetKind::Table,
            formula: formula.to_string(),
            row_count: 10,
            byte_size: 4096,
            inputs,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let catalog = Catalog::open_in_memory().unwrap();
        let record = catalog.insert(&new_version("A", "2011", "a1", vec![])).unwrap();

        assert_eq!(record.seq, 1);
        assert_eq!(record.row_count, 10);
        let found = catalog.find(&record.key).unwrap().unwrap();
        assert_eq!(found, record);
        assert_eq!(catalog.get(1).unwrap().unwrap(), record);
    }

    #[test]
    fn test_duplicate_identity_conflicts() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog.insert(&new_version("A", "2011", "a1", vec![])).unwrap();
        let err = catalog
            .insert(&new_version("A", "2011", "a1", vec![]))
            .unwrap_err();

        assert!(matches!(err, CatalogError::Conflict(_)));
        assert_eq!(catalog.len().unwrap(), 1);
    }

    #[test]
    fn test_unknown_input_rejected() {
        let catalog = Catalog::open_in_memory().unwrap();
        let err = catalog
            .insert(&new_version("B", "2011", "b1", vec![7]))
            .unwrap_err();
        assert!(matches!(err, CatalogError::UnknownInput(7)));
        assert!(catalog.is_empty().unwrap());
    }

    #[test]
    fn test_sequence_never_reused() {
        let catalog = Catalog::open_in_memory().unwrap();
        let a = catalog.insert(&new_version("A", "2011", "a1", vec![])).unwrap();
        catalog.remove(a.seq).unwrap();
        let b = catalog.insert(&new_version("A", "2011", "a1", vec![])).unwrap();
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_remove_referenced_version_refused() {
        let catalog = Catalog::open_in_memory().unwrap();
        let a = catalog.insert(&new_version("A", "2011", "a1", vec![])).unwrap();
        let b = catalog
            .insert(&new_version("B", "2011", "b1", vec![a.seq]))
            .unwrap();

        let err = catalog.remove(a.seq).unwrap_err();
        match err {
            CatalogError::Referenced { seq, dependents } => {
                assert_eq!(seq, a.seq);
                assert_eq!(dependents, vec![b.seq]);
            }
            other => panic!("expected Referenced, got {:?}", other),
        }

        catalog.remove(b.seq).unwrap();
        catalog.remove(a.seq).unwrap();
        assert!(catalog.is_empty().unwrap());
    }

    #[test]
    fn test_remove_missing() {
        let catalog = Catalog::open_in_memory().unwrap();
        assert!(matches!(catalog.remove(3), Err(CatalogError::NotFound(3))));
    }

    #[test]
    fn test_snapshot_edges() {
        let catalog = Catalog::open_in_memory().unwrap();
        let a = catalog.insert(&new_version("A", "2011", "a1", vec![])).unwrap();
        let b = catalog.insert(&new_version("B", "2011", "b1", vec![])).unwrap();
        let c = catalog
            .insert(&new_version("C", "2011", "c1", vec![b.seq, a.seq]))
            .unwrap();

        let snapshot = catalog.snapshot().unwrap();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.get(c.seq).unwrap().inputs, vec![b.seq, a.seq]);
        assert_eq!(snapshot.dependents(a.seq), &[c.seq]);
        assert_eq!(snapshot.dependents(c.seq), &[] as &[u64]);
        assert_eq!(snapshot.find(&b.key).unwrap().seq, b.seq);

        let seqs: Vec<u64> = snapshot.iter().map(|v| v.seq).collect();
        assert_eq!(seqs, vec![a.seq, b.seq, c.seq]);
    }
}
