//! Artifact storage.
//!
//! Artifacts are addressed by version identity: a file artifact lives at
//! `<downloads>/<display name>`, a table artifact is the table named after the
//! display name. Removal is two-phase so the catalog row can be deleted between
//! staging and destruction (see [`ArtifactStore::stage_removal`]).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::tables::TableStore;
use crate::types::{DatasetKind, VersionKey};

/// Suffix appended to files staged for removal.
const FILE_TOMBSTONE_SUFFIX: &str = ".pruning";

/// Prefix of tables staged for removal.
const TABLE_TRASH_PREFIX: &str = "_pruning_";

/// Where an artifact lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactLocation {
    /// Nothing is stored locally (external sources).
    Nothing,
    /// A local file.
    File(PathBuf),
    /// A table in the data store.
    Table(String),
}

/// An artifact moved out of the way but not yet destroyed.
#[derive(Debug)]
pub struct StagedRemoval {
    original: ArtifactLocation,
    staged: Option<ArtifactLocation>,
}

impl StagedRemoval {
    /// Where the artifact lived before staging.
    pub fn original(&self) -> &ArtifactLocation {
        &self.original
    }

    /// Whether there was anything to stage (the artifact may already be gone).
    pub fn is_empty(&self) -> bool {
        self.staged.is_none()
    }
}

/// Storage for the artifacts that versions describe.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Location of the artifact for `key`.
    fn locate(&self, key: &VersionKey, kind: DatasetKind) -> Result<ArtifactLocation, StoreError>;

    /// Whether an artifact is present at `location`.
    async fn exists(&self, location: &ArtifactLocation) -> Result<bool, StoreError>;

    /// Remove whatever (possibly partial) output is at `location`. Idempotent.
    async fn discard(&self, location: &ArtifactLocation) -> Result<(), StoreError>;

    /// Move the artifact aside so it can be either destroyed or restored.
    ///
    /// Callers delete the catalog row after staging and before
    /// [`finish_removal`](Self::finish_removal), and call
    /// [`restore`](Self::restore) if the row deletion fails. A catalog row
    /// therefore never outlives its artifact.
    async fn stage_removal(&self, location: &ArtifactLocation) -> Result<StagedRemoval, StoreError>;

    /// Destroy a staged artifact.
    async fn finish_removal(&self, staged: StagedRemoval) -> Result<(), StoreError>;

    /// Put a staged artifact back where it was.
    async fn restore(&self, staged: StagedRemoval) -> Result<(), StoreError>;
}

/// Files under a downloads directory plus tables in a SQLite data store.
pub struct LocalArtifactStore {
    downloads: PathBuf,
    tables: Arc<TableStore>,
}

impl LocalArtifactStore {
    pub fn new(downloads: impl Into<PathBuf>, tables: Arc<TableStore>) -> Self {
        Self {
            downloads: downloads.into(),
            tables,
        }
    }

    /// Directory holding file artifacts.
    pub fn downloads_dir(&self) -> &Path {
        &self.downloads
    }

    /// The table data store.
    pub fn tables(&self) -> &Arc<TableStore> {
        &self.tables
    }

    /// Create the downloads directory if needed.
    pub async fn ensure_dirs(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.downloads).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    fn locate(&self, key: &VersionKey, kind: DatasetKind) -> Result<ArtifactLocation, StoreError> {
        let name = key.display_name();
        Ok(match kind {
            DatasetKind::External => ArtifactLocation::Nothing,
            DatasetKind::File => ArtifactLocation::File(self.downloads.join(name)),
            DatasetKind::Table => {
                TableStore::validate_name(&name)?;
                ArtifactLocation::Table(name)
            }
        })
    }

    async fn exists(&self, location: &ArtifactLocation) -> Result<bool, StoreError> {
        match location {
            ArtifactLocation::Nothing => Ok(true),
            ArtifactLocation::File(path) => Ok(tokio::fs::try_exists(path).await?),
            ArtifactLocation::Table(name) => self.tables.table_exists(name),
        }
    }

    async fn discard(&self, location: &ArtifactLocation) -> Result<(), StoreError> {
        match location {
            ArtifactLocation::Nothing => Ok(()),
            ArtifactLocation::File(path) => {
                if tokio::fs::try_exists(path).await? {
                    remove_path(path).await?;
                    debug!(path = %path.display(), "discarded partial file");
                }
                Ok(())
            }
            ArtifactLocation::Table(name) => self.tables.drop_table(name),
        }
    }

    async fn stage_removal(&self, location: &ArtifactLocation) -> Result<StagedRemoval, StoreError> {
        let staged = match location {
            ArtifactLocation::Nothing => None,
            ArtifactLocation::File(path) => {
                if tokio::fs::try_exists(path).await? {
                    let tombstone = tombstone_path(path)?;
                    tokio::fs::rename(path, &tombstone).await?;
                    Some(ArtifactLocation::File(tombstone))
                } else {
                    warn!(path = %path.display(), "artifact file already missing");
                    None
                }
            }
            ArtifactLocation::Table(name) => {
                if self.tables.table_exists(name)? {
                    let trash = format!("{}{}", TABLE_TRASH_PREFIX, name);
                    self.tables.drop_table(&trash)?;
                    self.tables.rename_table(name, &trash)?;
                    Some(ArtifactLocation::Table(trash))
                } else {
                    warn!(table = %name, "artifact table already missing");
                    None
                }
            }
        };

        Ok(StagedRemoval {
            original: location.clone(),
            staged,
        })
    }

    async fn finish_removal(&self, staged: StagedRemoval) -> Result<(), StoreError> {
        match staged.staged {
            None | Some(ArtifactLocation::Nothing) => Ok(()),
            Some(ArtifactLocation::File(path)) => remove_path(&path).await,
            Some(ArtifactLocation::Table(name)) => self.tables.drop_table(&name),
        }
    }

    async fn restore(&self, staged: StagedRemoval) -> Result<(), StoreError> {
        match (staged.staged, staged.original) {
            (None, _) | (Some(ArtifactLocation::Nothing), _) => Ok(()),
            (Some(ArtifactLocation::File(from)), ArtifactLocation::File(to)) => {
                tokio::fs::rename(&from, &to).await?;
                Ok(())
            }
            (Some(ArtifactLocation::Table(from)), ArtifactLocation::Table(to)) => {
                self.tables.rename_table(&from, &to)
            }
            (staged, original) => Err(StoreError::InvalidLocation(format!(
                "cannot restore {:?} to {:?}",
                staged, original
            ))),
        }
    }
}

fn tombstone_path(path: &Path) -> Result<PathBuf, StoreError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| StoreError::InvalidLocation(path.display().to_string()))?;
    let mut tombstone = file_name.to_os_string();
    tombstone.push(FILE_TOMBSTONE_SUFFIX);
    Ok(path.with_file_name(tombstone))
}

async fn remove_path(path: &Path) -> Result<(), StoreError> {
    let metadata = tokio::fs::metadata(path).await?;
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await?;
    } else {
        tokio::fs::remove_file(path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Fingerprint;

    fn store(dir: &Path) -> LocalArtifactStore {
        LocalArtifactStore::new(dir.join("downloads"), Arc::new(TableStore::open_in_memory().unwrap()))
    }

    fn key(dataset: &str) -> VersionKey {
        VersionKey::new(dataset, "2011", Fingerprint::of(dataset.as_bytes()))
    }

    #[test]
    fn test_locate_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let k = key("StormDetailsFile");

        assert_eq!(
            store.locate(&k, DatasetKind::External).unwrap(),
            ArtifactLocation::Nothing
        );
        assert_eq!(
            store.locate(&k, DatasetKind::File).unwrap(),
            ArtifactLocation::File(dir.path().join("downloads").join(k.display_name()))
        );
        assert_eq!(
            store.locate(&k, DatasetKind::Table).unwrap(),
            ArtifactLocation::Table(k.display_name())
        );
    }

    #[tokio::test]
    async fn test_file_stage_then_finish() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().await.unwrap();
        let location = store.locate(&key("F"), DatasetKind::File).unwrap();
        let ArtifactLocation::File(path) = &location else {
            panic!("expected file location");
        };
        tokio::fs::write(path, b"a,b\n").await.unwrap();

        let staged = store.stage_removal(&location).await.unwrap();
        assert!(!staged.is_empty());
        assert!(!store.exists(&location).await.unwrap());

        store.finish_removal(staged).await.unwrap();
        assert!(!store.exists(&location).await.unwrap());
        let mut entries = tokio::fs::read_dir(store.downloads_dir()).await.unwrap();
        assert!(entries.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_table_stage_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let location = store.locate(&key("T"), DatasetKind::Table).unwrap();
        let ArtifactLocation::Table(name) = &location else {
            panic!("expected table location");
        };
        store.tables().create_table(name, &["x"]).unwrap();

        let staged = store.stage_removal(&location).await.unwrap();
        assert!(!store.exists(&location).await.unwrap());

        store.restore(staged).await.unwrap();
        assert!(store.exists(&location).await.unwrap());
    }

    #[tokio::test]
    async fn test_stage_missing_artifact_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let location = store.locate(&key("Gone"), DatasetKind::File).unwrap();

        let staged = store.stage_removal(&location).await.unwrap();
        assert!(staged.is_empty());
        store.finish_removal(staged).await.unwrap();
    }

    #[tokio::test]
    async fn test_discard_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.ensure_dirs().await.unwrap();
        let location = store.locate(&key("P"), DatasetKind::File).unwrap();
        let ArtifactLocation::File(path) = &location else {
            panic!("expected file location");
        };
        tokio::fs::write(path, b"partial").await.unwrap();

        store.discard(&location).await.unwrap();
        store.discard(&location).await.unwrap();
        assert!(!store.exists(&location).await.unwrap());
    }
}
