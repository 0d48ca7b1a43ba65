//! Resolved command-line configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use cabin_store::{Catalog, LocalArtifactStore, TableStore};
use miette::{IntoDiagnostic, Result};

use crate::datasets::Roots;

/// Default workspace directory, relative to the working directory.
pub const DEFAULT_HOME: &str = ".cabin";

/// Where cabin keeps its state and how hard it works.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub home: PathBuf,
    pub catalog: PathBuf,
    pub data: PathBuf,
    pub downloads: PathBuf,
    pub jobs: usize,
    pub roots: Roots,
}

impl Settings {
    /// Fill unset paths from `home`.
    pub fn resolve(
        home: PathBuf,
        catalog: Option<PathBuf>,
        data: Option<PathBuf>,
        downloads: Option<PathBuf>,
        jobs: usize,
        roots: Roots,
    ) -> Self {
        Self {
            catalog: catalog.unwrap_or_else(|| home.join("catalog.db")),
            data: data.unwrap_or_else(|| home.join("data.db")),
            downloads: downloads.unwrap_or_else(|| home.join("downloads")),
            jobs: jobs.max(1),
            roots,
            home,
        }
    }

    /// Create the workspace directories.
    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            Some(self.home.as_path()),
            self.catalog.parent(),
            self.data.parent(),
            Some(self.downloads.as_path()),
        ]
        .into_iter()
        .flatten()
        .filter(|d| !d.as_os_str().is_empty())
        {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| miette::miette!("failed to create {}: {}", dir.display(), e))?;
        }
        Ok(())
    }

    /// Open (creating if needed) the version catalog.
    pub fn open_catalog(&self) -> Result<Catalog> {
        Catalog::open(&self.catalog).into_diagnostic()
    }

    /// Open the table store and wrap it with the downloads directory.
    pub fn open_store(&self) -> Result<Arc<LocalArtifactStore>> {
        let tables = TableStore::open(&self.data).into_diagnostic()?;
        Ok(Arc::new(LocalArtifactStore::new(&self.downloads, Arc::new(tables))))
    }

    /// Whether `init` has been run for this workspace.
    pub fn is_initialized(&self) -> bool {
        self.catalog.exists()
    }

    /// Path for the `shell` command.
    pub fn shell_target(&self, catalog: bool) -> &Path {
        if catalog { &self.catalog } else { &self.data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_default_under_home() {
        let settings = Settings::resolve(PathBuf::from("/tmp/ws"), None, None, None, 4, Roots::default());

        assert_eq!(settings.catalog, PathBuf::from("/tmp/ws/catalog.db"));
        assert_eq!(settings.data, PathBuf::from("/tmp/ws/data.db"));
        assert_eq!(settings.downloads, PathBuf::from("/tmp/ws/downloads"));
        assert_eq!(settings.jobs, 4);
    }

    #[test]
    fn test_explicit_paths_win() {
        let settings = Settings::resolve(
            PathBuf::from(".cabin"),
            Some(PathBuf::from("/var/cat.db")),
            None,
            Some(PathBuf::from("/srv/dl")),
            0,
            Roots::default(),
        );

        assert_eq!(settings.catalog, PathBuf::from("/var/cat.db"));
        assert_eq!(settings.data, PathBuf::from(".cabin/data.db"));
        assert_eq!(settings.downloads, PathBuf::from("/srv/dl"));
        assert_eq!(settings.jobs, 1);
        assert_eq!(settings.shell_target(true), Path::new("/var/cat.db"));
    }

    #[tokio::test]
    async fn test_ensure_dirs_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::resolve(dir.path().join("ws"), None, None, None, 2, Roots::default());

        assert!(!settings.is_initialized());
        settings.ensure_dirs().await.unwrap();
        let catalog = settings.open_catalog().unwrap();
        let store = settings.open_store().unwrap();

        assert!(catalog.is_empty().unwrap());
        assert!(settings.is_initialized());
        assert!(store.downloads_dir().is_dir());
    }
}
