//! Runtime directory of materialized unit files.

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Default runtime directory for unit files.
pub const DEFAULT_UNIT_DIR: &str = "/var/run/dispatch";

/// Unit files live at `{dir}/{unit name}`.
#[derive(Debug, Clone)]
pub struct UnitFiles {
    dir: PathBuf,
}

impl UnitFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, unit: &str) -> PathBuf {
        self.dir.join(unit)
    }

    /// Write a unit file, replacing any previous one.
    pub async fn write(&self, unit: &str, content: &str) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_of(unit);
        self.remove(unit).await?;
        tokio::fs::write(&path, content).await?;
        debug!(?path, "unit file written");
        Ok(path)
    }

    /// Remove a unit file. Returns `false` if it did not exist.
    pub async fn remove(&self, unit: &str) -> io::Result<bool> {
        match tokio::fs::remove_file(self.path_of(unit)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn exists(&self, unit: &str) -> bool {
        tokio::fs::try_exists(self.path_of(unit))
            .await
            .unwrap_or(false)
    }

    /// Names of all unit files, sorted. Creates the directory if missing.
    pub async fn list(&self) -> io::Result<Vec<String>> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
