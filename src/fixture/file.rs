use anyhow::{Context, Result};
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use super::resolve;

/// A single file addressed by absolute path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Relative paths are resolved against the current directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            path: resolve(path.as_ref())?,
        })
    }

    pub(crate) fn from_absolute(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the file as UTF-8. A missing file fails with an
    /// [`std::io::Error`] of kind `NotFound` that can be downcast from the
    /// returned error.
    pub async fn read(&self) -> Result<String> {
        tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))
    }

    /// Replace the file's contents, creating missing parent directories.
    pub async fn write(&self, contents: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&self.path, contents)
            .await
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        tracing::trace!("Wrote {} bytes to {}", contents.len(), self.path.display());
        Ok(())
    }

    pub async fn remove(&self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .with_context(|| format!("Failed to remove {}", self.path.display()))
    }

    pub async fn exists(&self) -> Result<bool> {
        tokio::fs::try_exists(&self.path)
            .await
            .with_context(|| format!("Failed to check {}", self.path.display()))
    }

    pub async fn stats(&self) -> Result<Metadata> {
        tokio::fs::metadata(&self.path)
            .await
            .with_context(|| format!("Failed to stat {}", self.path.display()))
    }
}
