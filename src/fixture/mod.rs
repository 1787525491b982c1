//! Filesystem fixtures for integration tests
//!
//! [`Directory`] and [`File`] wrap absolute paths with the handful of async
//! operations tests need to lay out a project on disk, inspect it, and run
//! commands inside it.

pub mod directory;
pub mod file;
pub mod reindent;

pub use directory::{Directory, FileContents};
pub use file::File;
pub use reindent::reindent;

use anyhow::{Context, Result};
use std::path::{Component, Path, PathBuf};

/// Make `path` absolute against the current directory and fold away `.` and
/// `..` components without touching the filesystem.
pub(crate) fn resolve(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .context("Failed to read current directory")?
            .join(path)
    };
    Ok(normalize(&joined))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
