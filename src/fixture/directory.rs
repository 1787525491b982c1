use anyhow::{Context, Result};
use std::fs::Metadata;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::file::File;
use super::reindent::reindent;
use super::resolve;
use crate::project::Manifest;
use crate::subprocess::{
    LifecycleController, ProcessCommandBuilder, ProcessOutput, SpawnedProcess, SubprocessManager,
};

/// What [`Directory::write`] puts in a file
#[derive(Debug, Clone, PartialEq)]
pub enum FileContents {
    /// Pretty-printed JSON followed by a newline
    Json(serde_json::Value),
    /// Text normalised with [`reindent`]
    Text(String),
}

impl FileContents {
    pub fn render(&self) -> Result<String> {
        match self {
            FileContents::Json(value) => {
                let mut text =
                    serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
                text.push('\n');
                Ok(text)
            }
            FileContents::Text(text) => Ok(reindent(text)),
        }
    }
}

impl From<serde_json::Value> for FileContents {
    fn from(value: serde_json::Value) -> Self {
        FileContents::Json(value)
    }
}

impl From<&str> for FileContents {
    fn from(text: &str) -> Self {
        FileContents::Text(text.to_string())
    }
}

impl From<String> for FileContents {
    fn from(text: String) -> Self {
        FileContents::Text(text)
    }
}

/// A directory on disk plus the runner used for commands started in it
#[derive(Clone)]
pub struct Directory {
    path: PathBuf,
    subprocess: SubprocessManager,
}

impl Directory {
    /// Relative paths are resolved against the current directory. Nothing is
    /// created until [`Directory::create`] or [`Directory::write`].
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            path: resolve(path.as_ref())?,
            subprocess: SubprocessManager::default(),
        })
    }

    /// A directory nested under `parent`, sharing its runner.
    pub fn child(parent: &Directory, name: impl AsRef<Path>) -> Self {
        Self {
            path: parent.path(name),
            subprocess: parent.subprocess.clone(),
        }
    }

    pub fn with_subprocess(mut self, subprocess: SubprocessManager) -> Self {
        self.subprocess = subprocess;
        self
    }

    pub fn root(&self) -> &Path {
        &self.path
    }

    /// Absolute path of `components` inside this directory.
    pub fn path(&self, components: impl AsRef<Path>) -> PathBuf {
        super::normalize(&self.path.join(components))
    }

    pub async fn create(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .with_context(|| format!("Failed to create {}", self.path.display()))
    }

    /// Delete the directory and everything in it. A missing directory is
    /// not an error.
    pub async fn remove(&self) -> Result<()> {
        remove_path(&self.path).await
    }

    /// Delete a file or subtree inside this directory, if it exists.
    pub async fn remove_entry(&self, components: impl AsRef<Path>) -> Result<()> {
        remove_path(&self.path(components)).await
    }

    /// Names of the entries directly inside this directory, sorted.
    pub async fn list(&self) -> Result<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.path)
            .await
            .with_context(|| format!("Failed to list {}", self.path.display()))?;

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
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

    pub fn file(&self, components: impl AsRef<Path>) -> File {
        File::from_absolute(self.path(components))
    }

    /// Write each `(relative path, contents)` pair, creating parent
    /// directories as needed.
    pub async fn write<I, P>(&self, files: I) -> Result<()>
    where
        I: IntoIterator<Item = (P, FileContents)>,
        P: AsRef<Path>,
    {
        for (name, contents) in files {
            let text = contents.render()?;
            self.file(name).write(&text).await?;
        }
        Ok(())
    }

    pub async fn read_manifest(&self) -> Result<Manifest> {
        let path = self.path(&self.subprocess.config().manifest_name);
        Ok(Manifest::read(&path).await?)
    }

    /// Run `program` to completion in this directory.
    pub async fn exec<I, S>(&self, program: &str, args: I) -> Result<ProcessOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let command = ProcessCommandBuilder::new(program)
            .args(args)
            .current_dir(&self.path)
            .build();
        let display = command.display();
        self.subprocess
            .run(command)
            .await
            .with_context(|| format!("Failed to run '{}' in {}", display, self.path.display()))
    }

    /// Start `program` in this directory without waiting for it.
    pub fn spawn<I, S>(&self, program: &str, args: I) -> Result<SpawnedProcess>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let command = ProcessCommandBuilder::new(program)
            .args(args)
            .current_dir(&self.path)
            .build();
        Ok(self.subprocess.spawn(command)?)
    }

    /// A controller for the project whose manifest lives in this directory.
    pub fn lifecycle(&self) -> LifecycleController {
        self.subprocess.lifecycle(&self.path)
    }
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

async fn remove_path(path: &Path) -> Result<()> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to stat {}", path.display()));
        }
    };

    let removed = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match removed {
        Ok(()) => {
            tracing::trace!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subprocess::ExitStatus;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_create_list_remove() {
        let temp = TempDir::new().unwrap();
        let dir = Directory::new(temp.path().join("project")).unwrap();
        assert!(!dir.exists().await.unwrap());

        dir.create().await.unwrap();
        dir.write([
            ("b.txt", FileContents::from("b")),
            ("a.txt", FileContents::from("a")),
            ("src/lib.js", FileContents::from("")),
        ])
        .await
        .unwrap();

        assert_eq!(dir.list().await.unwrap(), vec!["a.txt", "b.txt", "src"]);
        assert!(dir.stats().await.unwrap().is_dir());

        dir.remove_entry("src").await.unwrap();
        dir.remove_entry("src").await.unwrap();
        assert_eq!(dir.list().await.unwrap(), vec!["a.txt", "b.txt"]);

        dir.remove().await.unwrap();
        dir.remove().await.unwrap();
        assert!(!dir.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_write_json_and_text() {
        let temp = TempDir::new().unwrap();
        let dir = Directory::new(temp.path()).unwrap();

        dir.write([
            ("package.json", FileContents::from(json!({"name": "project"}))),
            (
                "notes.md",
                FileContents::from(
                    "
                    # Notes
                      indented
                    ",
                ),
            ),
        ])
        .await
        .unwrap();

        let manifest = dir.file("package.json").read().await.unwrap();
        assert_eq!(manifest, "{\n  \"name\": \"project\"\n}\n");
        let notes = dir.file("notes.md").read().await.unwrap();
        assert_eq!(notes, "# Notes\n  indented\n");
    }

    #[tokio::test]
    async fn test_child_shares_base() {
        let temp = TempDir::new().unwrap();
        let parent = Directory::new(temp.path()).unwrap();
        let child = Directory::child(&parent, "nested");

        assert_eq!(child.root(), temp.path().join("nested"));
        assert_eq!(parent.path("a/../b"), temp.path().join("b"));
    }

    #[tokio::test]
    async fn test_read_manifest() {
        let temp = TempDir::new().unwrap();
        let dir = Directory::new(temp.path()).unwrap();
        dir.write([(
            "package.json",
            FileContents::from(json!({"scripts": {"start": "node server.js"}})),
        )])
        .await
        .unwrap();

        let manifest = dir.read_manifest().await.unwrap();
        assert_eq!(manifest.start_command(), Some("node server.js"));
    }

    #[tokio::test]
    async fn test_exec_runs_in_directory() {
        let temp = TempDir::new().unwrap();
        let (subprocess, mock) = SubprocessManager::mock();
        let dir = Directory::new(temp.path())
            .unwrap()
            .with_subprocess(subprocess);
        mock.expect_command("npm")
            .with_args(|args| args == ["test"])
            .returns_stdout("ok\n")
            .finish();

        let output = dir.exec("npm", ["test"]).await.unwrap();

        assert_eq!(output.status, ExitStatus::Success);
        assert_eq!(output.stdout, "ok\n");
        let history = mock.get_call_history();
        assert_eq!(history[0].working_dir.as_deref(), Some(temp.path()));
    }
}
