//! Common test utilities and helpers
#![allow(dead_code)]

use directory_helpers::config::ProcessConfig;
use directory_helpers::fixture::{Directory, FileContents};
use directory_helpers::subprocess::SubprocessManager;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;

/// Short grace and drain periods so failing tests do not hang for long
pub fn test_config() -> ProcessConfig {
    ProcessConfig::default()
        .with_grace_period(Duration::from_secs(2))
        .with_drain_timeout(Duration::from_millis(100))
}

/// A temporary project whose manifest starts `script`.
///
/// The `TempDir` must be kept alive for as long as the project is used.
pub async fn project_with_start(script: &str) -> (TempDir, Directory) {
    let temp = TempDir::new().expect("create temp dir");
    let project = Directory::new(temp.path())
        .expect("resolve temp dir")
        .with_subprocess(SubprocessManager::production(test_config()));

    project
        .write([(
            "package.json",
            FileContents::Json(json!({
                "name": "fixture-project",
                "scripts": { "start": script },
            })),
        )])
        .await
        .expect("write manifest");

    (temp, project)
}
