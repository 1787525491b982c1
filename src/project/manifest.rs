use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::subprocess::ProcessError;

/// The parts of a `package.json`-style manifest this crate cares about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub scripts: BTreeMap<String, String>,
}

impl Manifest {
    pub async fn read(path: &Path) -> Result<Self, ProcessError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ProcessError::Manifest {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        Self::parse(path, &text)
    }

    pub fn parse(path: &Path, text: &str) -> Result<Self, ProcessError> {
        serde_json::from_str(text).map_err(|e| ProcessError::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    pub fn script(&self, name: &str) -> Option<&str> {
        self.scripts.get(name).map(String::as_str)
    }

    /// The `scripts.start` command, if it is set and not blank.
    pub fn start_command(&self) -> Option<&str> {
        self.script("start").filter(|command| !command.trim().is_empty())
    }
}
