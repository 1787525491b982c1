//! Process supervision settings
//!
//! Defaults suit local integration tests. Every field can be overridden in code
//! through the `with_*` setters, or from the environment with
//! [`ProcessConfig::from_env`].

use anyhow::{Context, Result};
use std::time::Duration;

const GRACE_ENV: &str = "DIRECTORY_HELPERS_GRACE_MS";
const DRAIN_ENV: &str = "DIRECTORY_HELPERS_DRAIN_MS";
const READY_TIMEOUT_ENV: &str = "DIRECTORY_HELPERS_READY_TIMEOUT_MS";
const SHELL_ENV: &str = "DIRECTORY_HELPERS_SHELL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Shell used to run manifest scripts (`<shell> -c <script>`)
    pub shell: String,
    /// File name of the project manifest inside a project directory
    pub manifest_name: String,
    /// How long a stopped process may take to exit after SIGTERM before it
    /// and its descendants are killed
    pub grace_period: Duration,
    /// How long to keep reading output after the process exits, for pipes
    /// still held open by descendants
    pub drain_timeout: Duration,
    /// Upper bound on waiting for the readiness pattern; `None` waits as long
    /// as the process stays alive
    pub ready_timeout: Option<Duration>,
    /// Size of each pipe read, and so the largest possible chunk
    pub read_buffer_size: usize,
}

impl ProcessConfig {
    /// Defaults overridden by any `DIRECTORY_HELPERS_*` variables that are set.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(grace) = env_millis(GRACE_ENV)? {
            config.grace_period = grace;
        }
        if let Some(drain) = env_millis(DRAIN_ENV)? {
            config.drain_timeout = drain;
        }
        if let Some(timeout) = env_millis(READY_TIMEOUT_ENV)? {
            config.ready_timeout = Some(timeout);
        }
        if let Ok(shell) = std::env::var(SHELL_ENV) {
            config.shell = shell;
        }

        Ok(config)
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_manifest_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_name = name.into();
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_drain_timeout(mut self, drain: Duration) -> Self {
        self.drain_timeout = drain;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            manifest_name: "package.json".to_string(),
            grace_period: Duration::from_secs(5),
            drain_timeout: Duration::from_millis(200),
            ready_timeout: None,
            read_buffer_size: 8192,
        }
    }
}

fn env_millis(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => {
            let millis: u64 = value
                .trim()
                .parse()
                .with_context(|| format!("{name} must be a number of milliseconds, got {value:?}"))?;
            Ok(Some(Duration::from_millis(millis)))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProcessConfig::default();
        assert_eq!(config.shell, "sh");
        assert_eq!(config.manifest_name, "package.json");
        assert_eq!(config.grace_period, Duration::from_secs(5));
        assert!(config.ready_timeout.is_none());
    }

    #[test]
    fn test_builder_setters() {
        let config = ProcessConfig::default()
            .with_shell("bash")
            .with_grace_period(Duration::from_millis(50))
            .with_ready_timeout(Duration::from_secs(2))
            .with_read_buffer_size(0);

        assert_eq!(config.shell, "bash");
        assert_eq!(config.grace_period, Duration::from_millis(50));
        assert_eq!(config.ready_timeout, Some(Duration::from_secs(2)));
        assert_eq!(config.read_buffer_size, 1);
    }

    #[test]
    fn test_env_millis_rejects_garbage() {
        std::env::set_var("DIRECTORY_HELPERS_TEST_BAD_MS", "soon");
        assert!(env_millis("DIRECTORY_HELPERS_TEST_BAD_MS").is_err());
        std::env::set_var("DIRECTORY_HELPERS_TEST_GOOD_MS", " 250 ");
        assert_eq!(
            env_millis("DIRECTORY_HELPERS_TEST_GOOD_MS").unwrap(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(env_millis("DIRECTORY_HELPERS_TEST_UNSET_MS").unwrap(), None);
    }
}
