//! Subprocess execution and supervision
//!
//! [`ProcessRunner`] is the seam between the rest of the crate and the OS:
//! [`TokioProcessRunner`] starts real processes, [`MockProcessRunner`] plays
//! back scripted ones. Spawned processes come with an [`OutputStream`] of their
//! merged stdout/stderr and a [`ProcessHandle`] that stops them together with
//! everything they forked.

pub mod builder;
pub mod error;
pub mod handle;
pub mod lifecycle;
pub mod mock;
pub mod process_tree;
pub mod runner;
pub mod stream;


pub use builder::ProcessCommandBuilder;
pub use error::ProcessError;
pub use handle::{ProcessControl, ProcessHandle};
pub use lifecycle::{LifecycleController, LifecycleState};
pub use mock::{MockCommandConfig, MockProcess, MockProcessRunner, MockSpawnConfig};
pub use runner::ProcessCommand;
pub use runner::{ExitStatus, ProcessOutput, ProcessRunner, SpawnedProcess, TokioProcessRunner};
pub use stream::{Chunk, ChunkSource, FilteredView, OutputStream, StreamSource, StreamWriter};

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::ProcessConfig;

/// Shared entry point that hands one runner to everything that starts
/// processes.
#[derive(Clone)]
pub struct SubprocessManager {
    runner: Arc<dyn ProcessRunner>,
    config: ProcessConfig,
}

impl SubprocessManager {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ProcessConfig) -> Self {
        Self { runner, config }
    }

    pub fn production(config: ProcessConfig) -> Self {
        let runner = Arc::new(TokioProcessRunner::new(&config));
        Self::new(runner, config)
    }

    pub fn mock() -> (Self, MockProcessRunner) {
        let mock = MockProcessRunner::new();
        let runner = Arc::new(mock.clone()) as Arc<dyn ProcessRunner>;
        (Self::new(runner, ProcessConfig::default()), mock)
    }

    pub fn runner(&self) -> Arc<dyn ProcessRunner> {
        Arc::clone(&self.runner)
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        self.runner.run(command).await
    }

    pub fn spawn(&self, command: ProcessCommand) -> Result<SpawnedProcess, ProcessError> {
        self.runner.spawn(command)
    }

    /// A start/stop controller for the project in `project_dir`.
    pub fn lifecycle(&self, project_dir: impl Into<PathBuf>) -> LifecycleController {
        LifecycleController::with_runner(project_dir, self.config.clone(), self.runner())
    }
}

impl Default for SubprocessManager {
    fn default() -> Self {
        Self::production(ProcessConfig::default())
    }
}
