//! Start/stop control for a project's long-running process
//!
//! [`LifecycleController::start`] runs the project's `scripts.start` command
//! and returns once its output matches a readiness pattern;
//! [`LifecycleController::stop`] tears the process and everything it forked
//! back down. The pair can be repeated any number of times, each start
//! getting a fresh process and a fresh output stream.

use regex::Regex;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::builder::ProcessCommandBuilder;
use super::error::ProcessError;
use super::handle::ProcessHandle;
use super::runner::{ExitStatus, ProcessCommand, ProcessRunner, TokioProcessRunner};
use super::stream::{Chunk, ChunkSource, OutputStream};
use crate::config::ProcessConfig;
use crate::project::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct ActiveProcess {
    handle: ProcessHandle,
    stream: OutputStream,
}

pub struct LifecycleController {
    runner: Arc<dyn ProcessRunner>,
    project_dir: PathBuf,
    config: ProcessConfig,
    state: LifecycleState,
    active: Option<ActiveProcess>,
}

impl LifecycleController {
    pub fn new(project_dir: impl Into<PathBuf>, config: ProcessConfig) -> Self {
        let runner = Arc::new(TokioProcessRunner::new(&config));
        Self::with_runner(project_dir, config, runner)
    }

    pub fn with_runner(
        project_dir: impl Into<PathBuf>,
        config: ProcessConfig,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            runner,
            project_dir: project_dir.into(),
            config,
            state: LifecycleState::Idle,
            active: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn handle(&self) -> Option<&ProcessHandle> {
        self.active.as_ref().map(|active| &active.handle)
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle().map(ProcessHandle::pid)
    }

    /// Output of the current process. After a successful start the cursor
    /// sits just past the chunk that matched the readiness pattern.
    pub fn output(&self) -> Option<&OutputStream> {
        self.active.as_ref().map(|active| &active.stream)
    }

    /// Start the project and wait until a chunk of its output matches `ready`.
    ///
    /// Returns the matching chunk. Fails with
    /// [`ProcessError::ExitedBeforeReady`] if the process exits first, and
    /// with [`ProcessError::ReadyTimeout`] (after stopping it) if a ready
    /// timeout is configured and runs out. If the returned future is dropped
    /// while waiting, the process keeps running in the `Starting` state and
    /// can be cancelled with [`LifecycleController::stop`].
    pub async fn start(&mut self, ready: &Regex) -> Result<Chunk, ProcessError> {
        if self.state != LifecycleState::Idle {
            return Err(ProcessError::InvalidState {
                operation: "start",
                state: self.state.as_str(),
            });
        }

        let command = self.start_command().await?;
        let spawned = self.runner.spawn(command)?;
        tracing::info!(
            "Started process {} in {}; waiting for /{}/",
            spawned.handle.pid(),
            self.project_dir.display(),
            ready
        );

        let pattern = ready.clone();
        let readiness = spawned
            .stream
            .filter(move |chunk| pattern.is_match(chunk.text()));
        self.active = Some(ActiveProcess {
            handle: spawned.handle,
            stream: spawned.stream,
        });
        self.state = LifecycleState::Starting;

        let waited = match self.config.ready_timeout {
            Some(limit) => match tokio::time::timeout(limit, readiness.next()).await {
                Ok(waited) => waited,
                Err(_) => return Err(self.abandon_start(limit).await),
            },
            None => readiness.next().await,
        };

        match waited {
            Ok(chunk) => {
                self.state = LifecycleState::Running;
                tracing::debug!("Process ready after {} chunks", chunk.index() + 1);
                Ok(chunk)
            }
            Err(e) if e.is_stream_closed() => Err(self.exited_before_ready().await),
            Err(e) => Err(e),
        }
    }

    /// Stop the current process and all of its descendants, waiting until
    /// they have exited.
    pub async fn stop(&mut self) -> Result<ExitStatus, ProcessError> {
        let handle = match (&self.state, &self.active) {
            (LifecycleState::Idle, _) | (_, None) => return Err(ProcessError::NotRunning),
            (_, Some(active)) => active.handle.clone(),
        };

        // The handle stays stored until termination is confirmed, so a
        // cancelled or failed stop can be retried.
        self.state = LifecycleState::Stopping;
        match handle.terminate(self.config.grace_period).await {
            Ok(status) => {
                self.active = None;
                self.state = LifecycleState::Idle;
                tracing::info!("Stopped process {} ({})", handle.pid(), status);
                Ok(status)
            }
            Err(e) => {
                tracing::warn!("Stopping process {} failed: {}", handle.pid(), e);
                Err(e)
            }
        }
    }

    async fn start_command(&self) -> Result<ProcessCommand, ProcessError> {
        let manifest_path = self.project_dir.join(&self.config.manifest_name);
        let manifest = Manifest::read(&manifest_path).await?;
        let script = manifest
            .start_command()
            .ok_or_else(|| ProcessError::Manifest {
                path: manifest_path.clone(),
                message: "no scripts.start entry".to_string(),
            })?;

        Ok(
            ProcessCommandBuilder::shell_script(&self.config.shell, script)
                .current_dir(&self.project_dir)
                .build(),
        )
    }

    async fn exited_before_ready(&mut self) -> ProcessError {
        self.state = LifecycleState::Idle;
        let Some(active) = self.active.take() else {
            return ProcessError::NotRunning;
        };

        let status = active.handle.wait().await;
        tracing::warn!(
            "Process {} exited with {} before becoming ready",
            active.handle.pid(),
            status
        );
        ProcessError::ExitedBeforeReady {
            status,
            output: active.stream.text(),
        }
    }

    async fn abandon_start(&mut self, limit: Duration) -> ProcessError {
        tracing::warn!("Process not ready within {:?}; stopping it", limit);
        match self.stop().await {
            Ok(_) => ProcessError::ReadyTimeout(limit),
            Err(e) => e,
        }
    }
}

impl Drop for LifecycleController {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            tracing::debug!(
                "Controller dropped while {}; killing process {}",
                self.state,
                active.handle.pid()
            );
            active.handle.kill_now();
        }
    }
}
