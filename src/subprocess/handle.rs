use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::error::ProcessError;
use super::runner::ExitStatus;

/// Backend operations behind a [`ProcessHandle`]
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Exit status if the process has already exited
    fn exit_status(&self) -> Option<ExitStatus>;

    /// Wait until the process exits.
    async fn wait(&self) -> ExitStatus;

    /// Terminate the process and everything it started, escalating to a
    /// forced kill after `grace`. Returns once nothing is left running.
    async fn terminate(&self, grace: Duration) -> Result<ExitStatus, ProcessError>;

    /// Best-effort immediate kill that does not wait for anything.
    fn kill_now(&self);
}

/// A spawned process, treated together with its descendants as one unit
#[derive(Clone)]
pub struct ProcessHandle {
    pid: u32,
    control: Arc<dyn ProcessControl>,
}

impl ProcessHandle {
    pub fn new(pid: u32, control: Arc<dyn ProcessControl>) -> Self {
        Self { pid, control }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.control.exit_status()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    pub async fn wait(&self) -> ExitStatus {
        self.control.wait().await
    }

    pub async fn terminate(&self, grace: Duration) -> Result<ExitStatus, ProcessError> {
        tracing::debug!("Terminating process {} (grace {:?})", self.pid, grace);
        self.control.terminate(grace).await
    }

    pub fn kill_now(&self) {
        self.control.kill_now();
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exit_status", &self.exit_status())
            .finish()
    }
}
