use std::path::PathBuf;
use std::time::Duration;

use super::runner::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Output stream closed after {consumed} chunks with no chunk left to read")]
    StreamClosed { consumed: usize },

    #[error("Output stream already has a pending read")]
    ConcurrentRead,

    #[error("Process exited before becoming ready ({status})")]
    ExitedBeforeReady { status: ExitStatus, output: String },

    #[error("Process did not become ready within {0:?}")]
    ReadyTimeout(Duration),

    #[error("No process is running")]
    NotRunning,

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Process timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid manifest {}: {message}", path.display())]
    Manifest { path: PathBuf, message: String },

    #[error("Failed to terminate process group {pgid}: {message}")]
    TerminationFailed { pgid: u32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessError {
    /// Whether this error means the output stream ran dry.
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, ProcessError::StreamClosed { .. })
    }
}
