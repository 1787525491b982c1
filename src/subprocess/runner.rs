use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use super::error::ProcessError;
use super::handle::{ProcessControl, ProcessHandle};
use super::process_tree::{signal_unit, ProcessTable, Termination};
use super::stream::{self, OutputStream, StreamSource, StreamWriter};
use crate::config::ProcessConfig;

/// How often termination re-checks the process table
const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// How long processes get to die after SIGKILL before stop gives up
const FORCE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub stdin: Option<String>,
}

impl ProcessCommand {
    /// Program and arguments joined for logs and error messages
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    Error(i32),
    Timeout,
    Signal(i32),
    /// The exit was never observed, e.g. the runtime shut down first
    Unknown,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Success)
    }

    pub fn code(&self) -> Option<i32> {
        match self {
            ExitStatus::Success => Some(0),
            ExitStatus::Error(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "exit code 0"),
            ExitStatus::Error(code) => write!(f, "exit code {code}"),
            ExitStatus::Timeout => write!(f, "timed out"),
            ExitStatus::Signal(signal) => write!(f, "signal {signal}"),
            ExitStatus::Unknown => write!(f, "unknown exit status"),
        }
    }
}

/// A freshly started process and the merged output it will produce
#[derive(Debug)]
pub struct SpawnedProcess {
    pub handle: ProcessHandle,
    pub stream: OutputStream,
}

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError>;

    /// Start a command and return as soon as the OS has created it.
    ///
    /// Stdout and stderr are merged into one stream in arrival order. The
    /// stream closes once the process has exited and its pipes have drained.
    fn spawn(&self, command: ProcessCommand) -> Result<SpawnedProcess, ProcessError>;
}

/// Runner backed by real OS processes. `spawn` must be called from inside a
/// tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioProcessRunner {
    read_buffer_size: usize,
    drain_timeout: Duration,
}

impl TokioProcessRunner {
    pub fn new(config: &ProcessConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size.max(1),
            drain_timeout: config.drain_timeout,
        }
    }

    /// Log command execution details
    fn log_command_start(command: &ProcessCommand) {
        tracing::debug!("Executing subprocess: {}", command.display());

        if !command.env.is_empty() {
            tracing::trace!("Environment overrides: {:?}", command.env);
        }
        if let Some(ref dir) = command.working_dir {
            tracing::trace!("Working directory: {:?}", dir);
        }
        if let Some(ref stdin) = command.stdin {
            tracing::trace!("Stdin provided: {} bytes", stdin.len());
        }
    }

    /// Configure the command with environment and working directory
    fn configure_command(command: &ProcessCommand) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&command.program);

        // Own process group, so stopping reaches everything the command forks
        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        cmd.args(&command.args);
        cmd.envs(&command.env);

        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }

        if command.stdin.is_some() {
            cmd.stdin(std::process::Stdio::piped());
        } else {
            cmd.stdin(std::process::Stdio::null());
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd
    }

    /// Write stdin data to the child process
    async fn write_stdin(
        stdin: Option<tokio::process::ChildStdin>,
        stdin_data: &str,
    ) -> Result<(), ProcessError> {
        if let Some(mut stdin) = stdin {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(stdin_data.as_bytes()).await?;
            stdin.shutdown().await?;
        }
        Ok(())
    }

    /// Wait for process with optional timeout
    async fn wait_with_timeout(
        child: tokio::process::Child,
        timeout: Option<Duration>,
    ) -> Result<std::process::Output, ProcessError> {
        match timeout {
            Some(duration) => {
                match tokio::time::timeout(duration, child.wait_with_output()).await {
                    Ok(result) => result.map_err(ProcessError::Io),
                    Err(_) => Err(ProcessError::Timeout(duration)),
                }
            }
            None => child.wait_with_output().await.map_err(ProcessError::Io),
        }
    }

    /// Convert process exit status to our ExitStatus enum
    fn parse_exit_status(status: std::process::ExitStatus) -> ExitStatus {
        if status.success() {
            ExitStatus::Success
        } else if let Some(code) = status.code() {
            ExitStatus::Error(code)
        } else {
            Self::parse_signal_status(status)
        }
    }

    /// Parse signal status on Unix systems
    #[cfg(unix)]
    fn parse_signal_status(status: std::process::ExitStatus) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            ExitStatus::Signal(signal)
        } else {
            ExitStatus::Error(1)
        }
    }

    #[cfg(not(unix))]
    fn parse_signal_status(_status: std::process::ExitStatus) -> ExitStatus {
        ExitStatus::Error(1)
    }

    /// Log the process execution result
    fn log_result(result: &ProcessOutput, command: &ProcessCommand) {
        match &result.status {
            ExitStatus::Success => {
                tracing::debug!(
                    "Subprocess completed successfully in {:?}: {}",
                    result.duration,
                    command.display()
                );
            }
            ExitStatus::Signal(signal) => {
                tracing::warn!(
                    "Subprocess terminated by signal {} in {:?}: {}",
                    signal,
                    result.duration,
                    command.display()
                );
            }
            status => {
                tracing::debug!(
                    "Subprocess finished with {} in {:?}: {}",
                    status,
                    result.duration,
                    command.display()
                );
                if !result.stderr.is_empty() {
                    tracing::trace!("Stderr: {}", result.stderr);
                }
            }
        }
    }

    /// Map spawn error to ProcessError
    fn map_spawn_error(error: std::io::Error, command: &ProcessCommand) -> ProcessError {
        if error.kind() == std::io::ErrorKind::NotFound {
            tracing::error!("Command '{}' not found", command.program);
        } else {
            tracing::error!(
                "Failed to spawn '{}': {:?} (kind: {:?})",
                command.program,
                error,
                error.kind()
            );
        }
        ProcessError::SpawnFailed {
            command: command.display(),
            source: error,
        }
    }

    fn start_pump<R>(
        &self,
        pipe: Option<R>,
        source: StreamSource,
        writer: &StreamWriter,
    ) -> Option<JoinHandle<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let pipe = pipe?;
        let writer = writer.clone();
        let buffer_size = self.read_buffer_size;
        Some(tokio::spawn(pump(pipe, source, writer, buffer_size)))
    }
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(&ProcessConfig::default())
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        let start = Instant::now();
        Self::log_command_start(&command);

        let mut cmd = Self::configure_command(&command);
        cmd.kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, &command))?;

        if let Some(stdin_data) = &command.stdin {
            Self::write_stdin(child.stdin.take(), stdin_data).await?;
        }

        let output = Self::wait_with_timeout(child, command.timeout).await?;

        let result = ProcessOutput {
            status: Self::parse_exit_status(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: start.elapsed(),
        };
        Self::log_result(&result, &command);

        Ok(result)
    }

    fn spawn(&self, command: ProcessCommand) -> Result<SpawnedProcess, ProcessError> {
        Self::log_command_start(&command);

        let mut child = Self::configure_command(&command)
            .spawn()
            .map_err(|e| Self::map_spawn_error(e, &command))?;
        let pid = child.id().ok_or_else(|| ProcessError::SpawnFailed {
            command: command.display(),
            source: std::io::Error::other("process exited before its pid was read"),
        })?;
        tracing::debug!("Spawned process {} for {}", pid, command.display());

        let (writer, stream) = stream::channel();
        let mut pumps = Vec::with_capacity(2);
        pumps.extend(self.start_pump(child.stdout.take(), StreamSource::Stdout, &writer));
        pumps.extend(self.start_pump(child.stderr.take(), StreamSource::Stderr, &writer));

        let stdin = command.stdin.clone().map(|data| (child.stdin.take(), data));
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = Arc::new(Notify::new());

        tokio::spawn(supervise(Supervised {
            pid,
            child,
            stdin,
            pumps,
            writer,
            exit: exit_tx,
            kill: Arc::clone(&kill),
            drain_timeout: self.drain_timeout,
        }));

        let control = TokioProcessControl {
            pid,
            exit: exit_rx,
            kill,
        };

        Ok(SpawnedProcess {
            handle: ProcessHandle::new(pid, Arc::new(control)),
            stream,
        })
    }
}

/// Read one pipe until EOF, appending every read as a chunk.
async fn pump<R>(mut pipe: R, source: StreamSource, writer: StreamWriter, buffer_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];
    let mut decoder = Utf8Decoder::default();

    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let text = decoder.decode(&buffer[..n]);
                if !text.is_empty() {
                    writer.append(source, text);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!("Error reading {:?}: {}", source, e);
                break;
            }
        }
    }

    if let Some(rest) = decoder.finish() {
        writer.append(source, rest);
    }
}

struct Supervised {
    pid: u32,
    child: tokio::process::Child,
    stdin: Option<(Option<tokio::process::ChildStdin>, String)>,
    pumps: Vec<JoinHandle<()>>,
    writer: StreamWriter,
    exit: watch::Sender<Option<ExitStatus>>,
    kill: Arc<Notify>,
    drain_timeout: Duration,
}

/// Own the child until it exits: publish the exit status, let the pipes
/// drain, then close the stream.
async fn supervise(mut task: Supervised) {
    if let Some((stdin, data)) = task.stdin.take() {
        let pid = task.pid;
        tokio::spawn(async move {
            if let Err(e) = TokioProcessRunner::write_stdin(stdin, &data).await {
                tracing::warn!("Failed to write stdin of process {}: {}", pid, e);
            }
        });
    }

    let status = loop {
        tokio::select! {
            result = task.child.wait() => break result,
            _ = task.kill.notified() => {
                if let Err(e) = task.child.start_kill() {
                    tracing::debug!("Kill of process {} failed: {}", task.pid, e);
                }
            }
        }
    };

    let status = match status {
        Ok(status) => TokioProcessRunner::parse_exit_status(status),
        Err(e) => {
            tracing::warn!("Failed to wait for process {}: {}", task.pid, e);
            ExitStatus::Unknown
        }
    };
    tracing::debug!("Process {} exited with {}", task.pid, status);
    task.exit.send_replace(Some(status));

    let drain = async {
        for pump in task.pumps.iter_mut() {
            let _ = pump.await;
        }
    };
    if tokio::time::timeout(task.drain_timeout, drain).await.is_err() {
        tracing::debug!(
            "Output of process {} still open {:?} after exit; closing stream",
            task.pid,
            task.drain_timeout
        );
        for pump in &task.pumps {
            pump.abort();
        }
    }

    task.writer.close();
}

struct TokioProcessControl {
    pid: u32,
    exit: watch::Receiver<Option<ExitStatus>>,
    kill: Arc<Notify>,
}

impl TokioProcessControl {
    fn signal(&self, unit: &HashSet<u32>, termination: Termination) {
        signal_unit(self.pid, unit, termination);
        if termination == Termination::Forced || cfg!(not(unix)) {
            self.kill.notify_one();
        }
    }
}

#[async_trait]
impl ProcessControl for TokioProcessControl {
    fn exit_status(&self) -> Option<ExitStatus> {
        (*self.exit.borrow()).clone()
    }

    async fn wait(&self) -> ExitStatus {
        let mut exit = self.exit.clone();
        let status = exit
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|s| (*s).clone());
        status.unwrap_or(ExitStatus::Unknown)
    }

    async fn terminate(&self, grace: Duration) -> Result<ExitStatus, ProcessError> {
        let started = Instant::now();
        let mut termination = Termination::Graceful;

        // Record the tree before signalling: once the leader dies its
        // children are reparented and can no longer be found through it.
        let mut tracked = ProcessTable::capture().await?.unit(self.pid);
        self.signal(&tracked, termination);

        loop {
            let table = ProcessTable::capture().await?;

            let discovered: HashSet<u32> = table
                .unit(self.pid)
                .into_iter()
                .filter(|pid| !tracked.contains(pid))
                .collect();
            if !discovered.is_empty() {
                self.signal(&discovered, termination);
                tracked.extend(discovered);
            }
            tracked.retain(|&pid| table.is_alive(pid));

            if tracked.is_empty() && self.exit_status().is_some() {
                break;
            }

            let elapsed = started.elapsed();
            match termination {
                Termination::Graceful if elapsed >= grace => {
                    tracing::warn!(
                        "Process {} still running {:?} after SIGTERM ({} processes); killing",
                        self.pid,
                        grace,
                        tracked.len()
                    );
                    termination = Termination::Forced;
                    self.signal(&tracked, termination);
                }
                Termination::Forced if elapsed >= grace + FORCE_TIMEOUT => {
                    return Err(ProcessError::TerminationFailed {
                        pgid: self.pid,
                        message: format!(
                            "{} processes survived SIGKILL: {:?}",
                            tracked.len(),
                            tracked
                        ),
                    });
                }
                _ => {}
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let status = self.wait().await;
        tracing::debug!(
            "Process {} and its descendants stopped in {:?} ({})",
            self.pid,
            started.elapsed(),
            status
        );
        Ok(status)
    }

    fn kill_now(&self) {
        // The group goes down right away. Descendants that left it are swept
        // from the process table off the runtime threads, as far as they can
        // still be traced to the leader.
        self.signal(&HashSet::new(), Termination::Forced);

        let pid = self.pid;
        let sweep = move || {
            let strays = ProcessTable::capture_blocking().descendants(pid);
            if !strays.is_empty() {
                tracing::debug!("Killing {} descendants of process {}", strays.len(), pid);
                signal_unit(pid, &strays, Termination::Forced);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(sweep);
            }
            Err(_) => sweep(),
        }
    }
}

/// Incremental UTF-8 decoding that keeps a character split across two reads
/// intact.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let complete = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            // Only an incomplete sequence at the very end is held back
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            Err(_) => self.pending.len(),
        };

        let rest = self.pending.split_off(complete);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending = rest;
        text
    }

    fn finish(self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.pending).into_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_passes_ascii_through() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_carries_split_character() {
        let bytes = "caf\u{e9}!".as_bytes();
        let split = bytes.len() - 2; // inside the two-byte e-acute
        let mut decoder = Utf8Decoder::default();

        assert_eq!(decoder.decode(&bytes[..split]), "caf");
        assert_eq!(decoder.decode(&bytes[split..]), "\u{e9}!");
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_decoder_flushes_truncated_tail() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[b'a', 0xE2, 0x82]), "a");
        assert_eq!(decoder.finish().unwrap(), "\u{fffd}");
    }

    #[test]
    fn test_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(&[0xFF, b'x']), "\u{fffd}x");
    }

    #[test]
    fn test_exit_status_display() {
        assert_eq!(ExitStatus::Success.to_string(), "exit code 0");
        assert_eq!(ExitStatus::Error(3).to_string(), "exit code 3");
        assert_eq!(ExitStatus::Signal(15).to_string(), "signal 15");
    }

    #[cfg(unix)]
    #[test]
    fn test_parse_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        let status = std::process::ExitStatus::from_raw(0);
        assert_eq!(TokioProcessRunner::parse_exit_status(status), ExitStatus::Success);

        let status = std::process::ExitStatus::from_raw(256); // Exit code 1
        assert_eq!(TokioProcessRunner::parse_exit_status(status), ExitStatus::Error(1));

        let status = std::process::ExitStatus::from_raw(9); // Killed by SIGKILL
        assert_eq!(TokioProcessRunner::parse_exit_status(status), ExitStatus::Signal(9));
    }

    #[test]
    fn test_command_display() {
        let command = ProcessCommand {
            program: "npm".to_string(),
            args: vec!["run".to_string(), "start".to_string()],
            env: HashMap::new(),
            working_dir: None,
            timeout: None,
            stdin: None,
        };
        assert_eq!(command.display(), "npm run start");
    }
}
