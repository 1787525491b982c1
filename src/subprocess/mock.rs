use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use super::error::ProcessError;
use super::handle::{ProcessControl, ProcessHandle};
use super::runner::{ExitStatus, ProcessCommand, ProcessOutput, ProcessRunner, SpawnedProcess};
use super::stream::{self, StreamSource, StreamWriter};

const SIGKILL: i32 = 9;
const SIGTERM: i32 = 15;

/// Scripted stand-in for [`super::TokioProcessRunner`].
///
/// `run` answers from command expectations; `spawn` plays back queued spawn
/// scripts and hands out [`MockProcess`] handles so a test can keep feeding
/// output or end the process later.
#[derive(Clone, Default)]
pub struct MockProcessRunner {
    expectations: Arc<Mutex<Vec<MockExpectation>>>,
    spawn_scripts: Arc<Mutex<VecDeque<SpawnScript>>>,
    spawned: Arc<Mutex<Vec<MockProcess>>>,
    call_history: Arc<Mutex<Vec<ProcessCommand>>>,
    next_pid: Arc<AtomicU32>,
}

struct MockExpectation {
    program: String,
    #[allow(clippy::type_complexity)]
    args_matcher: Option<Box<dyn Fn(&[String]) -> bool + Send + Sync>>,
    response: ProcessOutput,
}

pub struct MockCommandConfig {
    runner: MockProcessRunner,
    expectation: MockExpectation,
}

#[derive(Default)]
struct SpawnScript {
    chunks: Vec<(StreamSource, String)>,
    exit: Option<ExitStatus>,
    fail: bool,
}

pub struct MockSpawnConfig {
    runner: MockProcessRunner,
    script: SpawnScript,
}

impl MockProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_command(&self, program: &str) -> MockCommandConfig {
        MockCommandConfig {
            runner: self.clone(),
            expectation: MockExpectation {
                program: program.to_string(),
                args_matcher: None,
                response: ProcessOutput {
                    status: ExitStatus::Success,
                    stdout: String::new(),
                    stderr: String::new(),
                    duration: Duration::from_millis(10),
                },
            },
        }
    }

    /// Queue the behaviour of the next spawned process.
    pub fn expect_spawn(&self) -> MockSpawnConfig {
        MockSpawnConfig {
            runner: self.clone(),
            script: SpawnScript::default(),
        }
    }

    pub fn verify_called(&self, program: &str, times: usize) -> bool {
        let history = lock(&self.call_history);
        history.iter().filter(|cmd| cmd.program == program).count() == times
    }

    pub fn get_call_history(&self) -> Vec<ProcessCommand> {
        lock(&self.call_history).clone()
    }

    /// Every process spawned so far, oldest first
    pub fn spawned(&self) -> Vec<MockProcess> {
        lock(&self.spawned).clone()
    }

    pub fn last_spawned(&self) -> Option<MockProcess> {
        lock(&self.spawned).last().cloned()
    }
}

#[async_trait]
impl ProcessRunner for MockProcessRunner {
    async fn run(&self, command: ProcessCommand) -> Result<ProcessOutput, ProcessError> {
        lock(&self.call_history).push(command.clone());

        let expectations = lock(&self.expectations);
        expectations
            .iter()
            .filter(|e| e.program == command.program)
            .find(|e| {
                e.args_matcher
                    .as_ref()
                    .map_or(true, |matcher| matcher(&command.args))
            })
            .map(|e| e.response.clone())
            .ok_or_else(|| unexpected(&command))
    }

    fn spawn(&self, command: ProcessCommand) -> Result<SpawnedProcess, ProcessError> {
        lock(&self.call_history).push(command.clone());

        let script = lock(&self.spawn_scripts)
            .pop_front()
            .ok_or_else(|| unexpected(&command))?;
        if script.fail {
            return Err(ProcessError::SpawnFailed {
                command: command.display(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "scripted failure"),
            });
        }

        let pid = 10_000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (writer, stream) = stream::channel();
        let (exit, _) = watch::channel(None);
        let process = MockProcess {
            pid,
            command,
            writer,
            exit: Arc::new(exit),
            terminated: Arc::new(AtomicBool::new(false)),
        };

        for (source, text) in script.chunks {
            process.writer.append(source, text);
        }
        if let Some(status) = script.exit {
            process.exit(status);
        }

        lock(&self.spawned).push(process.clone());
        Ok(SpawnedProcess {
            handle: ProcessHandle::new(pid, Arc::new(MockControl(process))),
            stream,
        })
    }
}

impl MockCommandConfig {
    pub fn with_args<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&[String]) -> bool + Send + Sync + 'static,
    {
        self.expectation.args_matcher = Some(Box::new(matcher));
        self
    }

    pub fn returns_stdout(mut self, stdout: &str) -> Self {
        self.expectation.response.stdout = stdout.to_string();
        self
    }

    pub fn returns_stderr(mut self, stderr: &str) -> Self {
        self.expectation.response.stderr = stderr.to_string();
        self
    }

    pub fn returns_exit_code(mut self, code: i32) -> Self {
        self.expectation.response.status = if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        };
        self
    }

    pub fn finish(self) {
        lock(&self.runner.expectations).push(self.expectation);
    }
}

impl MockSpawnConfig {
    pub fn emits(mut self, text: &str) -> Self {
        self.script.chunks.push((StreamSource::Stdout, text.to_string()));
        self
    }

    pub fn emits_stderr(mut self, text: &str) -> Self {
        self.script.chunks.push((StreamSource::Stderr, text.to_string()));
        self
    }

    /// Exit right after the scripted output instead of running until stopped.
    pub fn exits_with(mut self, code: i32) -> Self {
        self.script.exit = Some(if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Error(code)
        });
        self
    }

    /// Make the spawn itself fail as if the program did not exist.
    pub fn fails(mut self) -> Self {
        self.script.fail = true;
        self
    }

    pub fn finish(self) {
        lock(&self.runner.spawn_scripts).push_back(self.script);
    }
}

/// Test-side handle to a process created by [`MockProcessRunner::spawn`]
#[derive(Clone)]
pub struct MockProcess {
    pid: u32,
    command: ProcessCommand,
    writer: StreamWriter,
    exit: Arc<watch::Sender<Option<ExitStatus>>>,
    terminated: Arc<AtomicBool>,
}

impl MockProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &ProcessCommand {
        &self.command
    }

    pub fn emit(&self, text: &str) -> bool {
        self.writer.append(StreamSource::Stdout, text)
    }

    pub fn emit_stderr(&self, text: &str) -> bool {
        self.writer.append(StreamSource::Stderr, text)
    }

    /// End the process: record its status, then close its output.
    pub fn exit(&self, status: ExitStatus) {
        self.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(status);
            true
        });
        self.writer.close();
    }

    pub fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    pub fn was_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

struct MockControl(MockProcess);

#[async_trait]
impl ProcessControl for MockControl {
    fn exit_status(&self) -> Option<ExitStatus> {
        (*self.0.exit.borrow()).clone()
    }

    async fn wait(&self) -> ExitStatus {
        let mut exit = self.0.exit.subscribe();
        exit.wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|s| (*s).clone())
            .unwrap_or(ExitStatus::Unknown)
    }

    async fn terminate(&self, _grace: Duration) -> Result<ExitStatus, ProcessError> {
        self.0.terminated.store(true, Ordering::SeqCst);
        self.0.exit(ExitStatus::Signal(SIGTERM));
        Ok(self.wait().await)
    }

    fn kill_now(&self) {
        self.0.terminated.store(true, Ordering::SeqCst);
        self.0.exit(ExitStatus::Signal(SIGKILL));
    }
}

fn unexpected(command: &ProcessCommand) -> ProcessError {
    ProcessError::SpawnFailed {
        command: command.display(),
        source: std::io::Error::other("no mock expectation for this command"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
