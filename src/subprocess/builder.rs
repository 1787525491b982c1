use std::path::Path;
use std::time::Duration;

use crate::subprocess::ProcessCommand;

/// Fluent construction of a [`ProcessCommand`]
///
/// Commands start with no arguments, the inherited environment, the current
/// directory, no timeout and stdin closed.
pub struct ProcessCommandBuilder {
    command: ProcessCommand,
}

impl ProcessCommandBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            command: ProcessCommand {
                program: program.to_string(),
                args: Vec::new(),
                env: Default::default(),
                working_dir: None,
                timeout: None,
                stdin: None,
            },
        }
    }

    /// `shell -c script`, the way manifest scripts are started.
    pub fn shell_script(shell: &str, script: &str) -> Self {
        Self::new(shell).args(["-c", script])
    }

    pub fn arg(self, arg: &str) -> Self {
        self.args([arg])
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args = args.into_iter().map(|arg| arg.as_ref().to_owned());
        self.command.args.extend(args);
        self
    }

    /// Run the command inside `dir` instead of the current directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.command.working_dir = Some(dir.as_ref().to_owned());
        self
    }

    /// Only honoured by one-shot runs; spawned processes live until stopped.
    pub fn timeout(mut self, limit: Duration) -> Self {
        self.command.timeout = Some(limit);
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.command.stdin = Some(input.into());
        self
    }

    pub fn build(self) -> ProcessCommand {
        self.command
    }
}
