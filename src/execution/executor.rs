// src/execution/executor.rs

//! One-shot external commands: the admin tool, keytool, git and setup scripts.
//!
//! Everything that shells out goes through [`Executor`] so bootstrap protocols
//! can be driven against scripted output under test.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

/// Description of a command, rendered into a process on demand
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable
    pub program: String,

    /// Arguments
    pub args: Vec<String>,

    /// Working directory, inherited when absent
    pub cwd: Option<PathBuf>,

    /// Extra environment variables
    pub env: BTreeMap<String, String>,

    /// Upper bound on the run, after which the child is killed
    pub timeout: Option<Duration>,

    /// Indices of arguments never written to logs
    redacted: BTreeSet<usize>,
}

impl CommandSpec {
    /// Creates a command for a program
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends an argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends an argument that is masked in logs and errors
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.redacted.insert(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Sets the working directory
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Adds an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Bounds the run
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds a process with null stdin; stdio is left to the caller
    pub fn to_command(&self) -> tokio::process::Command {
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).envs(&self.env).stdin(Stdio::null());
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for (i, arg) in self.args.iter().enumerate() {
            if self.redacted.contains(&i) {
                f.write_str(" ****")?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, absent when killed by a signal or the timeout
    pub status: Option<i32>,

    /// Standard output
    pub stdout: String,

    /// Standard error
    pub stderr: String,

    /// Whether the timeout expired and the child was killed
    pub timed_out: bool,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    /// Failed output with the given code and stderr
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Whether the command exited with status 0
    pub fn is_success(&self) -> bool {
        self.status == Some(0)
    }
}

/// External command errors
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command {command} failed with status {status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared, cheaply cloned executor handle
pub type BoxedExecutor = Arc<dyn Executor>;

/// Runs [`CommandSpec`]s to completion
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs a command, waiting for it to exit or time out.
    ///
    /// A nonzero exit is an error; a timeout is not, the caller inspects
    /// [`CommandOutput::timed_out`].
    async fn execute(&self, command: &CommandSpec) -> Result<CommandOutput, ExecutionError>;
}

/// Executor running commands on the host
#[derive(Debug, Default, Clone)]
pub struct HostExecutor;

impl HostExecutor {
    /// Creates a host executor
    pub fn new() -> Self {
        Self
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self) -> BoxedExecutor {
        Arc::new(self)
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute(&self, command: &CommandSpec) -> Result<CommandOutput, ExecutionError> {
        info!(command = %command, cwd = ?command.cwd, "running command");

        let mut process = command.to_command();
        process
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = process.spawn().map_err(|source| ExecutionError::Spawn {
            command: command.to_string(),
            source,
        })?;

        let waited = match command.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(result) => Some(result?),
                Err(_) => None,
            },
            None => Some(child.wait_with_output().await?),
        };

        let output = match waited {
            Some(output) => CommandOutput {
                status: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            },
            None => {
                info!(command = %command, "command timed out and was killed");
                CommandOutput {
                    timed_out: true,
                    ..CommandOutput::default()
                }
            }
        };

        log_output(command, &output);

        if !output.timed_out && !output.is_success() {
            return Err(ExecutionError::CommandFailed {
                command: command.to_string(),
                status: output.status,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }
}

pub(crate) fn log_output(command: &CommandSpec, output: &CommandOutput) {
    info!(
        command = %command,
        result = if output.is_success() { "OK" } else { "ERROR" },
        status = ?output.status,
        "finished running command"
    );
    if !output.stdout.is_empty() {
        debug!(stdout = %output.stdout.trim_end(), "finished command stdout");
    }
    if !output.stderr.is_empty() {
        debug!(stderr = %output.stderr.trim_end(), "finished command stderr");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_arguments_are_masked() {
        let spec = CommandSpec::new("java")
            .args(["-jar", "cenm-tool.jar", "context", "login"])
            .arg("-u")
            .arg("admin")
            .arg("-p")
            .secret_arg("hunter2");

        assert_eq!(
            spec.to_string(),
            "java -jar cenm-tool.jar context login -u admin -p ****"
        );
        assert_eq!(spec.args.last().map(String::as_str), Some("hunter2"));
    }

    #[tokio::test]
    async fn host_executor_captures_stdout() {
        let output = HostExecutor::new()
            .execute(&CommandSpec::new("sh").args(["-c", "echo token-123"]))
            .await
            .unwrap();

        assert!(output.is_success());
        assert_eq!(output.stdout.trim(), "token-123");
    }

    #[tokio::test]
    async fn host_executor_reports_nonzero_exit() {
        let err = HostExecutor::new()
            .execute(&CommandSpec::new("sh").args(["-c", "echo nope >&2; exit 3"]))
            .await
            .unwrap_err();

        match err {
            ExecutionError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert_eq!(stderr.trim(), "nope");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn host_executor_kills_on_timeout() {
        let output = HostExecutor::new()
            .execute(
                &CommandSpec::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap();

        assert!(output.timed_out);
        assert_eq!(output.status, None);
    }

    #[tokio::test]
    async fn host_executor_reports_missing_program() {
        let err = HostExecutor::new()
            .execute(&CommandSpec::new("netdeploy-no-such-program"))
            .await
            .unwrap_err();

        assert!(matches!(err, ExecutionError::Spawn { .. }));
    }
}
