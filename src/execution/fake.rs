// src/execution/fake.rs

//! Scripted executor for exercising bootstrap protocols without external tools.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::executor::{log_output, CommandOutput, CommandSpec, ExecutionError, Executor};

/// Handler called for every executed command
pub(crate) type HandlerFn = dyn FnMut(&CommandSpec) -> CommandOutput + Send;

/// An executor which records inputs and responds with scripted outputs.
pub(crate) struct FakeExecutor {
    calls: Mutex<Vec<CommandSpec>>,
    handler: Mutex<Box<HandlerFn>>,
}

impl FakeExecutor {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            handler: Mutex::new(Box::new(|_| CommandOutput::success(""))),
        })
    }

    /// Set the handler to an arbitrary function.
    pub(crate) fn set_handler(&self, f: Box<HandlerFn>) {
        *self.handler.lock().unwrap() = f;
    }

    /// Every command executed so far.
    pub(crate) fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Arguments of every command executed so far, joined by spaces.
    pub(crate) fn command_lines(&self) -> Vec<String> {
        self.calls()
            .iter()
            .map(|c| c.args.join(" "))
            .collect()
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute(&self, command: &CommandSpec) -> Result<CommandOutput, ExecutionError> {
        self.calls.lock().unwrap().push(command.clone());
        let output = (self.handler.lock().unwrap())(command);
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
