//! Host command execution
//!
//! Every external program the executor drives (`docker`, `ignite`, the
//! pipeline scripts themselves) is described by a [`CommandSpec`] and run
//! through the [`Command`] trait. [`ProcessCommand`] is the only place that
//! spawns host processes; tests substitute a fake.

#[cfg(test)]
pub mod fake;
mod process;
mod skip;

pub use process::ProcessCommand;
pub use skip::next_step;

use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::service::LogBufferService;

/// One OS-level invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Correlation key of the execution-log entry
    pub key: String,
    /// argv; the first element is the program
    pub command: Vec<String>,
    /// Working directory, inherited when unset
    pub dir: Option<PathBuf>,
    /// Extra environment, added on top of the executor's own
    pub env: Vec<(String, String)>,
    /// Name of the tracing span wrapping the invocation
    pub operation: String,
    /// Values masked wherever the argv is logged
    pub secrets: Vec<String>,
}

/// Replacement for secret values in logged argvs
pub const REDACTED: &str = "******";

impl CommandSpec {
    pub fn new(key: impl Into<String>, command: Vec<String>) -> Self {
        Self {
            key: key.into(),
            command,
            dir: None,
            env: Vec::new(),
            operation: "command.run".to_string(),
            secrets: Vec::new(),
        }
    }

    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    pub fn with_secrets(mut self, secrets: impl IntoIterator<Item = String>) -> Self {
        self.secrets
            .extend(secrets.into_iter().filter(|s| !s.is_empty()));
        self
    }

    /// argv with every secret value masked, for logs
    pub fn redacted_command(&self) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| {
                self.secrets
                    .iter()
                    .fold(arg.clone(), |arg, secret| arg.replace(secret.as_str(), REDACTED))
            })
            .collect()
    }

    /// Name of the program being run
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }
}

/// Errors produced while running a command
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command '{key}' has an empty argv")]
    Empty { key: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command '{key}' exited with code {code}")]
    NonZeroExit { key: String, code: i32 },

    #[error("command '{key}' was terminated by a signal")]
    Signal { key: String },

    #[error("command '{key}' was cancelled")]
    Cancelled { key: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    /// True when the command ran and reported failure itself
    pub fn is_exit_failure(&self) -> bool {
        matches!(
            self,
            CommandError::NonZeroExit { .. } | CommandError::Signal { .. }
        )
    }
}

/// Single-quotes a string for `/bin/sh`
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs one [`CommandSpec`], streaming its output into a log buffer
#[async_trait]
pub trait Command: Send + Sync {
    /// Executes the command to completion
    ///
    /// # Arguments
    /// * `cancel` - Fires on shutdown; the process is killed when it does
    /// * `logs` - Receives one entry with the command's output and exit code
    /// * `spec` - What to run
    async fn run(
        &self,
        cancel: &CancellationToken,
        logs: &dyn LogBufferService,
        spec: &CommandSpec,
    ) -> Result<(), CommandError>;
}
