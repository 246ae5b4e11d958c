//! Errors returned by the sandboxed executor.

use std::time::Duration;

/// Errors returned by [`SandboxExecutor`](crate::executor::SandboxExecutor).
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// `execute` was called before `start` completed.
    #[error("sandbox not started: call start() before executing code")]
    NotStarted,

    /// `start` was called on a session that is already running.
    #[error("sandbox already started (container {0})")]
    AlreadyStarted(String),

    /// The session has been stopped and cannot be used again.
    #[error("sandbox has been stopped")]
    Stopped,

    /// The isolated runtime could not be provisioned.
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// The host runtime broke while running code (CLI missing, daemon gone).
    #[error("runtime error: {0}")]
    Runtime(String),

    /// Execution exceeded the configured wall-clock bound.
    #[error("execution timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { elapsed: Duration, limit: Duration },

    /// The code ran but exited non-zero.
    #[error("execution failed with exit code {exit_code}: {stderr}")]
    Execution { exit_code: i32, stderr: String },

    /// Cleanup of the isolated runtime failed.
    #[error("teardown error: {0}")]
    Teardown(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Host filesystem error (working directory, code files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Wrong-state call ordering.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ExecutorError::NotStarted | ExecutorError::AlreadyStarted(_) | ExecutorError::Stopped
        )
    }

    pub(crate) fn provisioning(err: anyhow::Error) -> Self {
        ExecutorError::Provisioning(format!("{:#}", err))
    }

    pub(crate) fn teardown(err: anyhow::Error) -> Self {
        ExecutorError::Teardown(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, ExecutorError>;
