//! Error types for the executor and its environment providers.
//!
//! Only failures that happen before user code runs are errors. A block
//! that exits non-zero, times out, or is cancelled is reported through
//! the result's exit code instead.

use thiserror::Error;

use crate::executor::EnvironmentStatus;

/// Errors surfaced by [`CodeExecutor`](crate::executor::CodeExecutor).
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// The operation is not valid for the current lifecycle state.
    #[error("cannot {operation} while environment is {status}")]
    InvalidState {
        operation: &'static str,
        status: EnvironmentStatus,
    },

    /// The isolated runtime could not be brought up.
    #[error("failed to start execution environment: {0}")]
    EnvironmentStart(String),

    /// A block used a language tag with no known run command.
    #[error("unsupported language: '{0}'")]
    UnsupportedLanguage(String),

    /// A `filename:` directive named a file outside the workspace or
    /// collided with another block in the same call.
    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    /// Another `execute_code_blocks` call is already in flight.
    #[error("another execution is already in progress on this environment")]
    ConcurrentExecution,

    /// Writing a block's source into the working directory failed.
    #[error("failed to stage code block: {0}")]
    Staging(#[source] std::io::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Errors from an [`EnvironmentProvider`](crate::backend::EnvironmentProvider).
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("exec failed: {0}")]
    Exec(String),
}

pub type Result<T, E = ExecutorError> = std::result::Result<T, E>;
