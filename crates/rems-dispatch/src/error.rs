//! Dispatcher error types.

use thiserror::Error;

use crate::execution::ExecutionState;

/// Errors reported by a task runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The execution environment refused the run request.
    #[error("run request rejected: {0}")]
    Rejected(String),

    /// A status lookup failed; treated as transient while polling.
    #[error("status lookup failed: {0}")]
    Lookup(String),

    #[error("runner i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors internal to the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("illegal execution transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    #[error("invalid dispatch target: {0}")]
    InvalidTarget(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;
