//! Errors thrown by user handler code.

use thiserror::Error;

use super::StoreError;

/// Handler error types.
///
/// A `HandlerError` consumes the run's retry budget; once retries are
/// exhausted it becomes a fatal failure.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler failed with an application error.
    #[error("{0}")]
    Failed(String),

    /// The handler observed cancellation and exited.
    #[error("run was cancelled")]
    Cancelled,

    /// I/O error inside the handler.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Record store failure surfaced through a context call.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl HandlerError {
    /// Convenience constructor for application failures.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }
}
