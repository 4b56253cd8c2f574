//! Terminal run errors persisted on task runs.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a terminal run error.
///
/// The kind fixes the retry discipline that was applied before the run
/// reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Input or output schema mismatch. Never retried.
    Validation,
    /// User handler failure; retry budget was exhausted.
    Handler,
    /// Checkpoint replay mismatch. Never retried.
    Determinism,
    /// Schedule or execution timeout. Retried like a handler error.
    Timeout,
    /// The run was cancelled.
    Cancelled,
}

/// A terminal error recorded on a failed task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct RunError {
    /// Error classification.
    pub kind: ErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl RunError {
    /// Create a run error.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Validation error (never retried).
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Handler error (retry budget exhausted).
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Handler, message)
    }

    /// Determinism violation (never retried).
    pub fn determinism(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Determinism, message)
    }

    /// Timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Cancellation marker.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "run was cancelled")
    }

    /// Whether this error kind may consume retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, ErrorKind::Handler | ErrorKind::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_discipline() {
        assert!(RunError::handler("boom").is_retryable());
        assert!(RunError::timeout("slow").is_retryable());
        assert!(!RunError::validation("bad input").is_retryable());
        assert!(!RunError::determinism("mismatch").is_retryable());
        assert!(!RunError::cancelled().is_retryable());
    }

    #[test]
    fn test_roundtrip() {
        let err = RunError::validation("missing field");
        let json = serde_json::to_value(&err).unwrap();
        let back: RunError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }
}
