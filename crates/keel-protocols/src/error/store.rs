//! Task record store errors.

use thiserror::Error;
use uuid::Uuid;

/// Record store error types.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Run not found.
    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    /// Declaration referenced by a run or cron entry is unknown to the store.
    #[error("unknown declaration: {0}")]
    UnknownDeclaration(String),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic error.
    #[error("{0}")]
    Custom(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
