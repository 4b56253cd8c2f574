//! Declaration, registry, and client errors.

use thiserror::Error;

use keel_protocols::{DurationError, RunError, StoreError};

/// Errors from declaring, registering, and scheduling workflows.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A declaration with this name is already registered.
    #[error("declaration '{0}' is already registered")]
    DuplicateDeclaration(String),

    /// The builder finished without a handler.
    #[error("declaration '{0}' has no handler")]
    MissingHandler(String),

    /// The handler kind does not match the declared kind.
    #[error("declaration '{0}' kind does not match its handler")]
    KindMismatch(String),

    /// An input or output schema failed to compile.
    #[error("invalid schema on declaration '{name}': {message}")]
    InvalidSchema {
        /// Declaration name.
        name: String,
        /// Compiler message.
        message: String,
    },

    /// A duration string failed to parse.
    #[error("invalid duration on declaration '{name}': {source}")]
    InvalidDuration {
        /// Declaration name.
        name: String,
        /// Parse failure.
        #[source]
        source: DurationError,
    },

    /// A cron expression failed to parse.
    #[error("invalid cron expression '{expression}': {message}")]
    InvalidCron {
        /// The offending expression.
        expression: String,
        /// Parser message.
        message: String,
    },

    /// No declaration registered under this name.
    #[error("unknown declaration '{0}'")]
    UnknownDeclaration(String),

    /// Input rejected by the declaration's input schema.
    #[error("input rejected for '{name}': {message}")]
    InvalidInput {
        /// Declaration name.
        name: String,
        /// Validation message.
        message: String,
    },

    /// The awaited run reached a terminal failure.
    #[error("run of '{name}' failed: {error}")]
    RunFailed {
        /// Declaration name.
        name: String,
        /// The terminal error.
        error: RunError,
    },

    /// Record store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
