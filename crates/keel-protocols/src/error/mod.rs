//! Error taxonomy for the runtime.
//!
//! Each concern gets its own enum. The retry discipline is fixed by kind:
//! validation and determinism errors are never retried, handler and timeout
//! errors consume the run's retry budget, selection errors are retried
//! against the model a bounded number of times.

mod durable;
mod handler;
mod provider;
mod run;
mod store;

pub use durable::DurableError;
pub use handler::HandlerError;
pub use provider::ProviderError;
pub use run::{ErrorKind, RunError};
pub use store::StoreError;

use thiserror::Error;

/// Duration string parse errors (configuration-time).
#[derive(Debug, Error)]
pub enum DurationError {
    /// Empty duration string.
    #[error("duration string is empty")]
    Empty,

    /// No unit suffix.
    #[error("duration '{0}' has no unit suffix")]
    MissingUnit(String),

    /// More than one unit.
    #[error("duration '{0}' mixes multiple units; use a single unit suffix")]
    MultiUnit(String),

    /// Unsupported unit suffix.
    #[error("unsupported duration unit '{0}'")]
    UnknownUnit(String),

    /// Not a parsable duration.
    #[error("invalid duration string '{0}'")]
    Invalid(String),
}

/// Tool selection errors from the toolbox layer.
#[derive(Debug, Error)]
pub enum SelectionError {
    /// The model selected a tool that is not in the declared set.
    #[error("model selected undeclared tool '{0}'")]
    UnknownTool(String),

    /// The model produced arguments that fail the tool's input schema.
    #[error("arguments for tool '{name}' failed schema validation: {message}")]
    InvalidArguments {
        /// Tool name.
        name: String,
        /// Validation failure detail.
        message: String,
    },

    /// The model output could not be parsed as a selection at all.
    #[error("model output is not a valid selection: {0}")]
    Unparseable(String),

    /// The model selected nothing.
    #[error("model selected no tools")]
    NoSelection,

    /// All re-prompt attempts were exhausted.
    #[error("selection failed after {attempts} attempts: {last_error}")]
    AttemptsExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The final attempt's error.
        last_error: String,
    },

    /// Underlying provider call failed.
    #[error(transparent)]
    Provider(#[from] ProviderError),
}
