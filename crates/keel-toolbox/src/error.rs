use thiserror::Error;

use keel_core::CoreError;
use keel_protocols::SelectionError;

/// Errors from toolbox construction and selection-driven execution.
#[derive(Debug, Error)]
pub enum ToolboxError {
    /// The model never produced a usable selection.
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// Scheduling or executing a selected tool failed.
    #[error(transparent)]
    Run(#[from] CoreError),

    /// The named declaration exists but is not a tool.
    #[error("declaration '{0}' is an agent, not a tool")]
    NotATool(String),
}
