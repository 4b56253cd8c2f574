//! Parsed tool selections.

use serde::{Deserialize, Serialize};

/// One tool the model selected, with the arguments it proposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSelection {
    /// Declared tool name.
    pub name: String,
    /// Arguments, validated against the tool's input schema.
    pub args: serde_json::Value,
}

/// Wire shape the model is prompted to produce.
#[derive(Debug, Deserialize)]
pub(crate) struct SelectionResponse {
    pub selections: Vec<ToolSelection>,
}
