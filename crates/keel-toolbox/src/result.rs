//! Executed selection results.

/// The output of one executed tool selection.
///
/// Consumed by matching on `name`; keep [`assert_exhaustive`] as the
/// fallback arm so an unhandled tool aborts loudly instead of being
/// silently dropped.
#[derive(Debug, Clone)]
pub struct ToolResult {
    /// Tool that ran.
    pub name: String,
    /// Arguments it ran with.
    pub args: serde_json::Value,
    /// Validated output.
    pub output: serde_json::Value,
}

impl ToolResult {
    /// Output deserialized into a concrete type.
    pub fn output_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.output.clone())
    }
}

/// Always-diverging fallback for match-over-name dispatch.
///
/// Reaching this means a tool was added to the toolbox without a matching
/// arm in the caller's dispatch; that is a programming error, not a
/// runtime condition to recover from.
pub fn assert_exhaustive(result: &ToolResult) -> ! {
    panic!(
        "unhandled tool result '{}'; add a match arm for it",
        result.name
    )
}
