//! Handle to a scheduled subtask.

use uuid::Uuid;

/// Reference to a nested run scheduled with `run_no_wait`.
///
/// Holding a handle does not block the parent; awaiting its result with
/// `result_of` is a separate durable operation, which is what makes
/// fan-out (schedule several, then await each) replay-safe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtaskHandle {
    /// Declaration name of the child.
    pub name: String,
    /// The child run.
    pub run_id: Uuid,
}

impl SubtaskHandle {
    /// Create a handle.
    pub fn new(name: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            name: name.into(),
            run_id,
        }
    }
}
