//! Common types shared across the runtime.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Additional key-value metadata attached to runs and declarations.
pub type Metadata = HashMap<String, serde_json::Value>;

/// What kind of workflow a declaration describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    /// Side-effecting work executed on an ordinary slot with a plain context.
    Tool,
    /// Orchestration work executed on a durable slot with a replay context.
    Agent,
}

/// Run priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    /// Low priority.
    Low = 0,
    /// Normal priority.
    Normal = 1,
    /// High priority.
    High = 2,
    /// Critical priority.
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Task run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting in the queue for delivery.
    Queued,
    /// Claimed by a worker and executing.
    Running,
    /// Suspended on a pending wake condition; holds no slot or thread.
    Waiting,
    /// Completed with a validated output.
    Succeeded,
    /// Terminally failed.
    Failed,
    /// Cancelled by a caller or by parent cancellation.
    Cancelled,
}

impl RunStatus {
    /// Stable tag for storage index columns, matching the serde name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Waiting => "waiting",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Queued
    }
}
