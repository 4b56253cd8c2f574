//! Task runs: one execution instance of a declared workflow.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::concurrency::RunConcurrency;
use crate::error::RunError;
use crate::types::{Metadata, Priority, RunStatus, WorkflowKind};

fn default_execution_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_schedule_timeout() -> Duration {
    Duration::from_secs(300)
}

/// One execution instance of a workflow declaration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    /// Unique run ID.
    pub id: Uuid,
    /// Declaration name this run executes.
    pub declaration: String,
    /// Declaration kind, resolved at enqueue time so workers can pick the
    /// right slot pool without a registry lookup.
    pub kind: WorkflowKind,
    /// Input payload.
    pub input: serde_json::Value,
    /// Current status.
    pub status: RunStatus,
    /// Run priority.
    pub priority: Priority,
    /// Number of retry attempts consumed.
    pub retry_count: u32,
    /// Maximum retries allowed.
    pub max_retries: u32,
    /// Parent run back-reference for nested calls (lookup only).
    pub parent_run: Option<Uuid>,
    /// Resolved concurrency constraint, if the declaration has one.
    pub concurrency: Option<RunConcurrency>,
    /// Wall-clock budget for one execution attempt.
    #[serde(default = "default_execution_timeout")]
    pub execution_timeout: Duration,
    /// Queue-wait budget before the first attempt starts.
    #[serde(default = "default_schedule_timeout")]
    pub schedule_timeout: Duration,
    /// Earliest delivery time (None = immediate).
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// Lease expiry while claimed by a worker; an expired lease makes the
    /// run eligible for re-delivery (at-least-once).
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Worker currently holding the claim.
    pub worker_id: Option<String>,
    /// Set when a pending operation resolved while an attempt was still
    /// executing; the suspend transition turns into an immediate requeue.
    #[serde(default)]
    pub wake_pending: bool,
    /// Accumulated metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Terminal output, once succeeded.
    pub output: Option<serde_json::Value>,
    /// Terminal error, once failed.
    pub error: Option<RunError>,
}

impl TaskRun {
    /// Create a new queued run.
    pub fn new(
        declaration: impl Into<String>,
        kind: WorkflowKind,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            declaration: declaration.into(),
            kind,
            input,
            status: RunStatus::Queued,
            priority: Priority::Normal,
            retry_count: 0,
            max_retries: 0,
            parent_run: None,
            concurrency: None,
            execution_timeout: default_execution_timeout(),
            schedule_timeout: default_schedule_timeout(),
            scheduled_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            lease_expires_at: None,
            worker_id: None,
            wake_pending: false,
            metadata: Metadata::new(),
            output: None,
            error: None,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set maximum retries.
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Set the parent run back-reference.
    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent_run = Some(parent);
        self
    }

    /// Set earliest delivery time.
    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Set the resolved concurrency constraint.
    pub fn with_concurrency(mut self, concurrency: RunConcurrency) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Set timeouts.
    pub fn with_timeouts(mut self, execution: Duration, schedule: Duration) -> Self {
        self.execution_timeout = execution;
        self.schedule_timeout = schedule;
        self
    }

    /// Whether the retry budget allows another attempt.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Whether the run is eligible for delivery right now.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if self.status != RunStatus::Queued {
            return false;
        }
        match self.scheduled_at {
            Some(at) => at <= now,
            None => true,
        }
    }

    /// Deadline for the first attempt to start.
    pub fn schedule_deadline(&self) -> DateTime<Utc> {
        let base = self.scheduled_at.unwrap_or(self.created_at);
        base + chrono::Duration::from_std(self.schedule_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(300))
    }
}

/// Per-call overrides for the scheduling entry points.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Override the declaration's default priority.
    pub priority: Option<Priority>,
    /// Override the declaration's retry budget.
    pub max_retries: Option<u32>,
    /// Earliest delivery time.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Metadata to attach to the run.
    pub metadata: Metadata,
}

/// Enqueue parameters for a nested call, resolved from a declaration.
///
/// Carries everything the durable context needs to enqueue a child run
/// without a registry lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Declaration name.
    pub name: String,
    /// Declaration kind.
    pub kind: WorkflowKind,
    /// Retry budget.
    pub max_retries: u32,
    /// Default priority.
    pub priority: Priority,
    /// Execution timeout.
    pub execution_timeout: Duration,
    /// Schedule timeout.
    pub schedule_timeout: Duration,
    /// Concurrency policy to resolve against the child input.
    pub concurrency: Option<crate::concurrency::ConcurrencyPolicy>,
}

impl SubtaskSpec {
    /// Build the child run for this spec.
    pub fn child_run(&self, input: serde_json::Value, parent: Uuid) -> TaskRun {
        let concurrency = self.concurrency.as_ref().map(|p| p.resolve(&input));
        let mut run = TaskRun::new(self.name.clone(), self.kind, input)
            .with_parent(parent)
            .with_priority(self.priority)
            .with_max_retries(self.max_retries)
            .with_timeouts(self.execution_timeout, self.schedule_timeout);
        run.concurrency = concurrency;
        run
    }
}
