//! Checkpoint events and pending durable operations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of durable operation a checkpoint records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    /// A nested task run was enqueued (`run_no_wait` / first half of `run`).
    SubtaskScheduled,
    /// A nested task run's terminal result was awaited.
    SubtaskResult,
    /// A `sleep_for` timer.
    Sleep,
    /// A `wait_for` over one or more conditions.
    WaitCondition,
}

/// Deterministic identity of one durable operation.
///
/// On replay the handler must issue an operation with an identical signature
/// at the same sequence position; anything else is a determinism violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpSignature {
    /// Operation kind.
    pub kind: OpKind,
    /// Operation target: declaration name, child run id, or event summary.
    pub target: String,
    /// Operation input: subtask input, sleep millis, or condition spec.
    pub input: serde_json::Value,
}

impl OpSignature {
    /// Create a signature.
    pub fn new(kind: OpKind, target: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            kind,
            target: target.into(),
            input,
        }
    }
}

/// Persisted record of one durable operation's outcome within a task run.
///
/// Events are append-only and keyed by `(run_id, seq)`; the store commits
/// each position exactly once (first-writer-wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointEvent {
    /// Sequence position within the run, in issuance order.
    pub seq: u32,
    /// Signature of the operation this event resolves.
    pub signature: OpSignature,
    /// The recorded outcome, reused verbatim on replay.
    pub outcome: serde_json::Value,
    /// When the outcome was committed.
    pub recorded_at: DateTime<Utc>,
}

impl CheckpointEvent {
    /// Create an event recorded now.
    pub fn new(seq: u32, signature: OpSignature, outcome: serde_json::Value) -> Self {
        Self {
            seq,
            signature,
            outcome,
            recorded_at: Utc::now(),
        }
    }
}

/// What resolves a pending durable operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum WakeCondition {
    /// A child run reaching a terminal status.
    ChildCompletion {
        /// The awaited child run.
        child_run_id: Uuid,
    },
    /// A timer firing.
    Timer {
        /// Absolute fire time.
        fire_at: DateTime<Utc>,
    },
    /// A user event being published, with an optional deadline after which
    /// the branch resolves as timed out.
    Event {
        /// Event name.
        name: String,
        /// Optional timeout deadline.
        #[serde(skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },
    /// The parent run reaching a terminal status, with an optional deadline.
    ParentCompletion {
        /// The parent run.
        parent_run_id: Uuid,
        /// Optional timeout deadline.
        #[serde(skip_serializing_if = "Option::is_none")]
        deadline: Option<DateTime<Utc>>,
    },
    /// First of several branches to fire wins; the rest are cancelled.
    #[serde(untagged)]
    Any(Vec<WakeCondition>),
}

impl WakeCondition {
    /// Flat view of leaf branches.
    pub fn leaves(&self) -> Vec<&WakeCondition> {
        match self {
            WakeCondition::Any(branches) => branches.iter().flat_map(|b| b.leaves()).collect(),
            leaf => vec![leaf],
        }
    }
}

/// An issued-but-unresolved durable operation.
///
/// Re-delivery of a suspended run finds its pending operations here and
/// suspends again instead of re-issuing the side effect. The wake-up service
/// resolves them into checkpoint events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOp {
    /// Owning run.
    pub run_id: Uuid,
    /// Sequence position the resolved checkpoint will occupy.
    pub seq: u32,
    /// Signature of the issued operation.
    pub signature: OpSignature,
    /// What resolves it.
    pub wake: WakeCondition,
    /// When the operation was issued.
    pub created_at: DateTime<Utc>,
}

impl PendingOp {
    /// Create a pending operation issued now.
    pub fn new(run_id: Uuid, seq: u32, signature: OpSignature, wake: WakeCondition) -> Self {
        Self {
            run_id,
            seq,
            signature,
            wake,
            created_at: Utc::now(),
        }
    }
}
