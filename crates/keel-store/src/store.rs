//! Record store contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use keel_protocols::{
    CheckpointEvent, PendingOp, RunError, RunStatus, StoreError, SubtaskSpec, TaskRun,
};

/// A registered cron schedule.
///
/// The wake-up service materializes a fresh task run whenever
/// `next_fire_at` passes, then advances it from the expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronEntry {
    /// Unique schedule name.
    pub name: String,
    /// Cron expression (parsed and validated at registration time).
    pub expression: String,
    /// Enqueue parameters for materialized runs.
    pub spec: SubtaskSpec,
    /// Input passed to every materialized run.
    pub input: serde_json::Value,
    /// Next fire time.
    pub next_fire_at: DateTime<Utc>,
    /// When the schedule was registered.
    pub created_at: DateTime<Utc>,
}

/// Durable log of task runs and their checkpoint histories.
///
/// This is the contract the broker must provide to the execution core.
/// Delivery is at-least-once: a worker crash makes claimed runs eligible for
/// re-delivery once their lease expires, and duplicate delivery of a
/// completed run must be recognized by status and absorbed, never
/// re-executed.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // ---- run lifecycle ----

    /// Persist a new queued run.
    async fn enqueue(&self, run: TaskRun) -> Result<Uuid, StoreError>;

    /// Load a run by id.
    async fn get_run(&self, id: Uuid) -> Result<Option<TaskRun>, StoreError>;

    /// Claim the next deliverable run for a worker.
    ///
    /// Respects `scheduled_at`, priority ordering (priority descending, then
    /// creation time ascending), and concurrency bounds. The claimed run is
    /// marked running and holds a lease for `lease`.
    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<TaskRun>, StoreError>;

    /// Transition a running run to waiting after a suspend outcome.
    ///
    /// If a pending operation resolved while the attempt was still executing
    /// the run is requeued immediately instead of parked.
    async fn suspend(&self, id: Uuid) -> Result<(), StoreError>;

    /// Record a terminal outcome. Returns `false` when the run already
    /// reached a terminal status (duplicate completion is absorbed).
    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<RunError>,
    ) -> Result<bool, StoreError>;

    /// Consume one retry and requeue the run after `delay`.
    async fn requeue_for_retry(
        &self,
        id: Uuid,
        error: RunError,
        delay: Duration,
    ) -> Result<(), StoreError>;

    /// Cancel a run and propagate cancellation to its direct children.
    async fn cancel(&self, id: Uuid) -> Result<(), StoreError>;

    /// Re-arm the execution lease of a running run.
    async fn refresh_timeout(&self, id: Uuid, extension: Duration) -> Result<(), StoreError>;

    /// Requeue runs whose worker lease expired (abandoned by a dead worker).
    /// Returns how many runs were made re-deliverable.
    async fn requeue_expired_leases(&self) -> Result<u32, StoreError>;

    /// Fail queued runs whose schedule timeout passed before a first
    /// attempt started. Returns how many runs were expired.
    async fn expire_schedule_timeouts(&self) -> Result<u32, StoreError>;

    /// List the direct children of a run.
    async fn list_children(&self, parent: Uuid) -> Result<Vec<TaskRun>, StoreError>;

    // ---- checkpoint history ----

    /// Append a checkpoint event. Returns `false` when `(run_id, seq)` is
    /// already recorded: the first writer wins and later writers must treat
    /// the recorded event as authoritative.
    async fn append_checkpoint(
        &self,
        run_id: Uuid,
        event: CheckpointEvent,
    ) -> Result<bool, StoreError>;

    /// Read a run's checkpoint history ordered by sequence.
    async fn read_checkpoints(&self, run_id: Uuid) -> Result<Vec<CheckpointEvent>, StoreError>;

    // ---- pending operations ----

    /// Record an issued-but-unresolved durable operation.
    async fn add_pending_op(&self, op: PendingOp) -> Result<(), StoreError>;

    /// Pending operations for one run.
    async fn pending_ops(&self, run_id: Uuid) -> Result<Vec<PendingOp>, StoreError>;

    /// All pending operations (scanned by the wake-up service).
    async fn all_pending_ops(&self) -> Result<Vec<PendingOp>, StoreError>;

    /// Resolve a pending operation into a checkpoint event and wake its run.
    /// Returns `false` when no such operation is pending.
    async fn resolve_pending_op(
        &self,
        run_id: Uuid,
        seq: u32,
        outcome: serde_json::Value,
    ) -> Result<bool, StoreError>;

    // ---- user events ----

    /// Publish a user event, resolving every live subscription to `name`.
    /// Returns the number of runs woken.
    async fn publish_event(&self, name: &str, payload: serde_json::Value)
        -> Result<u32, StoreError>;

    // ---- cron schedules ----

    /// Register a cron schedule. Replaces an existing entry with the same
    /// name.
    async fn add_cron(&self, entry: CronEntry) -> Result<(), StoreError>;

    /// All registered cron schedules.
    async fn cron_entries(&self) -> Result<Vec<CronEntry>, StoreError>;

    /// Advance a schedule's next fire time.
    async fn update_cron_next(&self, name: &str, next: DateTime<Utc>) -> Result<(), StoreError>;
}
