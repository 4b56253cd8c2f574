//! Wake-up service: resolves due pending operations, reclaims leases, and
//! materializes cron runs.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use keel_durable::subtask_outcome;
use keel_protocols::{
    ConditionOutcome, OpKind, PendingOp, StoreError, TaskRun, WakeCondition,
};
use keel_store::RecordStore;

use crate::config::WorkerConfig;
use crate::error::WorkerError;

/// Background sweeper over time-driven state.
///
/// Each tick resolves pending operations whose wake condition is satisfied
/// (timers fired, awaited runs terminal, event deadlines passed), requeues
/// abandoned leases, expires schedule timeouts, and fires due cron entries.
pub struct WakeupService {
    store: Arc<dyn RecordStore>,
    config: WorkerConfig,
}

impl WakeupService {
    /// Create the service.
    pub fn new(store: Arc<dyn RecordStore>, config: WorkerConfig) -> Self {
        Self { store, config }
    }

    /// Run ticks until shutdown is signalled.
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<(), WorkerError> {
        info!("wake-up service starting");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("wake-up service shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.wakeup_interval()) => {
                    if let Err(e) = self.tick().await {
                        error!("wake-up tick failed: {}", e);
                    }
                }
            }
        }
    }

    /// One sweep over pending operations, leases, timeouts, and crons.
    pub async fn tick(&self) -> Result<(), WorkerError> {
        let now = Utc::now();

        for op in self.store.all_pending_ops().await? {
            match self.resolution_for(&op, now).await {
                Ok(Some(outcome)) => {
                    if self.store.resolve_pending_op(op.run_id, op.seq, outcome).await? {
                        debug!("resolved pending op ({}, {})", op.run_id, op.seq);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(
                    "could not evaluate pending op ({}, {}): {}",
                    op.run_id, op.seq, e
                ),
            }
        }

        let reclaimed = self.store.requeue_expired_leases().await?;
        if reclaimed > 0 {
            info!("requeued {} runs with expired leases", reclaimed);
        }
        let expired = self.store.expire_schedule_timeouts().await?;
        if expired > 0 {
            info!("expired {} runs past their schedule timeout", expired);
        }

        self.fire_due_crons(now).await?;
        Ok(())
    }

    /// Outcome for a pending operation whose wake condition is satisfied,
    /// or `None` when nothing is due yet.
    async fn resolution_for(
        &self,
        op: &PendingOp,
        now: DateTime<Utc>,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        for leaf in op.wake.leaves() {
            match leaf {
                WakeCondition::Timer { fire_at } if *fire_at <= now => {
                    let outcome = match op.signature.kind {
                        OpKind::Sleep => serde_json::json!({"fired": true}),
                        _ => serde_json::to_value(ConditionOutcome::slept())?,
                    };
                    return Ok(Some(outcome));
                }
                WakeCondition::Event {
                    name,
                    deadline: Some(deadline),
                } if *deadline <= now => {
                    // The event not arriving in budget is itself the outcome.
                    let outcome = ConditionOutcome::timed_out(format!("event:{name}"));
                    return Ok(Some(serde_json::to_value(outcome)?));
                }
                WakeCondition::ChildCompletion { child_run_id } => {
                    if let Some(child) = self.store.get_run(*child_run_id).await? {
                        if child.status.is_terminal() {
                            return Ok(Some(subtask_outcome(&child)));
                        }
                    }
                }
                WakeCondition::ParentCompletion {
                    parent_run_id,
                    deadline,
                } => {
                    if let Some(parent) = self.store.get_run(*parent_run_id).await? {
                        if parent.status.is_terminal() {
                            let outcome = ConditionOutcome::parent(parent.output.clone());
                            return Ok(Some(serde_json::to_value(outcome)?));
                        }
                    }
                    if deadline.is_some_and(|d| d <= now) {
                        let outcome = ConditionOutcome::timed_out("parent");
                        return Ok(Some(serde_json::to_value(outcome)?));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Materialize runs for cron entries whose fire time passed, then
    /// advance each entry to its next fire time.
    async fn fire_due_crons(&self, now: DateTime<Utc>) -> Result<(), WorkerError> {
        for entry in self.store.cron_entries().await? {
            if entry.next_fire_at > now {
                continue;
            }

            let spec = &entry.spec;
            let concurrency = spec.concurrency.as_ref().map(|p| p.resolve(&entry.input));
            let mut run = TaskRun::new(spec.name.clone(), spec.kind, entry.input.clone())
                .with_priority(spec.priority)
                .with_max_retries(spec.max_retries)
                .with_timeouts(spec.execution_timeout, spec.schedule_timeout);
            run.concurrency = concurrency;
            run.metadata.insert(
                "cron".to_string(),
                serde_json::json!(entry.name.clone()),
            );
            let run_id = self.store.enqueue(run).await?;
            info!("cron '{}' fired run {}", entry.name, run_id);

            // Expressions were validated at registration; a parse failure
            // here means the stored entry was edited out-of-band.
            match cron::Schedule::from_str(&entry.expression) {
                Ok(schedule) => {
                    if let Some(next) = schedule.after(&now).next() {
                        self.store.update_cron_next(&entry.name, next).await?;
                    }
                }
                Err(e) => warn!("cron '{}' has unparseable expression: {}", entry.name, e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_protocols::{
        OpSignature, Priority, RunError, RunStatus, SubtaskSpec, WorkflowKind,
    };
    use keel_store::{CronEntry, MemoryRecordStore};
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    fn service(store: &Arc<dyn RecordStore>) -> WakeupService {
        WakeupService::new(store.clone(), WorkerConfig::default())
    }

    async fn waiting_run(store: &Arc<dyn RecordStore>, wake: WakeCondition, kind: OpKind) -> Uuid {
        let run = TaskRun::new("agent", WorkflowKind::Agent, json!({}));
        let id = store.enqueue(run).await.unwrap();
        store.claim_next("w1", Duration::from_secs(30)).await.unwrap();
        store
            .add_pending_op(PendingOp::new(
                id,
                0,
                OpSignature::new(kind, "", json!({})),
                wake,
            ))
            .await
            .unwrap();
        store.suspend(id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_due_timer_wakes_sleeping_run() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let id = waiting_run(
            &store,
            WakeCondition::Timer {
                fire_at: Utc::now() - chrono::Duration::seconds(1),
            },
            OpKind::Sleep,
        )
        .await;

        service(&store).tick().await.unwrap();
        assert_eq!(
            store.get_run(id).await.unwrap().unwrap().status,
            RunStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_future_timer_stays_waiting() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let id = waiting_run(
            &store,
            WakeCondition::Timer {
                fire_at: Utc::now() + chrono::Duration::hours(1),
            },
            OpKind::Sleep,
        )
        .await;

        service(&store).tick().await.unwrap();
        assert_eq!(
            store.get_run(id).await.unwrap().unwrap().status,
            RunStatus::Waiting
        );
    }

    #[tokio::test]
    async fn test_child_completion_resolves_await() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let child = TaskRun::new("double", WorkflowKind::Tool, json!({}));
        let child_id = store.enqueue(child).await.unwrap();

        let parent_id = waiting_run(
            &store,
            WakeCondition::ChildCompletion {
                child_run_id: child_id,
            },
            OpKind::SubtaskResult,
        )
        .await;

        // Child still queued; nothing resolves.
        service(&store).tick().await.unwrap();
        assert_eq!(
            store.get_run(parent_id).await.unwrap().unwrap().status,
            RunStatus::Waiting
        );

        store.claim_next("w1", Duration::from_secs(30)).await.unwrap();
        store
            .finish(child_id, RunStatus::Succeeded, Some(json!(4)), None)
            .await
            .unwrap();
        service(&store).tick().await.unwrap();

        let parent = store.get_run(parent_id).await.unwrap().unwrap();
        assert_eq!(parent.status, RunStatus::Queued);
        let events = store.read_checkpoints(parent_id).await.unwrap();
        assert_eq!(events[0].outcome["output"], json!(4));
    }

    #[tokio::test]
    async fn test_event_deadline_resolves_as_timed_out() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let id = waiting_run(
            &store,
            WakeCondition::Event {
                name: "approval".into(),
                deadline: Some(Utc::now() - chrono::Duration::seconds(1)),
            },
            OpKind::WaitCondition,
        )
        .await;

        service(&store).tick().await.unwrap();

        let events = store.read_checkpoints(id).await.unwrap();
        let outcome: ConditionOutcome =
            serde_json::from_value(events[0].outcome.clone()).unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.branch, "event:approval");
    }

    #[tokio::test]
    async fn test_failed_child_resolves_with_error_payload() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let child = TaskRun::new("flaky", WorkflowKind::Tool, json!({}));
        let child_id = store.enqueue(child).await.unwrap();
        store.claim_next("w1", Duration::from_secs(30)).await.unwrap();
        store
            .finish(
                child_id,
                RunStatus::Failed,
                None,
                Some(RunError::handler("boom")),
            )
            .await
            .unwrap();

        let parent_id = waiting_run(
            &store,
            WakeCondition::ChildCompletion {
                child_run_id: child_id,
            },
            OpKind::SubtaskResult,
        )
        .await;
        service(&store).tick().await.unwrap();

        let events = store.read_checkpoints(parent_id).await.unwrap();
        assert_eq!(events[0].outcome["status"], json!("failed"));
    }

    #[tokio::test]
    async fn test_cron_fires_and_advances() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        store
            .add_cron(CronEntry {
                name: "sweeper".into(),
                expression: "0 * * * * *".into(),
                spec: SubtaskSpec {
                    name: "sweep".into(),
                    kind: WorkflowKind::Tool,
                    max_retries: 0,
                    priority: Priority::Low,
                    execution_timeout: Duration::from_secs(30),
                    schedule_timeout: Duration::from_secs(300),
                    concurrency: None,
                },
                input: json!({"shard": 1}),
                next_fire_at: Utc::now() - chrono::Duration::seconds(1),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        service(&store).tick().await.unwrap();

        // A run was materialized with the entry's spec and input.
        let run = store
            .claim_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(run.declaration, "sweep");
        assert_eq!(run.input, json!({"shard": 1}));
        assert_eq!(run.priority, Priority::Low);
        assert_eq!(run.metadata["cron"], json!("sweeper"));

        // And the entry advanced past now.
        let entries = store.cron_entries().await.unwrap();
        assert!(entries[0].next_fire_at > Utc::now());
    }
}
