//! In-memory record store.
//!
//! Reference implementation of the broker contract, used for embedded
//! execution and tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use keel_protocols::{
    CheckpointEvent, ConcurrencyStrategy, ConditionOutcome, PendingOp, RunError, RunStatus,
    StoreError, TaskRun, WakeCondition,
};

use crate::store::{CronEntry, RecordStore};

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, TaskRun>,
    checkpoints: HashMap<Uuid, BTreeMap<u32, CheckpointEvent>>,
    pending: HashMap<Uuid, BTreeMap<u32, PendingOp>>,
    crons: HashMap<String, CronEntry>,
}

impl Inner {
    fn running_group_count(&self, declaration: &str, key: &str) -> u32 {
        self.runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Running
                    && r.declaration == declaration
                    && r.concurrency.as_ref().is_some_and(|c| c.key == key)
            })
            .count() as u32
    }

    fn oldest_running_in_group(&self, declaration: &str, key: &str) -> Option<Uuid> {
        self.runs
            .values()
            .filter(|r| {
                r.status == RunStatus::Running
                    && r.declaration == declaration
                    && r.concurrency.as_ref().is_some_and(|c| c.key == key)
            })
            .min_by_key(|r| r.started_at.unwrap_or(r.created_at))
            .map(|r| r.id)
    }

    fn cancel_recursive(&mut self, id: Uuid) {
        let children: Vec<Uuid> = self
            .runs
            .values()
            .filter(|r| r.parent_run == Some(id))
            .map(|r| r.id)
            .collect();

        if let Some(run) = self.runs.get_mut(&id) {
            if !run.status.is_terminal() {
                run.status = RunStatus::Cancelled;
                run.error = Some(RunError::cancelled());
                run.lease_expires_at = None;
                run.worker_id = None;
                run.updated_at = Utc::now();
                self.pending.remove(&id);
            }
        }

        for child in children {
            self.cancel_recursive(child);
        }
    }

    /// Resolve one pending operation into a checkpoint event and wake the
    /// owning run. First-writer-wins on the checkpoint position.
    fn resolve(&mut self, run_id: Uuid, seq: u32, outcome: serde_json::Value) -> bool {
        let Some(op) = self
            .pending
            .get_mut(&run_id)
            .and_then(|ops| ops.remove(&seq))
        else {
            return false;
        };

        let events = self.checkpoints.entry(run_id).or_default();
        events
            .entry(seq)
            .or_insert_with(|| CheckpointEvent::new(seq, op.signature, outcome));

        if let Some(run) = self.runs.get_mut(&run_id) {
            match run.status {
                RunStatus::Waiting => {
                    run.status = RunStatus::Queued;
                    run.scheduled_at = None;
                    run.wake_pending = false;
                    run.updated_at = Utc::now();
                }
                RunStatus::Running => {
                    // Attempt still executing; suspend will requeue instead.
                    run.wake_pending = true;
                }
                _ => {}
            }
        }
        true
    }
}

/// In-memory record store.
pub struct MemoryRecordStore {
    inner: RwLock<Inner>,
}

impl MemoryRecordStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn enqueue(&self, run: TaskRun) -> Result<Uuid, StoreError> {
        let mut inner = self.inner.write().await;
        let id = run.id;
        debug!("enqueue run {} ({})", id, run.declaration);
        inner.runs.entry(id).or_insert(run);
        Ok(id)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<TaskRun>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.runs.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<TaskRun>, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;

        let mut candidates: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|r| r.is_ready(now))
            .map(|r| r.id)
            .collect();
        candidates.sort_by(|a, b| {
            let ra = &inner.runs[a];
            let rb = &inner.runs[b];
            rb.priority
                .cmp(&ra.priority)
                .then_with(|| ra.created_at.cmp(&rb.created_at))
        });

        for id in candidates {
            let (declaration, concurrency) = {
                let run = &inner.runs[&id];
                (run.declaration.clone(), run.concurrency.clone())
            };

            if let Some(c) = concurrency {
                let mut count = inner.running_group_count(&declaration, &c.key);
                if count >= c.max_runs {
                    match c.strategy {
                        ConcurrencyStrategy::Queue => continue,
                        ConcurrencyStrategy::CancelInProgress => {
                            while count >= c.max_runs {
                                let Some(victim) =
                                    inner.oldest_running_in_group(&declaration, &c.key)
                                else {
                                    break;
                                };
                                debug!(
                                    "cancel-in-progress: cancelling {} to admit {}",
                                    victim, id
                                );
                                inner.cancel_recursive(victim);
                                count = inner.running_group_count(&declaration, &c.key);
                            }
                            if count >= c.max_runs {
                                continue;
                            }
                        }
                    }
                }
            }

            let Some(run) = inner.runs.get_mut(&id) else {
                continue;
            };
            run.status = RunStatus::Running;
            run.worker_id = Some(worker_id.to_string());
            run.lease_expires_at = Some(
                now + chrono::Duration::from_std(lease)
                    .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            );
            run.started_at.get_or_insert(now);
            run.updated_at = now;
            debug!("claimed run {} for worker {}", id, worker_id);
            return Ok(Some(run.clone()));
        }

        Ok(None)
    }

    async fn suspend(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        if run.status != RunStatus::Running {
            return Ok(());
        }
        if run.wake_pending {
            // Something resolved mid-attempt; go straight back to the queue.
            run.status = RunStatus::Queued;
            run.scheduled_at = None;
            run.wake_pending = false;
        } else {
            run.status = RunStatus::Waiting;
        }
        run.lease_expires_at = None;
        run.worker_id = None;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<RunError>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        if run.status.is_terminal() {
            return Ok(false);
        }
        run.status = status;
        run.output = output;
        run.error = error;
        run.lease_expires_at = None;
        run.worker_id = None;
        run.updated_at = Utc::now();
        inner.pending.remove(&id);
        Ok(true)
    }

    async fn requeue_for_retry(
        &self,
        id: Uuid,
        error: RunError,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        run.retry_count += 1;
        run.status = RunStatus::Queued;
        run.scheduled_at = Some(
            Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(5)),
        );
        run.lease_expires_at = None;
        run.worker_id = None;
        run.metadata
            .insert("last_error".to_string(), serde_json::json!(error.to_string()));
        run.updated_at = Utc::now();
        debug!("requeued run {} for retry {}", id, run.retry_count);
        Ok(())
    }

    async fn cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.runs.contains_key(&id) {
            return Err(StoreError::RunNotFound(id));
        }
        inner.cancel_recursive(id);
        Ok(())
    }

    async fn refresh_timeout(&self, id: Uuid, extension: Duration) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let run = inner.runs.get_mut(&id).ok_or(StoreError::RunNotFound(id))?;
        if run.status == RunStatus::Running {
            run.lease_expires_at = Some(
                Utc::now()
                    + chrono::Duration::from_std(extension)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            );
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn requeue_expired_leases(&self) -> Result<u32, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for run in inner.runs.values_mut() {
            if run.status == RunStatus::Running
                && run.lease_expires_at.is_some_and(|t| t < now)
            {
                run.status = RunStatus::Queued;
                run.lease_expires_at = None;
                run.worker_id = None;
                run.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn expire_schedule_timeouts(&self) -> Result<u32, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let mut count = 0;
        for run in inner.runs.values_mut() {
            if run.status == RunStatus::Queued
                && run.started_at.is_none()
                && run.schedule_deadline() < now
            {
                run.status = RunStatus::Failed;
                run.error = Some(RunError::timeout("schedule timeout exceeded before start"));
                run.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_children(&self, parent: Uuid) -> Result<Vec<TaskRun>, StoreError> {
        let inner = self.inner.read().await;
        let mut children: Vec<TaskRun> = inner
            .runs
            .values()
            .filter(|r| r.parent_run == Some(parent))
            .cloned()
            .collect();
        children.sort_by_key(|r| r.created_at);
        Ok(children)
    }

    async fn append_checkpoint(
        &self,
        run_id: Uuid,
        event: CheckpointEvent,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let events = inner.checkpoints.entry(run_id).or_default();
        if events.contains_key(&event.seq) {
            return Ok(false);
        }
        events.insert(event.seq, event);
        Ok(true)
    }

    async fn read_checkpoints(&self, run_id: Uuid) -> Result<Vec<CheckpointEvent>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .checkpoints
            .get(&run_id)
            .map(|events| events.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_pending_op(&self, op: PendingOp) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.pending.entry(op.run_id).or_default().insert(op.seq, op);
        Ok(())
    }

    async fn pending_ops(&self, run_id: Uuid) -> Result<Vec<PendingOp>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .pending
            .get(&run_id)
            .map(|ops| ops.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn all_pending_ops(&self) -> Result<Vec<PendingOp>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .pending
            .values()
            .flat_map(|ops| ops.values().cloned())
            .collect())
    }

    async fn resolve_pending_op(
        &self,
        run_id: Uuid,
        seq: u32,
        outcome: serde_json::Value,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.resolve(run_id, seq, outcome))
    }

    async fn publish_event(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().await;

        let matches: Vec<(Uuid, u32)> = inner
            .pending
            .values()
            .flat_map(|ops| ops.values())
            .filter(|op| {
                op.wake.leaves().iter().any(
                    |leaf| matches!(leaf, WakeCondition::Event { name: n, .. } if n == name),
                )
            })
            .map(|op| (op.run_id, op.seq))
            .collect();

        let outcome = serde_json::to_value(ConditionOutcome::event(name, payload))?;
        let mut woken = 0;
        for (run_id, seq) in matches {
            if inner.resolve(run_id, seq, outcome.clone()) {
                woken += 1;
            }
        }
        debug!("published event '{}', woke {} runs", name, woken);
        Ok(woken)
    }

    async fn add_cron(&self, entry: CronEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.crons.insert(entry.name.clone(), entry);
        Ok(())
    }

    async fn cron_entries(&self) -> Result<Vec<CronEntry>, StoreError> {
        let inner = self.inner.read().await;
        let mut entries: Vec<CronEntry> = inner.crons.values().cloned().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn update_cron_next(&self, name: &str, next: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let entry = inner
            .crons
            .get_mut(name)
            .ok_or_else(|| StoreError::Custom(format!("unknown cron schedule '{name}'")))?;
        entry.next_fire_at = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_protocols::{
        ConcurrencyStrategy, OpKind, OpSignature, Priority, RunConcurrency, WorkflowKind,
    };
    use serde_json::json;

    fn run(name: &str) -> TaskRun {
        TaskRun::new(name, WorkflowKind::Tool, json!({}))
    }

    #[tokio::test]
    async fn test_claim_respects_priority_then_age() {
        let store = MemoryRecordStore::new();
        store
            .enqueue(run("low").with_priority(Priority::Low))
            .await
            .unwrap();
        store
            .enqueue(run("high").with_priority(Priority::High))
            .await
            .unwrap();
        store.enqueue(run("normal")).await.unwrap();

        let first = store
            .claim_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.declaration, "high");

        let second = store
            .claim_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.declaration, "normal");
    }

    #[tokio::test]
    async fn test_claim_skips_future_scheduled_runs() {
        let store = MemoryRecordStore::new();
        store
            .enqueue(run("later").with_scheduled_at(Utc::now() + chrono::Duration::hours(1)))
            .await
            .unwrap();
        assert!(store
            .claim_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_append_checkpoint_first_writer_wins() {
        let store = MemoryRecordStore::new();
        let id = Uuid::new_v4();
        let sig = OpSignature::new(OpKind::SubtaskScheduled, "double", json!({"n": 5}));

        let first = CheckpointEvent::new(0, sig.clone(), json!("winner"));
        let second = CheckpointEvent::new(0, sig, json!("loser"));

        assert!(store.append_checkpoint(id, first).await.unwrap());
        assert!(!store.append_checkpoint(id, second).await.unwrap());

        let events = store.read_checkpoints(id).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, json!("winner"));
    }

    #[tokio::test]
    async fn test_resolve_wakes_waiting_run() {
        let store = MemoryRecordStore::new();
        let id = store.enqueue(run("agent")).await.unwrap();
        store.claim_next("w1", Duration::from_secs(30)).await.unwrap();

        let sig = OpSignature::new(OpKind::Sleep, "", json!(1000));
        store
            .add_pending_op(PendingOp::new(
                id,
                0,
                sig,
                WakeCondition::Timer { fire_at: Utc::now() },
            ))
            .await
            .unwrap();
        store.suspend(id).await.unwrap();
        assert_eq!(
            store.get_run(id).await.unwrap().unwrap().status,
            RunStatus::Waiting
        );

        assert!(store.resolve_pending_op(id, 0, json!({})).await.unwrap());
        let woken = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(woken.status, RunStatus::Queued);
        assert_eq!(store.read_checkpoints(id).await.unwrap().len(), 1);
        assert!(store.pending_ops(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_during_attempt_requeues_on_suspend() {
        let store = MemoryRecordStore::new();
        let id = store.enqueue(run("agent")).await.unwrap();
        store.claim_next("w1", Duration::from_secs(30)).await.unwrap();

        let sig = OpSignature::new(OpKind::Sleep, "", json!(10));
        store
            .add_pending_op(PendingOp::new(
                id,
                0,
                sig,
                WakeCondition::Timer { fire_at: Utc::now() },
            ))
            .await
            .unwrap();

        // Resolution lands while the attempt is still running.
        assert!(store.resolve_pending_op(id, 0, json!({})).await.unwrap());
        assert_eq!(
            store.get_run(id).await.unwrap().unwrap().status,
            RunStatus::Running
        );

        store.suspend(id).await.unwrap();
        assert_eq!(
            store.get_run(id).await.unwrap().unwrap().status,
            RunStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_publish_event_resolves_subscription() {
        let store = MemoryRecordStore::new();
        let id = store.enqueue(run("agent")).await.unwrap();
        store.claim_next("w1", Duration::from_secs(30)).await.unwrap();

        let sig = OpSignature::new(OpKind::WaitCondition, "event:x", json!({}));
        store
            .add_pending_op(PendingOp::new(
                id,
                0,
                sig,
                WakeCondition::Event {
                    name: "x".into(),
                    deadline: None,
                },
            ))
            .await
            .unwrap();
        store.suspend(id).await.unwrap();

        let woken = store.publish_event("x", json!({"v": 1})).await.unwrap();
        assert_eq!(woken, 1);

        let events = store.read_checkpoints(id).await.unwrap();
        let outcome: ConditionOutcome = serde_json::from_value(events[0].outcome.clone()).unwrap();
        assert_eq!(outcome.branch, "event:x");
        assert_eq!(outcome.payload, Some(json!({"v": 1})));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_concurrency_bound_queue_strategy() {
        let store = MemoryRecordStore::new();
        let conc = RunConcurrency {
            key: "g1".into(),
            max_runs: 1,
            strategy: ConcurrencyStrategy::Queue,
        };
        store
            .enqueue(run("tool").with_concurrency(conc.clone()))
            .await
            .unwrap();
        store
            .enqueue(run("tool").with_concurrency(conc))
            .await
            .unwrap();

        let first = store.claim_next("w1", Duration::from_secs(30)).await.unwrap();
        assert!(first.is_some());

        // Second member of the group stays queued while the first runs.
        let second = store.claim_next("w2", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_none());

        store
            .finish(first.unwrap().id, RunStatus::Succeeded, Some(json!({})), None)
            .await
            .unwrap();
        let now_claimable = store.claim_next("w2", Duration::from_secs(30)).await.unwrap();
        assert!(now_claimable.is_some());
    }

    #[tokio::test]
    async fn test_concurrency_cancel_in_progress() {
        let store = MemoryRecordStore::new();
        let conc = RunConcurrency {
            key: "g1".into(),
            max_runs: 1,
            strategy: ConcurrencyStrategy::CancelInProgress,
        };
        let first_id = store
            .enqueue(run("tool").with_concurrency(conc.clone()))
            .await
            .unwrap();
        store
            .enqueue(run("tool").with_concurrency(conc))
            .await
            .unwrap();

        store.claim_next("w1", Duration::from_secs(30)).await.unwrap();
        let second = store.claim_next("w2", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_some());

        let first = store.get_run(first_id).await.unwrap().unwrap();
        assert_eq!(first.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_children() {
        let store = MemoryRecordStore::new();
        let parent_id = store.enqueue(run("parent")).await.unwrap();
        let child = run("child").with_parent(parent_id);
        let child_id = store.enqueue(child).await.unwrap();

        store.cancel(parent_id).await.unwrap();

        assert_eq!(
            store.get_run(parent_id).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
        assert_eq!(
            store.get_run(child_id).await.unwrap().unwrap().status,
            RunStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_finish_absorbs_duplicate_completion() {
        let store = MemoryRecordStore::new();
        let id = store.enqueue(run("tool")).await.unwrap();
        store.claim_next("w1", Duration::from_secs(30)).await.unwrap();

        assert!(store
            .finish(id, RunStatus::Succeeded, Some(json!(1)), None)
            .await
            .unwrap());
        assert!(!store
            .finish(id, RunStatus::Failed, None, Some(RunError::handler("late")))
            .await
            .unwrap());

        let final_run = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(final_run.status, RunStatus::Succeeded);
        assert_eq!(final_run.output, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_expired_lease_requeues() {
        let store = MemoryRecordStore::new();
        let id = store.enqueue(run("tool")).await.unwrap();
        store
            .claim_next("w1", Duration::from_millis(0))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let requeued = store.requeue_expired_leases().await.unwrap();
        assert_eq!(requeued, 1);
        assert_eq!(
            store.get_run(id).await.unwrap().unwrap().status,
            RunStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_schedule_timeout_expiry() {
        let store = MemoryRecordStore::new();
        let mut never_started = run("tool");
        never_started.schedule_timeout = Duration::from_millis(0);
        let id = store.enqueue(never_started).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let expired = store.expire_schedule_timeouts().await.unwrap();
        assert_eq!(expired, 1);

        let failed = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(failed.status, RunStatus::Failed);
        assert_eq!(failed.error.unwrap().kind, keel_protocols::ErrorKind::Timeout);
    }
}
