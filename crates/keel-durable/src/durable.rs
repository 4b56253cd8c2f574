//! Durable replay context for agent handlers.
//!
//! Every delivery replays the handler from the top. Each durable operation
//! claims the next sequence position and consults the checkpoint history:
//!
//! 1. A recorded event with a matching signature returns its outcome.
//! 2. A recorded event with a different signature is a determinism
//!    violation; the run fails without retry.
//! 3. A pending operation at the position means the side effect was already
//!    issued; the run suspends again without re-issuing it.
//! 4. Otherwise the operation issues its side effect, registers a pending
//!    operation, and suspends.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use keel_protocols::{
    CheckpointEvent, Condition, ConditionOutcome, DurableError, Metadata, OpKind, OpSignature,
    PendingOp, RunError, RunStatus, StoreError, SubtaskSpec, TaskRun, WakeCondition,
};
use keel_store::RecordStore;

use crate::context::TaskContext;
use crate::handle::SubtaskHandle;

/// A nested call that completed with a terminal failure, as observed by the
/// parent. Accumulated so fan-out orchestrations can inspect all failures
/// after awaiting every branch.
#[derive(Debug, Clone)]
pub struct SubtaskFailure {
    /// Declaration name of the failed subtask.
    pub name: String,
    /// The child's terminal error.
    pub error: RunError,
}

/// Encode a terminal child run as the outcome payload of a
/// `SubtaskResult` checkpoint.
pub fn subtask_outcome(child: &TaskRun) -> serde_json::Value {
    json!({
        "status": child.status,
        "output": child.output,
        "error": child.error,
    })
}

/// Replay context handed to agent handlers.
pub struct DurableContext {
    task: TaskContext,
    events: HashMap<u32, CheckpointEvent>,
    pending: HashMap<u32, PendingOp>,
    cursor: AtomicU32,
    failures: Mutex<Vec<SubtaskFailure>>,
}

impl DurableContext {
    /// Load the context for one delivery attempt, preloading the run's
    /// checkpoint history and pending operations.
    pub async fn load(
        run: TaskRun,
        store: Arc<dyn RecordStore>,
        deadline: watch::Sender<DateTime<Utc>>,
    ) -> Result<Self, StoreError> {
        let id = run.id;
        let events = store
            .read_checkpoints(id)
            .await?
            .into_iter()
            .map(|e| (e.seq, e))
            .collect();
        let pending = store
            .pending_ops(id)
            .await?
            .into_iter()
            .map(|p| (p.seq, p))
            .collect();
        Ok(Self {
            task: TaskContext::new(run, store, deadline),
            events,
            pending,
            cursor: AtomicU32::new(0),
            failures: Mutex::new(Vec::new()),
        })
    }

    /// The plain context this wraps.
    pub fn task(&self) -> &TaskContext {
        &self.task
    }

    /// Run id.
    pub fn run_id(&self) -> Uuid {
        self.task.run_id()
    }

    /// Raw input payload.
    pub fn input(&self) -> &serde_json::Value {
        self.task.input()
    }

    /// Input deserialized into a concrete type.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        self.task.input_as()
    }

    /// Metadata attached at enqueue time.
    pub fn metadata(&self) -> &Metadata {
        self.task.metadata()
    }

    /// Retry attempts consumed so far.
    pub fn retry_count(&self) -> u32 {
        self.task.retry_count()
    }

    /// Cooperative cancellation check.
    pub async fn is_cancelled(&self) -> bool {
        self.task.is_cancelled().await
    }

    /// Subtask failures observed so far in this attempt.
    pub fn errors(&self) -> Vec<SubtaskFailure> {
        self.failures.lock().clone()
    }

    fn store(&self) -> &Arc<dyn RecordStore> {
        self.task.store()
    }

    fn next_seq(&self) -> u32 {
        self.cursor.fetch_add(1, Ordering::SeqCst)
    }

    /// Recorded outcome at `seq`, if any. A signature mismatch is a
    /// determinism violation.
    fn recorded(
        &self,
        seq: u32,
        signature: &OpSignature,
    ) -> Result<Option<serde_json::Value>, DurableError> {
        match self.events.get(&seq) {
            Some(event) if event.signature == *signature => Ok(Some(event.outcome.clone())),
            Some(event) => Err(DurableError::Determinism {
                seq,
                recorded: Box::new(event.signature.clone()),
                replayed: Box::new(signature.clone()),
            }),
            None => Ok(None),
        }
    }

    /// Suspend again if the operation at `seq` was already issued.
    fn check_pending(&self, seq: u32, signature: &OpSignature) -> Result<(), DurableError> {
        match self.pending.get(&seq) {
            Some(op) if op.signature == *signature => Err(DurableError::Suspended { seq }),
            Some(op) => Err(DurableError::Determinism {
                seq,
                recorded: Box::new(op.signature.clone()),
                replayed: Box::new(signature.clone()),
            }),
            None => Ok(()),
        }
    }

    /// Read back the authoritative event after losing a commit race.
    async fn recorded_after_race(
        &self,
        seq: u32,
        signature: &OpSignature,
    ) -> Result<serde_json::Value, DurableError> {
        let events = self.store().read_checkpoints(self.run_id()).await?;
        let event = events.into_iter().find(|e| e.seq == seq).ok_or_else(|| {
            StoreError::Custom(format!("checkpoint {seq} missing after commit race"))
        })?;
        if event.signature != *signature {
            return Err(DurableError::Determinism {
                seq,
                recorded: Box::new(event.signature),
                replayed: Box::new(signature.clone()),
            });
        }
        Ok(event.outcome)
    }

    /// Schedule a nested run without awaiting its result.
    ///
    /// The child id is committed to the checkpoint log before the child is
    /// enqueued; a duplicate delivery that loses the commit race reuses the
    /// recorded id and never enqueues a second child.
    pub async fn run_no_wait(
        &self,
        spec: &SubtaskSpec,
        input: serde_json::Value,
    ) -> Result<SubtaskHandle, DurableError> {
        let seq = self.next_seq();
        let signature = OpSignature::new(OpKind::SubtaskScheduled, &spec.name, input.clone());

        if let Some(outcome) = self.recorded(seq, &signature)? {
            let child_id: Uuid = serde_json::from_value(outcome).map_err(StoreError::from)?;
            return Ok(SubtaskHandle::new(&spec.name, child_id));
        }
        self.check_pending(seq, &signature)?;

        let child = spec.child_run(input, self.run_id());
        let child_id = child.id;
        let event = CheckpointEvent::new(seq, signature.clone(), json!(child_id));

        if self.store().append_checkpoint(self.run_id(), event).await? {
            self.store().enqueue(child).await?;
            debug!("scheduled subtask '{}' as {} (seq {})", spec.name, child_id, seq);
            Ok(SubtaskHandle::new(&spec.name, child_id))
        } else {
            let outcome = self.recorded_after_race(seq, &signature).await?;
            let child_id: Uuid = serde_json::from_value(outcome).map_err(StoreError::from)?;
            Ok(SubtaskHandle::new(&spec.name, child_id))
        }
    }

    /// Await a scheduled subtask's terminal result.
    pub async fn result_of(&self, handle: &SubtaskHandle) -> Result<serde_json::Value, DurableError> {
        let seq = self.next_seq();
        let signature = OpSignature::new(
            OpKind::SubtaskResult,
            handle.run_id.to_string(),
            serde_json::Value::Null,
        );

        if let Some(outcome) = self.recorded(seq, &signature)? {
            return self.parse_subtask_outcome(&handle.name, outcome);
        }
        self.check_pending(seq, &signature)?;

        // Fast path: the child already finished, so checkpoint its result
        // now and keep executing instead of bouncing through a suspend.
        if let Some(child) = self.store().get_run(handle.run_id).await? {
            if child.status.is_terminal() {
                let outcome = subtask_outcome(&child);
                let event = CheckpointEvent::new(seq, signature.clone(), outcome.clone());
                let outcome = if self.store().append_checkpoint(self.run_id(), event).await? {
                    outcome
                } else {
                    self.recorded_after_race(seq, &signature).await?
                };
                return self.parse_subtask_outcome(&handle.name, outcome);
            }
        }

        self.store()
            .add_pending_op(PendingOp::new(
                self.run_id(),
                seq,
                signature,
                WakeCondition::ChildCompletion {
                    child_run_id: handle.run_id,
                },
            ))
            .await?;
        debug!("awaiting subtask {} (seq {})", handle.run_id, seq);
        Err(DurableError::Suspended { seq })
    }

    /// Schedule a nested run and await its terminal result.
    pub async fn run(
        &self,
        spec: &SubtaskSpec,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        let handle = self.run_no_wait(spec, input).await?;
        self.result_of(&handle).await
    }

    /// Durable timer. Suspends the run until the timer fires; replay after
    /// the fact returns immediately.
    pub async fn sleep_for(&self, duration: Duration) -> Result<(), DurableError> {
        let seq = self.next_seq();
        let millis = duration.as_millis() as u64;
        let signature = OpSignature::new(OpKind::Sleep, "", json!(millis));

        if self.recorded(seq, &signature)?.is_some() {
            return Ok(());
        }
        self.check_pending(seq, &signature)?;

        let fire_at = Utc::now()
            + chrono::Duration::from_std(duration)
                .unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.store()
            .add_pending_op(PendingOp::new(
                self.run_id(),
                seq,
                signature,
                WakeCondition::Timer { fire_at },
            ))
            .await?;
        debug!("sleeping {}ms (seq {})", millis, seq);
        Err(DurableError::Suspended { seq })
    }

    /// Suspend until a condition resolves. Combined conditions resolve to
    /// the first satisfied branch; a branch that times out resolves
    /// successfully with a timed-out outcome.
    pub async fn wait_for(&self, condition: Condition) -> Result<ConditionOutcome, DurableError> {
        let seq = self.next_seq();
        let target = condition_target(&condition);
        let input = serde_json::to_value(&condition).map_err(StoreError::from)?;
        let signature = OpSignature::new(OpKind::WaitCondition, target, input);

        if let Some(outcome) = self.recorded(seq, &signature)? {
            return Ok(serde_json::from_value(outcome).map_err(StoreError::from)?);
        }
        self.check_pending(seq, &signature)?;

        let now = Utc::now();
        match self.wake_for(&condition, now) {
            Ok(wake) => {
                self.store()
                    .add_pending_op(PendingOp::new(self.run_id(), seq, signature, wake))
                    .await?;
                debug!("waiting on condition (seq {})", seq);
                Err(DurableError::Suspended { seq })
            }
            // A branch that can never fire later (parent completion on a
            // parentless run) resolves right away; commit and continue.
            Err(immediate) => {
                let outcome = serde_json::to_value(&immediate).map_err(StoreError::from)?;
                let event = CheckpointEvent::new(seq, signature.clone(), outcome);
                let outcome = if self.store().append_checkpoint(self.run_id(), event).await? {
                    immediate
                } else {
                    let raw = self.recorded_after_race(seq, &signature).await?;
                    serde_json::from_value(raw).map_err(StoreError::from)?
                };
                Ok(outcome)
            }
        }
    }

    fn parse_subtask_outcome(
        &self,
        name: &str,
        outcome: serde_json::Value,
    ) -> Result<serde_json::Value, DurableError> {
        let status: RunStatus =
            serde_json::from_value(outcome["status"].clone()).map_err(StoreError::from)?;
        match status {
            RunStatus::Succeeded => Ok(outcome["output"].clone()),
            _ => {
                let error: RunError = serde_json::from_value(outcome["error"].clone())
                    .unwrap_or_else(|_| RunError::handler("subtask failed without error detail"));
                self.failures.lock().push(SubtaskFailure {
                    name: name.to_string(),
                    error: error.clone(),
                });
                Err(DurableError::SubtaskFailed {
                    name: name.to_string(),
                    error,
                })
            }
        }
    }

    /// Convert a wait condition into its wake form, or into an immediate
    /// outcome when no branch can fire later.
    fn wake_for(
        &self,
        condition: &Condition,
        now: DateTime<Utc>,
    ) -> Result<WakeCondition, ConditionOutcome> {
        match condition {
            Condition::Sleep { duration } => Ok(WakeCondition::Timer {
                fire_at: now
                    + chrono::Duration::from_std(*duration)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0)),
            }),
            Condition::UserEvent { name, timeout } => Ok(WakeCondition::Event {
                name: name.clone(),
                deadline: timeout.map(|t| {
                    now + chrono::Duration::from_std(t)
                        .unwrap_or_else(|_| chrono::Duration::seconds(0))
                }),
            }),
            Condition::ParentCompletion { timeout } => {
                match self.task.run().parent_run {
                    Some(parent_run_id) => Ok(WakeCondition::ParentCompletion {
                        parent_run_id,
                        deadline: timeout.map(|t| {
                            now + chrono::Duration::from_std(t)
                                .unwrap_or_else(|_| chrono::Duration::seconds(0))
                        }),
                    }),
                    None => Err(ConditionOutcome::parent(None)),
                }
            }
            Condition::Or(branches) => {
                let mut wakes = Vec::with_capacity(branches.len());
                for branch in branches {
                    wakes.push(self.wake_for(branch, now)?);
                }
                Ok(WakeCondition::Any(wakes))
            }
        }
    }
}

fn condition_target(condition: &Condition) -> String {
    condition
        .branches()
        .iter()
        .map(|b| match b {
            Condition::Sleep { .. } => "sleep".to_string(),
            Condition::UserEvent { name, .. } => format!("event:{name}"),
            Condition::ParentCompletion { .. } => "parent".to_string(),
            Condition::Or(_) => String::new(),
        })
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_protocols::{Priority, WorkflowKind};
    use keel_store::MemoryRecordStore;
    use serde_json::json;

    fn spec(name: &str) -> SubtaskSpec {
        SubtaskSpec {
            name: name.into(),
            kind: WorkflowKind::Tool,
            max_retries: 0,
            priority: Priority::Normal,
            execution_timeout: Duration::from_secs(60),
            schedule_timeout: Duration::from_secs(300),
            concurrency: None,
        }
    }

    async fn setup() -> (Arc<dyn RecordStore>, TaskRun) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let run = TaskRun::new("orchestrator", WorkflowKind::Agent, json!({"n": 1}));
        store.enqueue(run.clone()).await.unwrap();
        (store, run)
    }

    async fn ctx(store: &Arc<dyn RecordStore>, run: &TaskRun) -> DurableContext {
        let (tx, _rx) = watch::channel(Utc::now());
        DurableContext::load(run.clone(), store.clone(), tx)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_no_wait_enqueues_child_exactly_once() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        let handle = first.run_no_wait(&spec("double"), json!({"n": 2})).await.unwrap();
        assert_eq!(store.list_children(run.id).await.unwrap().len(), 1);

        // Replay on a fresh delivery reuses the recorded child id.
        let second = ctx(&store, &run).await;
        let replayed = second
            .run_no_wait(&spec("double"), json!({"n": 2}))
            .await
            .unwrap();
        assert_eq!(replayed.run_id, handle.run_id);
        assert_eq!(store.list_children(run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_with_different_input_is_determinism_violation() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        first.run_no_wait(&spec("double"), json!({"n": 2})).await.unwrap();

        let second = ctx(&store, &run).await;
        let err = second
            .run_no_wait(&spec("double"), json!({"n": 3}))
            .await
            .unwrap_err();
        assert!(matches!(err, DurableError::Determinism { seq: 0, .. }));
    }

    #[tokio::test]
    async fn test_sleep_suspends_once_then_replays() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        let err = first.sleep_for(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, DurableError::Suspended { seq: 0 }));
        assert_eq!(store.pending_ops(run.id).await.unwrap().len(), 1);

        // Re-delivery before the timer fires suspends again without a
        // second pending operation.
        let second = ctx(&store, &run).await;
        let err = second.sleep_for(Duration::from_millis(50)).await.unwrap_err();
        assert!(err.is_suspend());
        assert_eq!(store.pending_ops(run.id).await.unwrap().len(), 1);

        store
            .resolve_pending_op(run.id, 0, json!({}))
            .await
            .unwrap();
        let third = ctx(&store, &run).await;
        third.sleep_for(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn test_result_of_fast_path_when_child_already_finished() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        let handle = first.run_no_wait(&spec("double"), json!({"n": 2})).await.unwrap();
        store
            .finish(handle.run_id, RunStatus::Succeeded, Some(json!(4)), None)
            .await
            .unwrap();

        let result = first.result_of(&handle).await.unwrap();
        assert_eq!(result, json!(4));

        // The fast path committed a checkpoint, so replay sees it too.
        let second = ctx(&store, &run).await;
        let handle = second.run_no_wait(&spec("double"), json!({"n": 2})).await.unwrap();
        assert_eq!(second.result_of(&handle).await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_result_of_suspends_while_child_runs() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        let handle = first.run_no_wait(&spec("double"), json!({"n": 2})).await.unwrap();
        let err = first.result_of(&handle).await.unwrap_err();
        assert!(matches!(err, DurableError::Suspended { seq: 1 }));

        let pending = store.pending_ops(run.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(
            pending[0].wake,
            WakeCondition::ChildCompletion {
                child_run_id: handle.run_id
            }
        );

        // Child finishes; its result resolves the pending operation.
        let child = {
            let mut c = store.get_run(handle.run_id).await.unwrap().unwrap();
            c.status = RunStatus::Succeeded;
            c.output = Some(json!(4));
            c
        };
        store
            .finish(handle.run_id, RunStatus::Succeeded, Some(json!(4)), None)
            .await
            .unwrap();
        store
            .resolve_pending_op(run.id, 1, subtask_outcome(&child))
            .await
            .unwrap();

        let second = ctx(&store, &run).await;
        let handle = second.run_no_wait(&spec("double"), json!({"n": 2})).await.unwrap();
        assert_eq!(second.result_of(&handle).await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_failed_subtask_propagates_and_is_recorded() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        let handle = first.run_no_wait(&spec("flaky"), json!({})).await.unwrap();
        store
            .finish(
                handle.run_id,
                RunStatus::Failed,
                None,
                Some(RunError::handler("boom")),
            )
            .await
            .unwrap();

        let err = first.result_of(&handle).await.unwrap_err();
        match err {
            DurableError::SubtaskFailed { name, error } => {
                assert_eq!(name, "flaky");
                assert_eq!(error.message, "boom");
            }
            other => panic!("expected SubtaskFailed, got {other:?}"),
        }

        let failures = first.errors();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].name, "flaky");
    }

    #[tokio::test]
    async fn test_wait_for_event_resolves_on_publish() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        let err = first
            .wait_for(Condition::user_event("approved"))
            .await
            .unwrap_err();
        assert!(err.is_suspend());

        let woken = store
            .publish_event("approved", json!({"by": "ops"}))
            .await
            .unwrap();
        assert_eq!(woken, 1);

        let second = ctx(&store, &run).await;
        let outcome = second
            .wait_for(Condition::user_event("approved"))
            .await
            .unwrap();
        assert_eq!(outcome.branch, "event:approved");
        assert_eq!(outcome.payload, Some(json!({"by": "ops"})));
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_wait_for_parent_without_parent_resolves_immediately() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        let outcome = first
            .wait_for(Condition::parent_completion(None))
            .await
            .unwrap();
        assert_eq!(outcome.branch, "parent");

        // The immediate resolution was checkpointed.
        assert_eq!(store.read_checkpoints(run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_or_condition_registers_all_branches() {
        let (store, run) = setup().await;

        let first = ctx(&store, &run).await;
        let cond = Condition::sleep(Duration::from_secs(60)).or(Condition::user_event("stop"));
        let err = first.wait_for(cond).await.unwrap_err();
        assert!(err.is_suspend());

        let pending = store.pending_ops(run.id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].wake.leaves().len(), 2);
    }
}
