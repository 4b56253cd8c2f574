//! Delivery dispatch: one claimed run in, one outcome out.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use keel_core::{HandlerRef, Registry, WorkflowDeclaration};
use keel_durable::{DurableContext, TaskContext};
use keel_protocols::{DurableError, HandlerError, RunError, RunStatus, TaskRun};
use keel_store::RecordStore;

use crate::error::WorkerError;

/// What one delivery attempt produced.
#[derive(Debug)]
pub enum Outcome {
    /// Handler returned a schema-valid output; run succeeded.
    Success(serde_json::Value),
    /// Handler failed with retry budget remaining; run requeued.
    RetryableFailure(RunError),
    /// Run reached a terminal failure (validation, determinism, exhausted
    /// retries, or cancellation).
    FatalFailure(RunError),
    /// Agent suspended on a pending durable operation.
    Suspended,
    /// Re-delivery of an already-terminal run; absorbed without execution.
    DuplicateDelivery,
}

/// Executes claimed runs against their registered handlers.
pub struct Dispatcher {
    store: Arc<dyn RecordStore>,
    registry: Arc<Registry>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(store: Arc<dyn RecordStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    /// Execute one delivery attempt and record its outcome in the store.
    pub async fn dispatch(&self, run: TaskRun) -> Result<Outcome, WorkerError> {
        // At-least-once delivery: a run that finished on another attempt may
        // still be handed to us. Recognize it by status and absorb.
        let Some(current) = self.store.get_run(run.id).await? else {
            warn!("claimed run {} vanished from the store", run.id);
            return Ok(Outcome::DuplicateDelivery);
        };
        if current.status.is_terminal() {
            debug!("absorbing duplicate delivery of terminal run {}", run.id);
            return Ok(Outcome::DuplicateDelivery);
        }

        let Some(decl) = self.registry.get(&current.declaration) else {
            let error = RunError::validation(format!(
                "no declaration registered for '{}'",
                current.declaration
            ));
            self.store
                .finish(run.id, RunStatus::Failed, None, Some(error.clone()))
                .await?;
            return Ok(Outcome::FatalFailure(error));
        };

        // Input violations are never executed and never retried.
        if let Err(error) = decl.validate_input(&current.input) {
            self.store
                .finish(run.id, RunStatus::Failed, None, Some(error.clone()))
                .await?;
            return Ok(Outcome::FatalFailure(error));
        }

        let deadline = Utc::now()
            + chrono::Duration::from_std(decl.execution_timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let (deadline_tx, deadline_rx) = watch::channel(deadline);

        let raw = match decl.handler() {
            HandlerRef::Tool(handler) => {
                let ctx = Arc::new(TaskContext::new(
                    current.clone(),
                    self.store.clone(),
                    deadline_tx,
                ));
                self.classify_tool(with_deadline(handler.call(ctx), deadline_rx).await)
            }
            HandlerRef::Agent(handler) => {
                let ctx = Arc::new(
                    DurableContext::load(current.clone(), self.store.clone(), deadline_tx)
                        .await?,
                );
                self.classify_agent(with_deadline(handler.call(ctx), deadline_rx).await)
            }
        };

        self.settle(&current, &decl, raw).await
    }

    /// Map a tool handler result to a raw outcome.
    fn classify_tool(
        &self,
        result: Result<Result<serde_json::Value, HandlerError>, RunError>,
    ) -> RawOutcome {
        match result {
            Ok(Ok(output)) => RawOutcome::Output(output),
            Ok(Err(HandlerError::Cancelled)) => RawOutcome::Cancelled,
            Ok(Err(e)) => RawOutcome::Failed(RunError::handler(e.to_string())),
            Err(timeout) => RawOutcome::Failed(timeout),
        }
    }

    /// Map an agent handler result to a raw outcome.
    fn classify_agent(
        &self,
        result: Result<Result<serde_json::Value, DurableError>, RunError>,
    ) -> RawOutcome {
        match result {
            Ok(Ok(output)) => RawOutcome::Output(output),
            Ok(Err(e)) if e.is_suspend() => RawOutcome::Suspend,
            // Replay is deterministic: a determinism violation or a
            // terminally failed child would recur on every retry.
            Ok(Err(e @ DurableError::Determinism { .. })) => {
                RawOutcome::Fatal(RunError::determinism(e.to_string()))
            }
            Ok(Err(e @ DurableError::SubtaskFailed { .. })) => {
                RawOutcome::Fatal(RunError::handler(e.to_string()))
            }
            Ok(Err(DurableError::Handler(HandlerError::Cancelled))) => RawOutcome::Cancelled,
            Ok(Err(e)) => RawOutcome::Failed(RunError::handler(e.to_string())),
            Err(timeout) => RawOutcome::Failed(timeout),
        }
    }

    /// Record the outcome in the store, consuming retry budget as needed.
    async fn settle(
        &self,
        run: &TaskRun,
        decl: &WorkflowDeclaration,
        raw: RawOutcome,
    ) -> Result<Outcome, WorkerError> {
        match raw {
            RawOutcome::Output(output) => {
                if let Err(error) = decl.validate_output(&output) {
                    // An output the declaration promised and did not deliver
                    // is a bug, not a transient fault.
                    self.store
                        .finish(run.id, RunStatus::Failed, None, Some(error.clone()))
                        .await?;
                    return Ok(Outcome::FatalFailure(error));
                }
                let first = self
                    .store
                    .finish(run.id, RunStatus::Succeeded, Some(output.clone()), None)
                    .await?;
                if !first {
                    return Ok(Outcome::DuplicateDelivery);
                }
                debug!("run {} succeeded", run.id);
                Ok(Outcome::Success(output))
            }
            RawOutcome::Suspend => {
                self.store.suspend(run.id).await?;
                debug!("run {} suspended", run.id);
                Ok(Outcome::Suspended)
            }
            RawOutcome::Cancelled => {
                let error = RunError::cancelled();
                self.store
                    .finish(run.id, RunStatus::Cancelled, None, Some(error.clone()))
                    .await?;
                Ok(Outcome::FatalFailure(error))
            }
            RawOutcome::Fatal(error) => {
                self.store
                    .finish(run.id, RunStatus::Failed, None, Some(error.clone()))
                    .await?;
                Ok(Outcome::FatalFailure(error))
            }
            RawOutcome::Failed(error) => {
                if error.is_retryable() && run.can_retry() {
                    let delay = decl.retry_delay(run.retry_count);
                    self.store
                        .requeue_for_retry(run.id, error.clone(), delay)
                        .await?;
                    debug!(
                        "run {} failed, retry {}/{} in {:?}",
                        run.id,
                        run.retry_count + 1,
                        run.max_retries,
                        delay
                    );
                    Ok(Outcome::RetryableFailure(error))
                } else {
                    self.store
                        .finish(run.id, RunStatus::Failed, None, Some(error.clone()))
                        .await?;
                    Ok(Outcome::FatalFailure(error))
                }
            }
        }
    }
}

enum RawOutcome {
    Output(serde_json::Value),
    Suspend,
    Cancelled,
    Fatal(RunError),
    Failed(RunError),
}

/// Drive a handler future under a re-armable deadline.
///
/// The deadline moves when the handler calls `ctx.refresh_timeout`; passing
/// it resolves to a timeout error, which is retryable.
async fn with_deadline<T>(
    fut: impl Future<Output = T>,
    mut rx: watch::Receiver<DateTime<Utc>>,
) -> Result<T, RunError> {
    tokio::pin!(fut);
    loop {
        let deadline = *rx.borrow_and_update();
        let remaining = (deadline - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        tokio::select! {
            out = &mut fut => return Ok(out),
            _ = tokio::time::sleep(remaining) => {
                if *rx.borrow() <= Utc::now() {
                    return Err(RunError::timeout("execution timeout exceeded"));
                }
                // Deadline was re-armed mid-attempt; keep driving.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::declare;
    use keel_protocols::ErrorKind;
    use keel_protocols::{Condition, EnqueueOptions, WorkflowKind};
    use keel_store::MemoryRecordStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry(decls: Vec<WorkflowDeclaration>) -> Arc<Registry> {
        let mut registry = Registry::new();
        for d in decls {
            registry.register(d).unwrap();
        }
        Arc::new(registry)
    }

    async fn claim(store: &Arc<dyn RecordStore>) -> TaskRun {
        store
            .claim_next("w1", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("a queued run")
    }

    fn double_decl() -> WorkflowDeclaration {
        declare(WorkflowKind::Tool, "double")
            .input_schema(json!({
                "type": "object",
                "properties": {"n": {"type": "integer"}},
                "required": ["n"]
            }))
            .output_schema(json!({"type": "integer"}))
            .tool(|ctx| async move {
                let n = ctx.input()["n"].as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_tool_success_finishes_run() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let dispatcher = Dispatcher::new(store.clone(), registry(vec![double_decl()]));

        let decl = double_decl();
        store
            .enqueue(decl.new_run(json!({"n": 21}), &EnqueueOptions::default()))
            .await
            .unwrap();
        let run = claim(&store).await;

        let outcome = dispatcher.dispatch(run.clone()).await.unwrap();
        assert!(matches!(outcome, Outcome::Success(v) if v == json!(42)));

        let finished = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.output, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_invalid_input_never_executes() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_handler = calls.clone();
        let decl = declare(WorkflowKind::Tool, "strict")
            .input_schema(json!({
                "type": "object",
                "properties": {"n": {"type": "integer"}},
                "required": ["n"]
            }))
            .tool(move |_ctx| {
                let calls = calls_in_handler.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            })
            .build()
            .unwrap();

        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let dispatcher = Dispatcher::new(store.clone(), registry(vec![decl]));

        // Enqueue bypassing client-side validation, as a remote producer
        // with a stale schema would.
        let mut bad = TaskRun::new("strict", WorkflowKind::Tool, json!({"n": "NaN"}));
        bad.max_retries = 3;
        store.enqueue(bad).await.unwrap();
        let run = claim(&store).await;

        let outcome = dispatcher.dispatch(run.clone()).await.unwrap();
        match outcome {
            Outcome::FatalFailure(error) => assert_eq!(error.kind, ErrorKind::Validation),
            other => panic!("expected FatalFailure, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Fatal despite remaining retry budget.
        let finished = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.retry_count, 0);
    }

    #[tokio::test]
    async fn test_handler_failure_consumes_retry_then_goes_fatal() {
        let decl = declare(WorkflowKind::Tool, "flaky")
            .retries(1)
            .retry_backoff("1ms")
            .tool(|_ctx| async move {
                Err::<serde_json::Value, _>(HandlerError::failed("boom"))
            })
            .build()
            .unwrap();

        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let dispatcher = Dispatcher::new(store.clone(), registry(vec![decl]));

        let mut run = TaskRun::new("flaky", WorkflowKind::Tool, json!({}));
        run.max_retries = 1;
        store.enqueue(run).await.unwrap();

        let first = claim(&store).await;
        let outcome = dispatcher.dispatch(first.clone()).await.unwrap();
        assert!(matches!(outcome, Outcome::RetryableFailure(_)));
        let requeued = store.get_run(first.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, RunStatus::Queued);
        assert_eq!(requeued.retry_count, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = claim(&store).await;
        let outcome = dispatcher.dispatch(second.clone()).await.unwrap();
        assert!(matches!(outcome, Outcome::FatalFailure(_)));
        assert_eq!(
            store.get_run(second.id).await.unwrap().unwrap().status,
            RunStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_of_terminal_run_absorbed() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let dispatcher = Dispatcher::new(store.clone(), registry(vec![double_decl()]));

        let decl = double_decl();
        store
            .enqueue(decl.new_run(json!({"n": 1}), &EnqueueOptions::default()))
            .await
            .unwrap();
        let run = claim(&store).await;

        // First delivery completes the run.
        dispatcher.dispatch(run.clone()).await.unwrap();
        // A stale re-delivery of the same claim is a no-op.
        let outcome = dispatcher.dispatch(run.clone()).await.unwrap();
        assert!(matches!(outcome, Outcome::DuplicateDelivery));

        let finished = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(finished.output, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_agent_suspends_then_completes_after_wake() {
        let decl = declare(WorkflowKind::Agent, "waiter")
            .agent(|ctx| async move {
                let outcome = ctx.wait_for(Condition::user_event("go")).await?;
                Ok(json!({"woken_by": outcome.branch}))
            })
            .build()
            .unwrap();

        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let dispatcher = Dispatcher::new(store.clone(), registry(vec![decl]));

        store
            .enqueue(TaskRun::new("waiter", WorkflowKind::Agent, json!({})))
            .await
            .unwrap();
        let run = claim(&store).await;

        let outcome = dispatcher.dispatch(run.clone()).await.unwrap();
        assert!(matches!(outcome, Outcome::Suspended));
        assert_eq!(
            store.get_run(run.id).await.unwrap().unwrap().status,
            RunStatus::Waiting
        );

        store.publish_event("go", json!({})).await.unwrap();
        let run = claim(&store).await;
        let outcome = dispatcher.dispatch(run.clone()).await.unwrap();
        assert!(matches!(outcome, Outcome::Success(v) if v == json!({"woken_by": "event:go"})));
    }

    #[tokio::test]
    async fn test_execution_timeout_is_retryable() {
        let decl = declare(WorkflowKind::Tool, "slow")
            .execution_timeout("20ms")
            .retries(1)
            .retry_backoff("1ms")
            .tool(|_ctx| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({}))
            })
            .build()
            .unwrap();

        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let dispatcher = Dispatcher::new(store.clone(), registry(vec![decl]));

        let mut run = TaskRun::new("slow", WorkflowKind::Tool, json!({}));
        run.max_retries = 1;
        run.execution_timeout = Duration::from_millis(20);
        store.enqueue(run).await.unwrap();
        let run = claim(&store).await;

        let outcome = dispatcher.dispatch(run.clone()).await.unwrap();
        match outcome {
            Outcome::RetryableFailure(error) => assert_eq!(error.kind, ErrorKind::Timeout),
            other => panic!("expected RetryableFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_timeout_rearms_deadline() {
        let decl = declare(WorkflowKind::Tool, "heartbeat")
            .execution_timeout("40ms")
            .tool(|ctx| async move {
                // Outlive the original deadline by re-arming midway.
                tokio::time::sleep(Duration::from_millis(25)).await;
                ctx.refresh_timeout(Duration::from_millis(100)).await?;
                tokio::time::sleep(Duration::from_millis(40)).await;
                Ok(json!("made it"))
            })
            .build()
            .unwrap();

        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let dispatcher = Dispatcher::new(store.clone(), registry(vec![decl]));

        store
            .enqueue(TaskRun::new("heartbeat", WorkflowKind::Tool, json!({})))
            .await
            .unwrap();
        let run = claim(&store).await;

        let outcome = dispatcher.dispatch(run).await.unwrap();
        assert!(matches!(outcome, Outcome::Success(v) if v == json!("made it")));
    }

    #[tokio::test]
    async fn test_output_schema_violation_is_fatal() {
        let decl = declare(WorkflowKind::Tool, "liar")
            .output_schema(json!({"type": "integer"}))
            .retries(3)
            .tool(|_ctx| async move { Ok(json!("not an integer")) })
            .build()
            .unwrap();

        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let dispatcher = Dispatcher::new(store.clone(), registry(vec![decl]));

        let mut run = TaskRun::new("liar", WorkflowKind::Tool, json!({}));
        run.max_retries = 3;
        store.enqueue(run).await.unwrap();
        let run = claim(&store).await;

        let outcome = dispatcher.dispatch(run.clone()).await.unwrap();
        match outcome {
            Outcome::FatalFailure(error) => assert_eq!(error.kind, ErrorKind::Validation),
            other => panic!("expected FatalFailure, got {other:?}"),
        }
        assert_eq!(
            store.get_run(run.id).await.unwrap().unwrap().retry_count,
            0
        );
    }
}
