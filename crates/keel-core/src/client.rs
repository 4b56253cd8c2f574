//! Scheduling client: the caller-facing entry points.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use keel_protocols::{EnqueueOptions, RunError, RunStatus};
use keel_store::{CronEntry, RecordStore};

use crate::error::CoreError;
use crate::registry::Registry;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Client for enqueueing and observing task runs.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn RecordStore>,
    registry: Arc<Registry>,
}

impl Client {
    /// Create a client over a store and a registry.
    pub fn new(store: Arc<dyn RecordStore>, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// The registry this client schedules against.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Enqueue a run and await its terminal result.
    pub async fn run(
        &self,
        name: &str,
        input: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<serde_json::Value, CoreError> {
        let handle = self.run_no_wait(name, input, opts).await?;
        handle.result().await
    }

    /// Enqueue a run and return a handle without waiting.
    ///
    /// Input is validated against the declaration's schema before anything
    /// is persisted; a violation never reaches a worker.
    pub async fn run_no_wait(
        &self,
        name: &str,
        input: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<RunHandle, CoreError> {
        let decl = self
            .registry
            .get(name)
            .ok_or_else(|| CoreError::UnknownDeclaration(name.to_string()))?;
        decl.validate_input(&input)
            .map_err(|e| CoreError::InvalidInput {
                name: name.to_string(),
                message: e.message,
            })?;

        let run = decl.new_run(input, &opts);
        let run_id = self.store.enqueue(run).await?;
        debug!("enqueued '{}' as run {}", name, run_id);
        Ok(RunHandle {
            run_id,
            name: name.to_string(),
            store: self.store.clone(),
        })
    }

    /// Enqueue a run for delivery at a fixed time.
    pub async fn schedule(
        &self,
        name: &str,
        at: DateTime<Utc>,
        input: serde_json::Value,
        mut opts: EnqueueOptions,
    ) -> Result<RunHandle, CoreError> {
        opts.scheduled_at = Some(at);
        self.run_no_wait(name, input, opts).await
    }

    /// Enqueue a run for delivery after a delay.
    pub async fn delay(
        &self,
        name: &str,
        delay: Duration,
        input: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<RunHandle, CoreError> {
        let at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        self.schedule(name, at, input, opts).await
    }

    /// Register a cron schedule that materializes a run of `name` on every
    /// fire. The expression is parsed now; an invalid one is a
    /// configuration error, not a runtime failure.
    pub async fn cron(
        &self,
        schedule_name: &str,
        name: &str,
        expression: &str,
        input: serde_json::Value,
    ) -> Result<(), CoreError> {
        let decl = self
            .registry
            .get(name)
            .ok_or_else(|| CoreError::UnknownDeclaration(name.to_string()))?;

        let schedule =
            cron::Schedule::from_str(expression).map_err(|e| CoreError::InvalidCron {
                expression: expression.to_string(),
                message: e.to_string(),
            })?;
        let next_fire_at = schedule
            .upcoming(Utc)
            .next()
            .ok_or_else(|| CoreError::InvalidCron {
                expression: expression.to_string(),
                message: "expression never fires".to_string(),
            })?;

        self.store
            .add_cron(CronEntry {
                name: schedule_name.to_string(),
                expression: expression.to_string(),
                spec: decl.subtask(),
                input,
                next_fire_at,
                created_at: Utc::now(),
            })
            .await?;
        debug!("registered cron '{}' -> '{}'", schedule_name, name);
        Ok(())
    }

    /// Publish a user event, waking every run waiting on it. Returns the
    /// number of runs woken.
    pub async fn publish_event(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<u32, CoreError> {
        Ok(self.store.publish_event(name, payload).await?)
    }

    /// Cancel a run, propagating to its children.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), CoreError> {
        Ok(self.store.cancel(run_id).await?)
    }
}

/// Handle to an enqueued run.
#[derive(Clone)]
pub struct RunHandle {
    run_id: Uuid,
    name: String,
    store: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunHandle")
            .field("run_id", &self.run_id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RunHandle {
    /// The run id.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Declaration name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status.
    pub async fn status(&self) -> Result<RunStatus, CoreError> {
        let run = self
            .store
            .get_run(self.run_id)
            .await?
            .ok_or(keel_protocols::StoreError::RunNotFound(self.run_id))?;
        Ok(run.status)
    }

    /// Await the terminal result: the validated output on success, or
    /// [`CoreError::RunFailed`] carrying the terminal error otherwise.
    pub async fn result(&self) -> Result<serde_json::Value, CoreError> {
        loop {
            let run = self
                .store
                .get_run(self.run_id)
                .await?
                .ok_or(keel_protocols::StoreError::RunNotFound(self.run_id))?;
            if run.status.is_terminal() {
                return match run.status {
                    RunStatus::Succeeded => Ok(run.output.unwrap_or(serde_json::Value::Null)),
                    RunStatus::Cancelled => Err(CoreError::RunFailed {
                        name: self.name.clone(),
                        error: run.error.unwrap_or_else(RunError::cancelled),
                    }),
                    _ => Err(CoreError::RunFailed {
                        name: self.name.clone(),
                        error: run
                            .error
                            .unwrap_or_else(|| RunError::handler("run failed without detail")),
                    }),
                };
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Terminal errors of this run's direct children, by declaration name.
    pub async fn errors(&self) -> Result<Vec<(String, RunError)>, CoreError> {
        let children = self.store.list_children(self.run_id).await?;
        Ok(children
            .into_iter()
            .filter_map(|c| c.error.map(|e| (c.declaration, e)))
            .collect())
    }

    /// Cancel the run.
    pub async fn cancel(&self) -> Result<(), CoreError> {
        Ok(self.store.cancel(self.run_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::declaration::declare;
    use keel_protocols::WorkflowKind;
    use keel_store::MemoryRecordStore;
    use serde_json::json;

    fn client_with(decls: Vec<crate::declaration::WorkflowDeclaration>) -> Client {
        let mut registry = Registry::new();
        for d in decls {
            registry.register(d).unwrap();
        }
        Client::new(Arc::new(MemoryRecordStore::new()), Arc::new(registry))
    }

    fn double_decl() -> crate::declaration::WorkflowDeclaration {
        declare(WorkflowKind::Tool, "double")
            .input_schema(json!({
                "type": "object",
                "properties": {"n": {"type": "integer"}},
                "required": ["n"]
            }))
            .tool(|ctx| async move {
                let n = ctx.input()["n"].as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_no_wait_enqueues() {
        let client = client_with(vec![double_decl()]);
        let handle = client
            .run_no_wait("double", json!({"n": 2}), EnqueueOptions::default())
            .await
            .unwrap();
        assert_eq!(handle.status().await.unwrap(), RunStatus::Queued);
    }

    #[tokio::test]
    async fn test_unknown_declaration_rejected() {
        let client = client_with(vec![]);
        let err = client
            .run_no_wait("missing", json!({}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UnknownDeclaration(_)));
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_enqueue() {
        let client = client_with(vec![double_decl()]);
        let err = client
            .run_no_wait("double", json!({"n": "two"}), EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_delay_sets_scheduled_at() {
        let client = client_with(vec![double_decl()]);
        let handle = client
            .delay(
                "double",
                Duration::from_secs(3600),
                json!({"n": 2}),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        let run = client.store().get_run(handle.run_id()).await.unwrap().unwrap();
        assert!(run.scheduled_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_result_resolves_when_run_finishes() {
        let client = client_with(vec![double_decl()]);
        let handle = client
            .run_no_wait("double", json!({"n": 2}), EnqueueOptions::default())
            .await
            .unwrap();

        let store = client.store().clone();
        let run_id = handle.run_id();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            store
                .finish(run_id, RunStatus::Succeeded, Some(json!(4)), None)
                .await
                .unwrap();
        });

        assert_eq!(handle.result().await.unwrap(), json!(4));
    }

    #[tokio::test]
    async fn test_result_surfaces_terminal_failure() {
        let client = client_with(vec![double_decl()]);
        let handle = client
            .run_no_wait("double", json!({"n": 2}), EnqueueOptions::default())
            .await
            .unwrap();
        client
            .store()
            .finish(
                handle.run_id(),
                RunStatus::Failed,
                None,
                Some(RunError::handler("boom")),
            )
            .await
            .unwrap();

        let err = handle.result().await.unwrap_err();
        assert!(matches!(err, CoreError::RunFailed { .. }));
    }

    #[tokio::test]
    async fn test_invalid_cron_expression_rejected() {
        let client = client_with(vec![double_decl()]);
        let err = client
            .cron("nightly", "double", "not a cron expr", json!({"n": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidCron { .. }));
    }

    #[tokio::test]
    async fn test_cron_registers_entry() {
        let client = client_with(vec![double_decl()]);
        client
            .cron("nightly", "double", "0 0 2 * * *", json!({"n": 1}))
            .await
            .unwrap();
        let entries = client.store().cron_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].spec.name, "double");
    }
}
