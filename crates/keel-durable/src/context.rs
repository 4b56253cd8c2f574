//! Plain execution context for tool handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::sync::watch;

use keel_protocols::{Metadata, StoreError, TaskRun, WorkflowKind};
use keel_store::RecordStore;
use uuid::Uuid;

/// Execution context handed to a tool handler.
///
/// Tools run on ordinary slots and may perform arbitrary side effects; the
/// context gives them their input, run identity, and a way to re-arm the
/// execution timeout from inside a long attempt.
pub struct TaskContext {
    run: TaskRun,
    store: Arc<dyn RecordStore>,
    deadline: watch::Sender<DateTime<Utc>>,
}

impl TaskContext {
    /// Build a context for one delivery attempt.
    pub fn new(
        run: TaskRun,
        store: Arc<dyn RecordStore>,
        deadline: watch::Sender<DateTime<Utc>>,
    ) -> Self {
        Self {
            run,
            store,
            deadline,
        }
    }

    /// The run being executed.
    pub fn run(&self) -> &TaskRun {
        &self.run
    }

    /// Run id.
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    /// Declaration kind.
    pub fn kind(&self) -> WorkflowKind {
        self.run.kind
    }

    /// Raw input payload.
    pub fn input(&self) -> &serde_json::Value {
        &self.run.input
    }

    /// Input deserialized into a concrete type.
    pub fn input_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.run.input.clone())
    }

    /// Retry attempts consumed so far.
    pub fn retry_count(&self) -> u32 {
        self.run.retry_count
    }

    /// Metadata attached at enqueue time.
    pub fn metadata(&self) -> &Metadata {
        &self.run.metadata
    }

    /// Record store backing this run.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Cooperative cancellation check. Long-running handlers poll this and
    /// bail out when a caller (or a parent's cancellation) cancelled the run.
    pub async fn is_cancelled(&self) -> bool {
        match self.store.get_run(self.run.id).await {
            Ok(Some(run)) => run.status == keel_protocols::RunStatus::Cancelled,
            _ => false,
        }
    }

    /// Re-arm the execution timeout for `extension` from now.
    ///
    /// Pushes the new deadline to the dispatcher watching this attempt and
    /// extends the worker lease so the run is not re-delivered mid-attempt.
    pub async fn refresh_timeout(&self, extension: std::time::Duration) -> Result<(), StoreError> {
        self.store.refresh_timeout(self.run.id, extension).await?;
        let new_deadline = Utc::now()
            + chrono::Duration::from_std(extension)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let _ = self.deadline.send(new_deadline);
        Ok(())
    }
}
