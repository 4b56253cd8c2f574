//! # Keel
//!
//! Durable task-queue client. Callers declare agents and tools as pure
//! async functions; every invocation becomes a queued, checkpointed run
//! that survives worker crashes and resumes on any machine.
//!
//! ```no_run
//! use std::sync::Arc;
//! use keel::{declare, Runtime, WorkflowKind};
//! use keel::store::MemoryRecordStore;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = Runtime::builder()
//!     .store(Arc::new(MemoryRecordStore::new()))
//!     .declare(
//!         declare(WorkflowKind::Tool, "double")
//!             .input_schema(json!({"type": "object", "required": ["n"]}))
//!             .tool(|ctx| async move {
//!                 let n = ctx.input()["n"].as_i64().unwrap_or(0);
//!                 Ok(json!(n * 2))
//!             })
//!             .build()?,
//!     )?
//!     .build();
//!
//! runtime.start();
//! let out = runtime
//!     .client()
//!     .run("double", json!({"n": 21}), Default::default())
//!     .await?;
//! assert_eq!(out, json!(42));
//! runtime.shutdown();
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::error;

use keel_core::Registry;
use keel_store::{MemoryRecordStore, RecordStore};
use keel_worker::{WakeupService, WorkerConfig, WorkerPool};

pub use keel_core::{
    declare, Client, CoreError, DeclarationBuilder, HandlerRef, Registry as WorkflowRegistry,
    RunHandle, WorkflowDeclaration,
};
pub use keel_durable::{
    subtask_outcome, AgentHandler, DurableContext, SubtaskFailure, SubtaskHandle, TaskContext,
    TaskHandler,
};
pub use keel_protocols::{
    Condition, ConditionOutcome, ConcurrencyStrategy, DurableError, EnqueueOptions, ErrorKind,
    HandlerError, Priority, RunError, RunStatus, TaskRun, WorkflowKind,
};
pub use keel_toolbox::{
    assert_exhaustive, GenerateRequest, GenerateResponse, LlmProvider, MockProvider, Toolbox,
    ToolboxError, ToolResult, ToolSelection,
};
pub use keel_worker::{WorkerConfig as Config, WorkerError};

pub mod store {
    //! Record store contract and implementations.
    pub use keel_store::{CronEntry, MemoryRecordStore, RecordStore, SqliteRecordStore};
}

/// Everything wired together: store, registry, client, worker pool, and
/// wake-up service, sharing one shutdown signal.
pub struct Runtime {
    client: Client,
    store: Arc<dyn RecordStore>,
    registry: Arc<Registry>,
    config: WorkerConfig,
    shutdown: broadcast::Sender<()>,
}

impl Runtime {
    /// Start building a runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            store: None,
            registry: Registry::new(),
            config: WorkerConfig::default(),
        }
    }

    /// Client for enqueueing runs and publishing events.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Spawn the worker pool and the wake-up service. Both run until
    /// [`shutdown`](Runtime::shutdown) is called.
    pub fn start(&self) {
        let pool = WorkerPool::new(self.config.clone(), self.store.clone(), self.registry.clone());
        let pool_shutdown = pool.shutdown_handle();
        let mut forward = self.shutdown.subscribe();
        tokio::spawn(async move {
            let _ = forward.recv().await;
            let _ = pool_shutdown.send(());
        });
        tokio::spawn(async move {
            if let Err(e) = pool.run().await {
                error!("worker pool exited with error: {}", e);
            }
        });

        let wakeup = WakeupService::new(self.store.clone(), self.config.clone());
        let wakeup_rx = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = wakeup.run(wakeup_rx).await {
                error!("wake-up service exited with error: {}", e);
            }
        });
    }

    /// Signal every spawned service to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

/// Builder for [`Runtime`].
pub struct RuntimeBuilder {
    store: Option<Arc<dyn RecordStore>>,
    registry: Registry,
    config: WorkerConfig,
}

impl std::fmt::Debug for RuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBuilder").finish_non_exhaustive()
    }
}

impl RuntimeBuilder {
    /// Use the given store. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Worker configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a declaration. A duplicate name is a startup error.
    pub fn declare(mut self, declaration: WorkflowDeclaration) -> Result<Self, CoreError> {
        self.registry.register(declaration)?;
        Ok(self)
    }

    /// Finish the runtime.
    pub fn build(self) -> Runtime {
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryRecordStore::new()));
        let registry = Arc::new(self.registry);
        let client = Client::new(store.clone(), registry.clone());
        let (shutdown, _) = broadcast::channel(1);
        Runtime {
            client,
            store,
            registry,
            config: self.config,
            shutdown,
        }
    }
}
