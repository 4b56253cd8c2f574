//! Worker pool: claim, dispatch, repeat.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use keel_core::Registry;
use keel_store::RecordStore;

use crate::config::WorkerConfig;
use crate::dispatcher::{Dispatcher, Outcome};
use crate::error::WorkerError;
use crate::slots::SlotManager;

/// Claims deliverable runs and executes them on the slot pools.
pub struct WorkerPool {
    config: WorkerConfig,
    store: Arc<dyn RecordStore>,
    slots: Arc<SlotManager>,
    dispatcher: Arc<Dispatcher>,
    shutdown: broadcast::Sender<()>,
}

impl WorkerPool {
    /// Create a pool over a store and a registry.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn RecordStore>,
        registry: Arc<Registry>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let slots = Arc::new(SlotManager::new(config.slots, config.durable_slots));
        let dispatcher = Arc::new(Dispatcher::new(store.clone(), registry));
        Self {
            config,
            store,
            slots,
            dispatcher,
            shutdown,
        }
    }

    /// Handle for signalling shutdown.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// The slot pools.
    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    /// Run the claim loop until shutdown is signalled.
    pub async fn run(&self) -> Result<(), WorkerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        info!("worker '{}' starting", self.config.worker_id);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("worker '{}' shutting down", self.config.worker_id);
                    return Ok(());
                }
                claimed = self.poll_once() => {
                    match claimed {
                        Ok(true) => {} // claimed something; poll again immediately
                        Ok(false) => tokio::time::sleep(self.config.poll_interval()).await,
                        Err(e) => {
                            warn!("claim poll failed: {}", e);
                            tokio::time::sleep(self.config.poll_interval()).await;
                        }
                    }
                }
            }
        }
    }

    /// Claim and dispatch at most one run. Returns whether one was claimed.
    async fn poll_once(&self) -> Result<bool, WorkerError> {
        let Some(run) = self
            .store
            .claim_next(&self.config.worker_id, self.config.lease())
            .await?
        else {
            return Ok(false);
        };

        let slot = self.slots.acquire(run.kind).await?;
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let _slot = slot; // held for the duration of the attempt
            let run_id = run.id;
            match dispatcher.dispatch(run).await {
                Ok(Outcome::Success(_)) => debug!("run {} succeeded", run_id),
                Ok(Outcome::Suspended) => debug!("run {} suspended", run_id),
                Ok(Outcome::RetryableFailure(e)) => debug!("run {} will retry: {}", run_id, e),
                Ok(Outcome::FatalFailure(e)) => debug!("run {} failed: {}", run_id, e),
                Ok(Outcome::DuplicateDelivery) => debug!("run {} duplicate absorbed", run_id),
                Err(e) => error!("dispatch of run {} errored: {}", run_id, e),
            }
        });
        Ok(true)
    }
}
