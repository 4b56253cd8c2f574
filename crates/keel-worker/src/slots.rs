//! Slot pools bounding concurrent handler execution.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use keel_protocols::WorkflowKind;

use crate::error::WorkerError;

/// Two independent execution pools: ordinary slots for tool work and
/// durable slots for agent orchestration.
///
/// A suspended agent holds no slot; the permit is released the moment the
/// dispatch outcome (terminal or suspended) is known.
pub struct SlotManager {
    slots: Arc<Semaphore>,
    durable_slots: Arc<Semaphore>,
}

impl SlotManager {
    /// Create pools with the given capacities.
    pub fn new(slots: usize, durable_slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots)),
            durable_slots: Arc::new(Semaphore::new(durable_slots)),
        }
    }

    fn pool(&self, kind: WorkflowKind) -> &Arc<Semaphore> {
        match kind {
            WorkflowKind::Tool => &self.slots,
            WorkflowKind::Agent => &self.durable_slots,
        }
    }

    /// Await a slot of the matching pool. Never blocks the runtime.
    pub async fn acquire(&self, kind: WorkflowKind) -> Result<ScopedSlot, WorkerError> {
        let permit = self
            .pool(kind)
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::SlotPoolClosed)?;
        Ok(ScopedSlot {
            _permit: permit,
            kind,
        })
    }

    /// Slot of the matching pool if one is free right now.
    pub fn try_acquire(&self, kind: WorkflowKind) -> Option<ScopedSlot> {
        self.pool(kind)
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| ScopedSlot {
                _permit: permit,
                kind,
            })
    }

    /// Free slots in the matching pool.
    pub fn available(&self, kind: WorkflowKind) -> usize {
        self.pool(kind).available_permits()
    }
}

/// A held execution slot; released on drop.
pub struct ScopedSlot {
    _permit: OwnedSemaphorePermit,
    kind: WorkflowKind,
}

impl ScopedSlot {
    /// Which pool this slot came from.
    pub fn kind(&self) -> WorkflowKind {
        self.kind
    }
}
