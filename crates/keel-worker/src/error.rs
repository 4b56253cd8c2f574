//! Worker errors.

use thiserror::Error;

use keel_protocols::StoreError;

/// Errors from the worker pool and wake-up service.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Record store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The slot pool was closed during shutdown.
    #[error("slot pool closed")]
    SlotPoolClosed,
}
