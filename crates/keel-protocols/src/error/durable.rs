//! Durable execution errors.

use thiserror::Error;

use super::{HandlerError, RunError, StoreError};
use crate::checkpoint::OpSignature;

/// Errors produced inside a durable (agent) handler.
///
/// `Suspended` is how a handler yields control: every durable operation that
/// cannot complete from recorded history returns it, and the handler body
/// propagates it upward with `?`. The dispatcher treats it as a suspend
/// request, not a failure.
#[derive(Debug, Error)]
pub enum DurableError {
    /// The handler reached a durable operation with no recorded outcome; the
    /// side effect has been issued and the run must suspend until it resolves.
    #[error("run suspended on durable operation at seq {seq}")]
    Suspended {
        /// Sequence position of the pending operation.
        seq: u32,
    },

    /// Replay produced a different operation than the recorded checkpoint at
    /// the same sequence position. The handler's control flow depends on
    /// something other than prior checkpoint results. Never retried.
    #[error("determinism violation at seq {seq}: recorded {recorded:?}, replayed {replayed:?}")]
    Determinism {
        /// Sequence position of the mismatch.
        seq: u32,
        /// Signature recorded in the checkpoint log.
        recorded: Box<OpSignature>,
        /// Signature the handler issued on replay.
        replayed: Box<OpSignature>,
    },

    /// A nested call completed with a terminal failure. The parent decides
    /// whether this is fatal to it; unhandled propagation fails the parent as
    /// a handler error.
    #[error("subtask '{name}' failed: {error}")]
    SubtaskFailed {
        /// Declaration name of the failed subtask.
        name: String,
        /// The child's terminal error.
        error: RunError,
    },

    /// The handler itself failed.
    #[error(transparent)]
    Handler(#[from] HandlerError),

    /// Record store failure while issuing or replaying an operation.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DurableError {
    /// Whether this error is a suspend request rather than a failure.
    pub fn is_suspend(&self) -> bool {
        matches!(self, DurableError::Suspended { .. })
    }
}
