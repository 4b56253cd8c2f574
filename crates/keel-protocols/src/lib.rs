//! # Keel Protocols
//!
//! Shared data model for the Keel durable task runtime.
//!
//! Everything a worker, broker client, or toolbox needs to agree on lives
//! here: task runs and their status machine, checkpoint events and pending
//! operations, suspend conditions, duration parsing, and the error taxonomy.

pub mod checkpoint;
pub mod concurrency;
pub mod condition;
pub mod duration;
pub mod error;
pub mod task_run;
pub mod types;

pub use checkpoint::{CheckpointEvent, OpKind, OpSignature, PendingOp, WakeCondition};
pub use concurrency::{ConcurrencyPolicy, ConcurrencyStrategy, RunConcurrency};
pub use condition::{Condition, ConditionOutcome};
pub use duration::parse_duration;
pub use error::{
    DurableError, DurationError, ErrorKind, HandlerError, ProviderError, RunError, SelectionError,
    StoreError,
};
pub use task_run::{EnqueueOptions, SubtaskSpec, TaskRun};
pub use types::{Metadata, Priority, RunStatus, WorkflowKind};
