//! # Keel Durable
//!
//! Checkpointed replay execution.
//!
//! Agent handlers are pure functions of their input and the recorded
//! outcomes of their durable operations. Every delivery replays the handler
//! from the top: operations with a recorded checkpoint return the recorded
//! outcome immediately, the first operation without one issues its side
//! effect (at most once) and suspends the run. A suspended run holds no
//! slot, no thread, and no memory.

pub mod context;
pub mod durable;
pub mod handle;
pub mod handler;

pub use context::TaskContext;
pub use durable::{subtask_outcome, DurableContext, SubtaskFailure};
pub use handle::SubtaskHandle;
pub use handler::{AgentHandler, FnAgentHandler, FnTaskHandler, TaskHandler};
