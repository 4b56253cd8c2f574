//! # Keel Worker
//!
//! Delivery side of the runtime: the worker pool claims runs from the
//! record store, the dispatcher executes them against registered handlers
//! on bounded slot pools, and the wake-up service resolves everything
//! time-driven (timers, deadlines, awaited completions, leases, crons).

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod slots;
pub mod wakeup;
pub mod worker;

pub use config::WorkerConfig;
pub use dispatcher::{Dispatcher, Outcome};
pub use error::WorkerError;
pub use slots::{ScopedSlot, SlotManager};
pub use wakeup::WakeupService;
pub use worker::WorkerPool;
