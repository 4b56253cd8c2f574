//! # Keel Store
//!
//! Task record store: the durable log of task runs, their status, retry
//! count, and checkpoint event history.
//!
//! The [`RecordStore`] trait is the contract the execution core depends on.
//! Two implementations ship here:
//!
//! - [`MemoryRecordStore`] — reference broker semantics, used for embedded
//!   execution and tests
//! - [`SqliteRecordStore`] — durable persistence on SQLite, where
//!   `UNIQUE(run_id, seq)` gives first-writer-wins checkpoint commit

pub mod memory;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;
pub use store::{CronEntry, RecordStore};
