//! Database schema management.

use rusqlite::Connection;
use tokio_rusqlite::Error;

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

const SCHEMA: &str = r#"
-- Task runs. The full run document lives in `data`; the remaining columns
-- index the delivery and concurrency queries.
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    declaration TEXT NOT NULL,
    priority INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    scheduled_at TEXT,
    started_at TEXT,
    lease_expires_at TEXT,
    parent_run TEXT,
    concurrency_key TEXT,
    data TEXT NOT NULL
);

-- Checkpoint event history. The composite primary key is what makes
-- checkpoint commit first-writer-wins: INSERT OR IGNORE on (run_id, seq)
-- leaves the recorded event authoritative.
CREATE TABLE IF NOT EXISTS checkpoints (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);

-- Issued-but-unresolved durable operations.
CREATE TABLE IF NOT EXISTS pending_ops (
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (run_id, seq)
);

-- Registered cron schedules.
CREATE TABLE IF NOT EXISTS crons (
    name TEXT PRIMARY KEY,
    next_fire_at TEXT NOT NULL,
    data TEXT NOT NULL
);

-- Indexes for the delivery loop and the wake-up service
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_claim ON runs(status, priority, created_at);
CREATE INDEX IF NOT EXISTS idx_runs_group ON runs(declaration, concurrency_key, status);
CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_creation() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='runs'")
            .unwrap();
        assert!(stmt.exists([]).unwrap());

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name='checkpoints'")
            .unwrap();
        assert!(stmt.exists([]).unwrap());
    }

    #[test]
    fn test_checkpoint_position_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT OR IGNORE INTO checkpoints (run_id, seq, data) VALUES ('r1', 0, 'first')",
            [],
        )
        .unwrap();
        let ignored = conn
            .execute(
                "INSERT OR IGNORE INTO checkpoints (run_id, seq, data) VALUES ('r1', 0, 'second')",
                [],
            )
            .unwrap();
        assert_eq!(ignored, 0);

        let data: String = conn
            .query_row(
                "SELECT data FROM checkpoints WHERE run_id = 'r1' AND seq = 0",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(data, "first");
    }
}
