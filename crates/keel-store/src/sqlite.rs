//! SQLite record store implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use tokio_rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use keel_protocols::{
    CheckpointEvent, ConcurrencyStrategy, ConditionOutcome, PendingOp, RunError, RunStatus,
    StoreError, TaskRun, WakeCondition,
};

use crate::schema::init_schema;
use crate::store::{CronEntry, RecordStore};

type CallError = tokio_rusqlite::Error;

fn json_err(e: serde_json::Error) -> CallError {
    CallError::Other(Box::new(e))
}

fn id_err(e: uuid::Error) -> CallError {
    CallError::Other(Box::new(e))
}

fn db_err(e: CallError) -> StoreError {
    StoreError::Database(e.to_string())
}

/// Fixed-width timestamp encoding so string comparison in SQL matches
/// chronological order.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn save_run(conn: &rusqlite::Connection, run: &TaskRun) -> Result<(), CallError> {
    let data = serde_json::to_string(run).map_err(json_err)?;
    conn.execute(
        "INSERT OR REPLACE INTO runs
         (id, status, declaration, priority, created_at, scheduled_at, started_at,
          lease_expires_at, parent_run, concurrency_key, data)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            run.id.to_string(),
            run.status.as_str(),
            run.declaration,
            run.priority as i64,
            ts(run.created_at),
            run.scheduled_at.map(ts),
            run.started_at.map(ts),
            run.lease_expires_at.map(ts),
            run.parent_run.map(|p| p.to_string()),
            run.concurrency.as_ref().map(|c| c.key.clone()),
            data,
        ],
    )?;
    Ok(())
}

fn load_run(conn: &rusqlite::Connection, id: Uuid) -> Result<Option<TaskRun>, CallError> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM runs WHERE id = ?1",
            [id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match data {
        Some(d) => Ok(Some(serde_json::from_str(&d).map_err(json_err)?)),
        None => Ok(None),
    }
}

fn running_group_count(
    conn: &rusqlite::Connection,
    declaration: &str,
    key: &str,
) -> Result<u32, CallError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM runs
         WHERE status = 'running' AND declaration = ?1 AND concurrency_key = ?2",
        params![declaration, key],
        |row| row.get(0),
    )?;
    Ok(count as u32)
}

fn cancel_tree(conn: &rusqlite::Connection, id: Uuid) -> Result<(), CallError> {
    if let Some(mut run) = load_run(conn, id)? {
        if !run.status.is_terminal() {
            run.status = RunStatus::Cancelled;
            run.error = Some(RunError::cancelled());
            run.lease_expires_at = None;
            run.worker_id = None;
            run.updated_at = Utc::now();
            save_run(conn, &run)?;
            conn.execute(
                "DELETE FROM pending_ops WHERE run_id = ?1",
                [id.to_string()],
            )?;
        }
    }

    let children: Vec<String> = conn
        .prepare("SELECT id FROM runs WHERE parent_run = ?1")?
        .query_map([id.to_string()], |row| row.get(0))?
        .collect::<Result<_, _>>()?;
    for child in children {
        cancel_tree(conn, Uuid::parse_str(&child).map_err(id_err)?)?;
    }
    Ok(())
}

/// Resolve one pending operation into a checkpoint event and wake the
/// owning run. Returns `false` when nothing is pending at `(run_id, seq)`.
fn resolve_op(
    conn: &rusqlite::Connection,
    run_id: Uuid,
    seq: u32,
    outcome: serde_json::Value,
) -> Result<bool, CallError> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM pending_ops WHERE run_id = ?1 AND seq = ?2",
            params![run_id.to_string(), seq],
            |row| row.get(0),
        )
        .optional()?;
    let Some(data) = data else {
        return Ok(false);
    };
    let op: PendingOp = serde_json::from_str(&data).map_err(json_err)?;

    conn.execute(
        "DELETE FROM pending_ops WHERE run_id = ?1 AND seq = ?2",
        params![run_id.to_string(), seq],
    )?;

    let event = CheckpointEvent::new(seq, op.signature, outcome);
    let event_data = serde_json::to_string(&event).map_err(json_err)?;
    conn.execute(
        "INSERT OR IGNORE INTO checkpoints (run_id, seq, data) VALUES (?1, ?2, ?3)",
        params![run_id.to_string(), seq, event_data],
    )?;

    if let Some(mut run) = load_run(conn, run_id)? {
        match run.status {
            RunStatus::Waiting => {
                run.status = RunStatus::Queued;
                run.scheduled_at = None;
                run.wake_pending = false;
                run.updated_at = Utc::now();
                save_run(conn, &run)?;
            }
            RunStatus::Running => {
                // Attempt still executing; suspend will requeue instead.
                run.wake_pending = true;
                save_run(conn, &run)?;
            }
            _ => {}
        }
    }
    Ok(true)
}

/// SQLite-backed record store.
///
/// The `UNIQUE(run_id, seq)` primary key on the checkpoints table is what
/// gives first-writer-wins checkpoint commit under concurrent attempts.
pub struct SqliteRecordStore {
    conn: Connection,
}

impl SqliteRecordStore {
    /// Create a new in-memory database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        conn.call(|conn| init_schema(conn)).await.map_err(db_err)?;
        Ok(Self { conn })
    }

    /// Open (or create) a file-backed database.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(path)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        conn.call(|conn| init_schema(conn)).await.map_err(db_err)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn enqueue(&self, run: TaskRun) -> Result<Uuid, StoreError> {
        let id = run.id;
        debug!("enqueue run {} ({})", id, run.declaration);
        self.conn
            .call(move |conn| {
                // Enqueue is idempotent on run id.
                if load_run(conn, run.id)?.is_none() {
                    save_run(conn, &run)?;
                }
                Ok(())
            })
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<TaskRun>, StoreError> {
        self.conn
            .call(move |conn| load_run(conn, id))
            .await
            .map_err(db_err)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        lease: Duration,
    ) -> Result<Option<TaskRun>, StoreError> {
        let worker = worker_id.to_string();
        let lease = chrono::Duration::from_std(lease)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.conn
            .call(move |conn| {
                let now = Utc::now();
                let candidates: Vec<String> = conn
                    .prepare(
                        "SELECT id FROM runs
                         WHERE status = 'queued'
                           AND (scheduled_at IS NULL OR scheduled_at <= ?1)
                         ORDER BY priority DESC, created_at ASC",
                    )?
                    .query_map([ts(now)], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;

                for id_str in candidates {
                    let id = Uuid::parse_str(&id_str).map_err(id_err)?;
                    let Some(mut run) = load_run(conn, id)? else {
                        continue;
                    };

                    if let Some(c) = run.concurrency.clone() {
                        let mut count = running_group_count(conn, &run.declaration, &c.key)?;
                        if count >= c.max_runs {
                            match c.strategy {
                                ConcurrencyStrategy::Queue => continue,
                                ConcurrencyStrategy::CancelInProgress => {
                                    while count >= c.max_runs {
                                        let victim: Option<String> = conn
                                            .query_row(
                                                "SELECT id FROM runs
                                                 WHERE status = 'running'
                                                   AND declaration = ?1
                                                   AND concurrency_key = ?2
                                                 ORDER BY COALESCE(started_at, created_at) ASC
                                                 LIMIT 1",
                                                params![run.declaration, c.key],
                                                |row| row.get(0),
                                            )
                                            .optional()?;
                                        let Some(victim) = victim else {
                                            break;
                                        };
                                        cancel_tree(
                                            conn,
                                            Uuid::parse_str(&victim).map_err(id_err)?,
                                        )?;
                                        count = running_group_count(
                                            conn,
                                            &run.declaration,
                                            &c.key,
                                        )?;
                                    }
                                    if count >= c.max_runs {
                                        continue;
                                    }
                                }
                            }
                        }
                    }

                    run.status = RunStatus::Running;
                    run.worker_id = Some(worker.clone());
                    run.lease_expires_at = Some(now + lease);
                    run.started_at.get_or_insert(now);
                    run.updated_at = now;
                    save_run(conn, &run)?;
                    return Ok(Some(run));
                }
                Ok(None)
            })
            .await
            .map_err(db_err)
    }

    async fn suspend(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let Some(mut run) = load_run(conn, id)? else {
                    return Ok(None);
                };
                if run.status != RunStatus::Running {
                    return Ok(Some(()));
                }
                if run.wake_pending {
                    run.status = RunStatus::Queued;
                    run.scheduled_at = None;
                    run.wake_pending = false;
                } else {
                    run.status = RunStatus::Waiting;
                }
                run.lease_expires_at = None;
                run.worker_id = None;
                run.updated_at = Utc::now();
                save_run(conn, &run)?;
                Ok(Some(()))
            })
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn finish(
        &self,
        id: Uuid,
        status: RunStatus,
        output: Option<serde_json::Value>,
        error: Option<RunError>,
    ) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let Some(mut run) = load_run(conn, id)? else {
                    return Ok(None);
                };
                if run.status.is_terminal() {
                    return Ok(Some(false));
                }
                run.status = status;
                run.output = output;
                run.error = error;
                run.lease_expires_at = None;
                run.worker_id = None;
                run.updated_at = Utc::now();
                save_run(conn, &run)?;
                conn.execute(
                    "DELETE FROM pending_ops WHERE run_id = ?1",
                    [id.to_string()],
                )?;
                Ok(Some(true))
            })
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn requeue_for_retry(
        &self,
        id: Uuid,
        error: RunError,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let delay = chrono::Duration::from_std(delay)
            .unwrap_or_else(|_| chrono::Duration::seconds(5));
        self.conn
            .call(move |conn| {
                let Some(mut run) = load_run(conn, id)? else {
                    return Ok(None);
                };
                let now = Utc::now();
                run.retry_count += 1;
                run.status = RunStatus::Queued;
                run.scheduled_at = Some(now + delay);
                run.lease_expires_at = None;
                run.worker_id = None;
                run.metadata.insert(
                    "last_error".to_string(),
                    serde_json::json!(error.to_string()),
                );
                run.updated_at = now;
                save_run(conn, &run)?;
                Ok(Some(()))
            })
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn cancel(&self, id: Uuid) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                if load_run(conn, id)?.is_none() {
                    return Ok(None);
                }
                cancel_tree(conn, id)?;
                Ok(Some(()))
            })
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn refresh_timeout(&self, id: Uuid, extension: Duration) -> Result<(), StoreError> {
        let extension = chrono::Duration::from_std(extension)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        self.conn
            .call(move |conn| {
                let Some(mut run) = load_run(conn, id)? else {
                    return Ok(None);
                };
                if run.status == RunStatus::Running {
                    run.lease_expires_at = Some(Utc::now() + extension);
                    run.updated_at = Utc::now();
                    save_run(conn, &run)?;
                }
                Ok(Some(()))
            })
            .await
            .map_err(db_err)?
            .ok_or(StoreError::RunNotFound(id))
    }

    async fn requeue_expired_leases(&self) -> Result<u32, StoreError> {
        self.conn
            .call(move |conn| {
                let now = Utc::now();
                let expired: Vec<String> = conn
                    .prepare(
                        "SELECT id FROM runs
                         WHERE status = 'running' AND lease_expires_at < ?1",
                    )?
                    .query_map([ts(now)], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;

                let mut count = 0;
                for id_str in expired {
                    let id = Uuid::parse_str(&id_str).map_err(id_err)?;
                    if let Some(mut run) = load_run(conn, id)? {
                        run.status = RunStatus::Queued;
                        run.lease_expires_at = None;
                        run.worker_id = None;
                        run.updated_at = now;
                        save_run(conn, &run)?;
                        count += 1;
                    }
                }
                Ok(count)
            })
            .await
            .map_err(db_err)
    }

    async fn expire_schedule_timeouts(&self) -> Result<u32, StoreError> {
        self.conn
            .call(move |conn| {
                let now = Utc::now();
                let queued: Vec<String> = conn
                    .prepare(
                        "SELECT id FROM runs
                         WHERE status = 'queued' AND started_at IS NULL",
                    )?
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;

                let mut count = 0;
                for id_str in queued {
                    let id = Uuid::parse_str(&id_str).map_err(id_err)?;
                    let Some(mut run) = load_run(conn, id)? else {
                        continue;
                    };
                    if run.schedule_deadline() < now {
                        run.status = RunStatus::Failed;
                        run.error =
                            Some(RunError::timeout("schedule timeout exceeded before start"));
                        run.updated_at = now;
                        save_run(conn, &run)?;
                        count += 1;
                    }
                }
                Ok(count)
            })
            .await
            .map_err(db_err)
    }

    async fn list_children(&self, parent: Uuid) -> Result<Vec<TaskRun>, StoreError> {
        self.conn
            .call(move |conn| {
                let rows: Vec<String> = conn
                    .prepare(
                        "SELECT data FROM runs WHERE parent_run = ?1 ORDER BY created_at ASC",
                    )?
                    .query_map([parent.to_string()], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                rows.iter()
                    .map(|d| serde_json::from_str(d).map_err(json_err))
                    .collect()
            })
            .await
            .map_err(db_err)
    }

    async fn append_checkpoint(
        &self,
        run_id: Uuid,
        event: CheckpointEvent,
    ) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| {
                let data = serde_json::to_string(&event).map_err(json_err)?;
                let inserted = conn.execute(
                    "INSERT OR IGNORE INTO checkpoints (run_id, seq, data) VALUES (?1, ?2, ?3)",
                    params![run_id.to_string(), event.seq, data],
                )?;
                Ok(inserted == 1)
            })
            .await
            .map_err(db_err)
    }

    async fn read_checkpoints(&self, run_id: Uuid) -> Result<Vec<CheckpointEvent>, StoreError> {
        self.conn
            .call(move |conn| {
                let rows: Vec<String> = conn
                    .prepare(
                        "SELECT data FROM checkpoints WHERE run_id = ?1 ORDER BY seq ASC",
                    )?
                    .query_map([run_id.to_string()], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                rows.iter()
                    .map(|d| serde_json::from_str(d).map_err(json_err))
                    .collect()
            })
            .await
            .map_err(db_err)
    }

    async fn add_pending_op(&self, op: PendingOp) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let data = serde_json::to_string(&op).map_err(json_err)?;
                conn.execute(
                    "INSERT OR REPLACE INTO pending_ops (run_id, seq, data) VALUES (?1, ?2, ?3)",
                    params![op.run_id.to_string(), op.seq, data],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    async fn pending_ops(&self, run_id: Uuid) -> Result<Vec<PendingOp>, StoreError> {
        self.conn
            .call(move |conn| {
                let rows: Vec<String> = conn
                    .prepare(
                        "SELECT data FROM pending_ops WHERE run_id = ?1 ORDER BY seq ASC",
                    )?
                    .query_map([run_id.to_string()], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                rows.iter()
                    .map(|d| serde_json::from_str(d).map_err(json_err))
                    .collect()
            })
            .await
            .map_err(db_err)
    }

    async fn all_pending_ops(&self) -> Result<Vec<PendingOp>, StoreError> {
        self.conn
            .call(move |conn| {
                let rows: Vec<String> = conn
                    .prepare("SELECT data FROM pending_ops ORDER BY run_id, seq")?
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                rows.iter()
                    .map(|d| serde_json::from_str(d).map_err(json_err))
                    .collect()
            })
            .await
            .map_err(db_err)
    }

    async fn resolve_pending_op(
        &self,
        run_id: Uuid,
        seq: u32,
        outcome: serde_json::Value,
    ) -> Result<bool, StoreError> {
        self.conn
            .call(move |conn| resolve_op(conn, run_id, seq, outcome))
            .await
            .map_err(db_err)
    }

    async fn publish_event(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<u32, StoreError> {
        let name = name.to_string();
        let outcome = serde_json::to_value(ConditionOutcome::event(&name, payload))?;
        self.conn
            .call(move |conn| {
                let rows: Vec<String> = conn
                    .prepare("SELECT data FROM pending_ops")?
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;

                let mut woken = 0;
                for data in rows {
                    let op: PendingOp = serde_json::from_str(&data).map_err(json_err)?;
                    let subscribed = op.wake.leaves().iter().any(
                        |leaf| matches!(leaf, WakeCondition::Event { name: n, .. } if *n == name),
                    );
                    if subscribed && resolve_op(conn, op.run_id, op.seq, outcome.clone())? {
                        woken += 1;
                    }
                }
                debug!("published event '{}', woke {} runs", name, woken);
                Ok(woken)
            })
            .await
            .map_err(db_err)
    }

    async fn add_cron(&self, entry: CronEntry) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| {
                let data = serde_json::to_string(&entry).map_err(json_err)?;
                conn.execute(
                    "INSERT OR REPLACE INTO crons (name, next_fire_at, data) VALUES (?1, ?2, ?3)",
                    params![entry.name, ts(entry.next_fire_at), data],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    async fn cron_entries(&self) -> Result<Vec<CronEntry>, StoreError> {
        self.conn
            .call(move |conn| {
                let rows: Vec<String> = conn
                    .prepare("SELECT data FROM crons ORDER BY name ASC")?
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<_, _>>()?;
                rows.iter()
                    .map(|d| serde_json::from_str(d).map_err(json_err))
                    .collect()
            })
            .await
            .map_err(db_err)
    }

    async fn update_cron_next(&self, name: &str, next: DateTime<Utc>) -> Result<(), StoreError> {
        let name = name.to_string();
        let name_for_query = name.clone();
        self.conn
            .call(move |conn| {
                let data: Option<String> = conn
                    .query_row(
                        "SELECT data FROM crons WHERE name = ?1",
                        [&name_for_query],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(data) = data else {
                    return Ok(None);
                };
                let mut entry: CronEntry = serde_json::from_str(&data).map_err(json_err)?;
                entry.next_fire_at = next;
                let data = serde_json::to_string(&entry).map_err(json_err)?;
                conn.execute(
                    "INSERT OR REPLACE INTO crons (name, next_fire_at, data) VALUES (?1, ?2, ?3)",
                    params![entry.name, ts(entry.next_fire_at), data],
                )?;
                Ok(Some(()))
            })
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::Custom(format!("unknown cron schedule '{name}'")))
    }
}
