//! libSQL backend: async store trait implementations.
//!
//! Supports local file and in-memory databases. Every compare-and-set the
//! scheduler depends on is one conditional statement, which SQLite executes
//! atomically.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::allocator::server::Server;
use crate::allocator::thread::{Thread, ThreadStatus};
use crate::error::DatabaseError;
use crate::queue::model::{ConcurrencyGroup, ExitStatus, NewTask, RunStatus, Task};
use crate::signal::{NewSignal, Signal, SignalType};
use crate::store::migrations;
use crate::store::traits::{
    Database, GroupStore, QueueStore, ServerStore, SignalStore, TaskLogEntry, TaskLogStore,
    ThreadStore,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_time(t: Option<DateTime<Utc>>) -> libsql::Value {
    opt_int(t.map(to_millis))
}

fn json_text(value: &serde_json::Value) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Parse stored JSON. Unparsable text is kept as a JSON string so the owner
/// can report it as corrupt instead of the row becoming unreadable.
fn parse_json(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw))
}

fn row_err(context: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

const TASK_COLUMNS: &str = "id, work_id, parent_id, name, group_name, priority, run_status, \
     exit_status, terminating, prioritized, paused, wake_time, created_at, start_time, \
     completed_time, claim_time, claimed_by, lease_ms, max_run_time_ms, exit_message, \
     resource_id, class_id, job_id, state, version";

/// Map a row selected with `TASK_COLUMNS` to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let err = row_err("task row");
    let run_status: String = row.get(6).map_err(&err)?;
    let exit_status: String = row.get(7).map_err(&err)?;

    Ok(Task {
        id: row.get(0).map_err(&err)?,
        work_id: row.get(1).map_err(&err)?,
        parent_id: row.get::<i64>(2).ok(),
        name: row.get(3).map_err(&err)?,
        group_name: row.get(4).map_err(&err)?,
        priority: row.get(5).map_err(&err)?,
        run_status: run_status
            .parse::<RunStatus>()
            .map_err(DatabaseError::Serialization)?,
        exit_status: exit_status
            .parse::<ExitStatus>()
            .map_err(DatabaseError::Serialization)?,
        terminating: row.get::<i64>(8).map_err(&err)? != 0,
        prioritized: row.get::<i64>(9).map_err(&err)? != 0,
        paused: row.get::<i64>(10).map_err(&err)? != 0,
        wake_time: row.get::<i64>(11).ok().map(from_millis),
        created_at: from_millis(row.get(12).map_err(&err)?),
        start_time: row.get::<i64>(13).ok().map(from_millis),
        completed_time: row.get::<i64>(14).ok().map(from_millis),
        claim_time: row.get::<i64>(15).ok().map(from_millis),
        claimed_by: row.get::<String>(16).ok(),
        lease: Duration::from_millis(row.get::<i64>(17).map_err(&err)?.max(0) as u64),
        max_run_time: row
            .get::<i64>(18)
            .ok()
            .map(|ms| Duration::from_millis(ms.max(0) as u64)),
        exit_message: row.get(19).map_err(&err)?,
        resource_id: row.get::<String>(20).ok(),
        class_id: row.get(21).map_err(&err)?,
        job_id: row.get::<String>(22).ok(),
        state: parse_json(row.get(23).map_err(&err)?),
        version: row.get(24).map_err(&err)?,
    })
}

const SERVER_COLUMNS: &str = "id, name, total_threads, created_at";

fn row_to_server(row: &libsql::Row) -> Result<Server, DatabaseError> {
    let err = row_err("server row");
    Ok(Server {
        id: row.get(0).map_err(&err)?,
        name: row.get(1).map_err(&err)?,
        total_threads: row.get(2).map_err(&err)?,
        created_at: from_millis(row.get(3).map_err(&err)?),
    })
}

const THREAD_COLUMNS: &str =
    "id, server_id, task_id, status, created_at, completed_at, process_data";

fn row_to_thread(row: &libsql::Row) -> Result<Thread, DatabaseError> {
    let err = row_err("thread row");
    let status: String = row.get(3).map_err(&err)?;
    Ok(Thread {
        id: row.get(0).map_err(&err)?,
        server_id: row.get(1).map_err(&err)?,
        task_id: row.get(2).map_err(&err)?,
        status: status
            .parse::<ThreadStatus>()
            .map_err(DatabaseError::Serialization)?,
        created_at: from_millis(row.get(4).map_err(&err)?),
        completed_at: row.get::<i64>(5).ok().map(from_millis),
        process_data: parse_json(row.get(6).map_err(&err)?),
    })
}

const SIGNAL_COLUMNS: &str =
    "id, uuid, object_id, signal_type, sent_time, consumed_time, process_id, data";

fn row_to_signal(row: &libsql::Row) -> Result<Signal, DatabaseError> {
    let err = row_err("signal row");
    let uuid: String = row.get(1).map_err(&err)?;
    let signal_type: String = row.get(3).map_err(&err)?;
    Ok(Signal {
        id: row.get(0).map_err(&err)?,
        uuid: Uuid::parse_str(&uuid).map_err(|e| DatabaseError::Serialization(e.to_string()))?,
        object_id: row.get(2).map_err(&err)?,
        signal_type: signal_type
            .parse::<SignalType>()
            .map_err(DatabaseError::Serialization)?,
        sent_time: row.get::<i64>(4).ok().map(from_millis),
        consumed_time: row.get::<i64>(5).ok().map(from_millis),
        process_id: row.get::<String>(6).ok(),
        data: parse_json(row.get(7).map_err(&err)?),
    })
}

impl LibSqlBackend {
    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self.conn().query(sql, params).await.map_err(row_err(context))?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err(context))? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn query_threads(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<Thread>, DatabaseError> {
        let mut rows = self.conn().query(sql, params).await.map_err(row_err(context))?;
        let mut threads = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err(context))? {
            threads.push(row_to_thread(&row)?);
        }
        Ok(threads)
    }

    async fn query_signals(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<Vec<Signal>, DatabaseError> {
        let mut rows = self.conn().query(sql, params).await.map_err(row_err(context))?;
        let mut signals = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err(context))? {
            signals.push(row_to_signal(&row)?);
        }
        Ok(signals)
    }

    async fn execute(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        context: &str,
    ) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(sql, params)
            .await
            .map_err(row_err(context))
    }
}

// ── Queue ───────────────────────────────────────────────────────────

#[async_trait]
impl QueueStore for LibSqlBackend {
    async fn insert_task(&self, task: &NewTask) -> Result<i64, DatabaseError> {
        let now = to_millis(Utc::now());
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO tasks (work_id, parent_id, name, group_name, priority, prioritized, \
                 wake_time, created_at, lease_ms, max_run_time_ms, resource_id, class_id, job_id, state) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14) RETURNING id",
                params![
                    task.work_id.as_str(),
                    opt_int(task.parent_id),
                    task.name.as_str(),
                    task.group_name.as_str(),
                    task.priority,
                    task.prioritized as i64,
                    opt_time(task.wake_time),
                    now,
                    duration_ms(task.lease),
                    opt_int(task.max_run_time.map(duration_ms)),
                    opt_text(task.resource_id.as_deref()),
                    task.class_id.as_str(),
                    opt_text(task.job_id.as_deref()),
                    json_text(&task.state)?,
                ],
            )
            .await
            .map_err(row_err("insert_task"))?;

        let row = rows
            .next()
            .await
            .map_err(row_err("insert_task"))?
            .ok_or_else(|| DatabaseError::Query("insert_task returned no id".into()))?;
        let id: i64 = row.get(0).map_err(row_err("insert_task id"))?;

        debug!(task_id = id, name = %task.name, group = %task.group_name, "Task inserted");
        Ok(id)
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
                "get_task",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn list_runnable_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks t \
             WHERE t.run_status != 'complete' \
               AND t.paused = 0 \
               AND (t.wake_time IS NULL OR t.wake_time <= ?1) \
               AND NOT (t.run_status = 'processing' AND t.claim_expires > ?1) \
               AND (t.run_status IN ('processing', 'waiting') OR NOT EXISTS ( \
                    SELECT 1 FROM concurrency_groups g WHERE g.name = t.group_name \
                      AND (SELECT COUNT(*) FROM tasks o WHERE o.group_name = g.name \
                             AND o.id != t.id \
                             AND o.run_status IN ('processing', 'waiting')) >= g.max_concurrent)) \
               AND (t.resource_id IS NULL OR t.run_status IN ('processing', 'waiting') OR NOT EXISTS ( \
                    SELECT 1 FROM tasks o WHERE o.resource_id = t.resource_id AND o.id != t.id \
                      AND o.run_status IN ('processing', 'waiting'))) \
             ORDER BY (t.terminating = 1 AND t.prioritized = 0) ASC, \
                      t.priority ASC, t.created_at ASC, t.id ASC \
             LIMIT ?2"
        );
        self.query_tasks(
            &sql,
            params![to_millis(now), i64::try_from(limit).unwrap_or(i64::MAX)],
            "list_runnable_tasks",
        )
        .await
    }

    async fn count_active_by_group(&self) -> Result<HashMap<String, i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT group_name, COUNT(*) FROM tasks \
                 WHERE run_status IN ('processing', 'waiting') GROUP BY group_name",
                (),
            )
            .await
            .map_err(row_err("count_active_by_group"))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await.map_err(row_err("count_active_by_group"))? {
            let group: String = row.get(0).map_err(row_err("count_active_by_group"))?;
            let count: i64 = row.get(1).map_err(row_err("count_active_by_group"))?;
            counts.insert(group, count);
        }
        Ok(counts)
    }

    async fn claim_task(
        &self,
        id: i64,
        expected_version: i64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, DatabaseError> {
        let now_ms = to_millis(now);
        let changed = self
            .execute(
                "UPDATE tasks SET run_status = 'processing', claim_time = ?3, claim_expires = ?4, \
                     claimed_by = ?5, version = version + 1 \
                 WHERE id = ?1 AND version = ?2 \
                   AND run_status != 'complete' AND paused = 0 \
                   AND NOT (run_status = 'processing' AND claim_expires > ?3) \
                   AND (run_status IN ('processing', 'waiting') OR NOT EXISTS ( \
                        SELECT 1 FROM concurrency_groups g WHERE g.name = tasks.group_name \
                          AND (SELECT COUNT(*) FROM tasks o WHERE o.group_name = g.name \
                                 AND o.id != tasks.id \
                                 AND o.run_status IN ('processing', 'waiting')) >= g.max_concurrent)) \
                   AND (resource_id IS NULL OR run_status IN ('processing', 'waiting') OR NOT EXISTS ( \
                        SELECT 1 FROM tasks o WHERE o.resource_id = tasks.resource_id \
                          AND o.id != tasks.id AND o.run_status IN ('processing', 'waiting')))",
                params![
                    id,
                    expected_version,
                    now_ms,
                    now_ms.saturating_add(duration_ms(lease)),
                    worker_id,
                ],
                "claim_task",
            )
            .await?;

        debug!(task_id = id, worker = worker_id, won = changed > 0, "Claim attempted");
        Ok(changed > 0)
    }

    async fn release_claim(
        &self,
        id: i64,
        worker_id: &str,
        status: RunStatus,
        wake_time: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE tasks SET run_status = ?3, wake_time = ?4, claim_time = NULL, \
                     claim_expires = NULL, claimed_by = NULL, version = version + 1 \
                 WHERE id = ?1 AND claimed_by = ?2 AND run_status = 'processing'",
                params![id, worker_id, status.as_str(), opt_time(wake_time)],
                "release_claim",
            )
            .await?;
        Ok(changed > 0)
    }

    async fn mark_started(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError> {
        self.execute(
            "UPDATE tasks SET start_time = ?2 WHERE id = ?1 AND start_time IS NULL",
            params![id, to_millis(now)],
            "mark_started",
        )
        .await?;
        Ok(())
    }

    async fn save_task_state(
        &self,
        id: i64,
        state: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "UPDATE tasks SET state = ?2 WHERE id = ?1",
            params![id, json_text(state)?],
            "save_task_state",
        )
        .await?;
        Ok(())
    }

    async fn complete_task(
        &self,
        id: i64,
        exit_status: ExitStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE tasks SET run_status = 'complete', exit_status = ?2, exit_message = ?3, \
                     completed_time = ?4, claim_time = NULL, claim_expires = NULL, \
                     claimed_by = NULL, version = version + 1 \
                 WHERE id = ?1 AND run_status != 'complete'",
                params![id, exit_status.as_str(), message, to_millis(now)],
                "complete_task",
            )
            .await?;

        debug!(task_id = id, exit_status = %exit_status, "Task completed in DB");
        Ok(changed > 0)
    }

    async fn set_paused(&self, id: i64, paused: bool) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE tasks SET paused = ?2 WHERE id = ?1 AND run_status != 'complete'",
                params![id, paused as i64],
                "set_paused",
            )
            .await?;
        Ok(changed > 0)
    }

    async fn set_terminating(&self, id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE tasks SET terminating = 1 WHERE id = ?1 AND run_status != 'complete'",
                params![id],
                "set_terminating",
            )
            .await?;
        Ok(changed > 0)
    }

    async fn set_prioritized(&self, id: i64, prioritized: bool) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE tasks SET prioritized = ?2 WHERE id = ?1 AND run_status != 'complete'",
                params![id, prioritized as i64],
                "set_prioritized",
            )
            .await?;
        Ok(changed > 0)
    }

    async fn wake_task(&self, id: i64, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE tasks SET wake_time = ?2 \
                 WHERE id = ?1 AND run_status IN ('not_started', 'waiting')",
                params![id, to_millis(now)],
                "wake_task",
            )
            .await?;
        Ok(changed > 0)
    }
}

// ── Groups ──────────────────────────────────────────────────────────

#[async_trait]
impl GroupStore for LibSqlBackend {
    async fn upsert_group(&self, name: &str, max_concurrent: i64) -> Result<(), DatabaseError> {
        self.execute(
            "INSERT INTO concurrency_groups (name, max_concurrent) VALUES (?1, ?2) \
             ON CONFLICT(name) DO UPDATE SET max_concurrent = excluded.max_concurrent",
            params![name, max_concurrent],
            "upsert_group",
        )
        .await?;
        Ok(())
    }

    async fn get_group(&self, name: &str) -> Result<Option<ConcurrencyGroup>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name, max_concurrent FROM concurrency_groups WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(row_err("get_group"))?;

        match rows.next().await.map_err(row_err("get_group"))? {
            Some(row) => Ok(Some(ConcurrencyGroup {
                name: row.get(0).map_err(row_err("get_group"))?,
                max_concurrent: row.get(1).map_err(row_err("get_group"))?,
            })),
            None => Ok(None),
        }
    }

    async fn list_groups(&self) -> Result<Vec<ConcurrencyGroup>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name, max_concurrent FROM concurrency_groups ORDER BY name",
                (),
            )
            .await
            .map_err(row_err("list_groups"))?;

        let mut groups = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_groups"))? {
            groups.push(ConcurrencyGroup {
                name: row.get(0).map_err(row_err("list_groups"))?,
                max_concurrent: row.get(1).map_err(row_err("list_groups"))?,
            });
        }
        Ok(groups)
    }
}

// ── Servers ─────────────────────────────────────────────────────────

#[async_trait]
impl ServerStore for LibSqlBackend {
    async fn upsert_server(
        &self,
        name: &str,
        total_threads: i64,
    ) -> Result<Server, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "INSERT INTO servers (name, total_threads, created_at) VALUES (?1, ?2, ?3) \
                     ON CONFLICT(name) DO UPDATE SET total_threads = excluded.total_threads \
                     RETURNING {SERVER_COLUMNS}"
                ),
                params![name, total_threads, to_millis(Utc::now())],
            )
            .await
            .map_err(row_err("upsert_server"))?;

        let row = rows
            .next()
            .await
            .map_err(row_err("upsert_server"))?
            .ok_or_else(|| DatabaseError::Query("upsert_server returned no row".into()))?;
        let server = row_to_server(&row)?;

        info!(server = %server.name, threads = server.total_threads, "Server registered");
        Ok(server)
    }

    async fn list_servers(&self) -> Result<Vec<Server>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(&format!("SELECT {SERVER_COLUMNS} FROM servers ORDER BY id"), ())
            .await
            .map_err(row_err("list_servers"))?;

        let mut servers = Vec::new();
        while let Some(row) = rows.next().await.map_err(row_err("list_servers"))? {
            servers.push(row_to_server(&row)?);
        }
        Ok(servers)
    }

    async fn get_server(&self, id: i64) -> Result<Option<Server>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(row_err("get_server"))?;

        match rows.next().await.map_err(row_err("get_server"))? {
            Some(row) => Ok(Some(row_to_server(&row)?)),
            None => Ok(None),
        }
    }

    async fn remove_server(&self, name: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "DELETE FROM servers WHERE name = ?1",
                params![name],
                "remove_server",
            )
            .await?;
        Ok(changed > 0)
    }
}

// ── Threads ─────────────────────────────────────────────────────────

#[async_trait]
impl ThreadStore for LibSqlBackend {
    async fn bind_thread(
        &self,
        server_id: i64,
        task_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Thread>, DatabaseError> {
        let sql = format!(
            "INSERT INTO threads (server_id, task_id, status, created_at, process_data) \
             SELECT ?1, ?2, 'running', ?3, 'null' \
             WHERE (SELECT COUNT(*) FROM threads WHERE server_id = ?1 AND status = 'running') \
                 < (SELECT total_threads FROM servers WHERE id = ?1) \
             RETURNING {THREAD_COLUMNS}"
        );

        let result = self
            .query_threads(&sql, params![server_id, task_id, to_millis(now)], "bind_thread")
            .await;

        match result {
            Ok(mut threads) => Ok(threads.pop()),
            // A running thread already exists for this task.
            Err(DatabaseError::Query(msg)) if msg.contains("UNIQUE constraint failed") => {
                debug!(task_id, "Task already bound to a running thread");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn thread_for_task(&self, task_id: i64) -> Result<Option<Thread>, DatabaseError> {
        let mut threads = self
            .query_threads(
                &format!(
                    "SELECT {THREAD_COLUMNS} FROM threads \
                     WHERE task_id = ?1 AND status = 'running' LIMIT 1"
                ),
                params![task_id],
                "thread_for_task",
            )
            .await?;
        Ok(threads.pop())
    }

    async fn running_counts(&self) -> Result<HashMap<i64, i64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT server_id, COUNT(*) FROM threads WHERE status = 'running' GROUP BY server_id",
                (),
            )
            .await
            .map_err(row_err("running_counts"))?;

        let mut counts = HashMap::new();
        while let Some(row) = rows.next().await.map_err(row_err("running_counts"))? {
            let server_id: i64 = row.get(0).map_err(row_err("running_counts"))?;
            let count: i64 = row.get(1).map_err(row_err("running_counts"))?;
            counts.insert(server_id, count);
        }
        Ok(counts)
    }

    async fn update_process_data(
        &self,
        id: i64,
        data: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "UPDATE threads SET process_data = ?2 WHERE id = ?1",
            params![id, json_text(data)?],
            "update_process_data",
        )
        .await?;
        Ok(())
    }

    async fn finish_thread(&self, id: i64, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE threads SET status = 'finished', completed_at = ?2 \
                 WHERE id = ?1 AND status = 'running'",
                params![id, to_millis(now)],
                "finish_thread",
            )
            .await?;
        Ok(changed > 0)
    }

    async fn delete_thread(&self, id: i64) -> Result<bool, DatabaseError> {
        let changed = self
            .execute("DELETE FROM threads WHERE id = ?1", params![id], "delete_thread")
            .await?;
        Ok(changed > 0)
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, DatabaseError> {
        self.query_threads(
            &format!("SELECT {THREAD_COLUMNS} FROM threads ORDER BY id"),
            (),
            "list_threads",
        )
        .await
    }
}

// ── Signals ─────────────────────────────────────────────────────────

#[async_trait]
impl SignalStore for LibSqlBackend {
    async fn insert_signal(
        &self,
        signal: &NewSignal,
        now: DateTime<Utc>,
    ) -> Result<Signal, DatabaseError> {
        let sent_time = signal.sent.then(|| to_millis(now));
        let mut signals = self
            .query_signals(
                &format!(
                    "INSERT INTO signals (uuid, object_id, signal_type, sent_time, process_id, data) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING {SIGNAL_COLUMNS}"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    signal.object_id,
                    signal.signal_type.as_str(),
                    opt_int(sent_time),
                    opt_text(signal.process_id.as_deref()),
                    json_text(&signal.data)?,
                ],
                "insert_signal",
            )
            .await?;

        signals
            .pop()
            .ok_or_else(|| DatabaseError::Query("insert_signal returned no row".into()))
    }

    async fn get_signal(&self, id: i64) -> Result<Option<Signal>, DatabaseError> {
        let mut signals = self
            .query_signals(
                &format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = ?1"),
                params![id],
                "get_signal",
            )
            .await?;
        Ok(signals.pop())
    }

    async fn get_signal_by_uuid(&self, uuid: Uuid) -> Result<Option<Signal>, DatabaseError> {
        let mut signals = self
            .query_signals(
                &format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE uuid = ?1"),
                params![uuid.to_string()],
                "get_signal_by_uuid",
            )
            .await?;
        Ok(signals.pop())
    }

    async fn record_delivery(
        &self,
        uuid: Uuid,
        data: &serde_json::Value,
        process_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE signals SET data = ?2, process_id = ?3, sent_time = ?4 \
                 WHERE uuid = ?1 AND sent_time IS NULL",
                params![
                    uuid.to_string(),
                    json_text(data)?,
                    opt_text(process_id),
                    to_millis(now),
                ],
                "record_delivery",
            )
            .await?;
        Ok(changed > 0)
    }

    async fn consume_signal(&self, id: i64, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "UPDATE signals SET consumed_time = ?2 WHERE id = ?1 AND consumed_time IS NULL",
                params![id, to_millis(now)],
                "consume_signal",
            )
            .await?;
        Ok(changed > 0)
    }

    async fn restore_signal(&self, id: i64) -> Result<(), DatabaseError> {
        self.execute(
            "UPDATE signals SET consumed_time = NULL WHERE id = ?1",
            params![id],
            "restore_signal",
        )
        .await?;
        Ok(())
    }

    async fn pending_signals(&self, object_id: i64) -> Result<Vec<Signal>, DatabaseError> {
        self.query_signals(
            &format!(
                "SELECT {SIGNAL_COLUMNS} FROM signals \
                 WHERE object_id = ?1 AND sent_time IS NOT NULL AND consumed_time IS NULL \
                 ORDER BY id"
            ),
            params![object_id],
            "pending_signals",
        )
        .await
    }

    async fn record_process_result(
        &self,
        process_id: &str,
        task_id: i64,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let changed = self
            .execute(
                "INSERT OR IGNORE INTO process_results (process_id, task_id, result, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![process_id, task_id, json_text(result)?, to_millis(now)],
                "record_process_result",
            )
            .await?;
        Ok(changed > 0)
    }

    async fn get_process_result(
        &self,
        process_id: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT result FROM process_results WHERE process_id = ?1",
                params![process_id],
            )
            .await
            .map_err(row_err("get_process_result"))?;

        match rows.next().await.map_err(row_err("get_process_result"))? {
            Some(row) => {
                let raw: String = row.get(0).map_err(row_err("get_process_result"))?;
                Ok(Some(parse_json(raw)))
            }
            None => Ok(None),
        }
    }
}

// ── Task logs ───────────────────────────────────────────────────────

#[async_trait]
impl TaskLogStore for LibSqlBackend {
    async fn append_task_log(
        &self,
        task_id: i64,
        level: &str,
        message: &str,
    ) -> Result<(), DatabaseError> {
        self.execute(
            "INSERT INTO task_logs (task_id, level, message, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![task_id, level, message, to_millis(Utc::now())],
            "append_task_log",
        )
        .await?;
        Ok(())
    }

    async fn list_task_logs(&self, task_id: i64) -> Result<Vec<TaskLogEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, task_id, level, message, created_at FROM task_logs \
                 WHERE task_id = ?1 ORDER BY id",
                params![task_id],
            )
            .await
            .map_err(row_err("list_task_logs"))?;

        let err = row_err("list_task_logs");
        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(&err)? {
            entries.push(TaskLogEntry {
                id: row.get(0).map_err(&err)?,
                task_id: row.get(1).map_err(&err)?,
                level: row.get(2).map_err(&err)?,
                message: row.get(3).map_err(&err)?,
                created_at: from_millis(row.get(4).map_err(&err)?),
            });
        }
        Ok(entries)
    }

    async fn prune_task_logs(&self, task_id: i64) -> Result<usize, DatabaseError> {
        let removed = self
            .execute(
                "DELETE FROM task_logs WHERE task_id = ?1",
                params![task_id],
                "prune_task_logs",
            )
            .await?;
        Ok(removed as usize)
    }
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }
}
