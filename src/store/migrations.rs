//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.
//!
//! All timestamps are INTEGER epoch milliseconds so that lease arithmetic
//! can happen inside a single conditional statement.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "queue_and_slots",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_id TEXT NOT NULL,
                parent_id INTEGER,
                name TEXT NOT NULL,
                group_name TEXT NOT NULL DEFAULT 'default',
                priority INTEGER NOT NULL DEFAULT 100,
                run_status TEXT NOT NULL DEFAULT 'not_started',
                exit_status TEXT NOT NULL DEFAULT 'not-finished',
                terminating INTEGER NOT NULL DEFAULT 0,
                prioritized INTEGER NOT NULL DEFAULT 0,
                paused INTEGER NOT NULL DEFAULT 0,
                wake_time INTEGER,
                created_at INTEGER NOT NULL,
                start_time INTEGER,
                completed_time INTEGER,
                claim_time INTEGER,
                claim_expires INTEGER,
                claimed_by TEXT,
                lease_ms INTEGER NOT NULL,
                max_run_time_ms INTEGER,
                exit_message TEXT NOT NULL DEFAULT '',
                resource_id TEXT,
                class_id TEXT NOT NULL,
                job_id TEXT,
                state TEXT NOT NULL DEFAULT 'null',
                version INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_run_status ON tasks(run_status);
            CREATE INDEX IF NOT EXISTS idx_tasks_group ON tasks(group_name, run_status);
            CREATE INDEX IF NOT EXISTS idx_tasks_work_id ON tasks(work_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_resource ON tasks(resource_id);

            CREATE TABLE IF NOT EXISTS concurrency_groups (
                name TEXT PRIMARY KEY,
                max_concurrent INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS servers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                total_threads INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                server_id INTEGER NOT NULL REFERENCES servers(id),
                task_id INTEGER NOT NULL REFERENCES tasks(id),
                status TEXT NOT NULL DEFAULT 'running',
                created_at INTEGER NOT NULL,
                completed_at INTEGER,
                process_data TEXT NOT NULL DEFAULT 'null'
            );
            CREATE INDEX IF NOT EXISTS idx_threads_server ON threads(server_id, status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_threads_running_task
                ON threads(task_id) WHERE status = 'running';
        "#,
    },
    Migration {
        version: 2,
        name: "signals_and_logs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS signals (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uuid TEXT NOT NULL UNIQUE,
                object_id INTEGER NOT NULL,
                signal_type TEXT NOT NULL,
                sent_time INTEGER,
                consumed_time INTEGER,
                process_id TEXT,
                data TEXT NOT NULL DEFAULT 'null'
            );
            CREATE INDEX IF NOT EXISTS idx_signals_object ON signals(object_id, consumed_time);
            CREATE INDEX IF NOT EXISTS idx_signals_process ON signals(process_id);

            CREATE TABLE IF NOT EXISTS process_results (
                process_id TEXT PRIMARY KEY,
                task_id INTEGER NOT NULL,
                result TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS task_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_task_logs_task ON task_logs(task_id);
        "#,
    },
];

/// Create the migrations table and apply every pending migration.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "tasks",
            "concurrency_groups",
            "servers",
            "threads",
            "signals",
            "process_results",
            "task_logs",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn migrations_run_on_a_spawned_task() {
        let conn = test_conn().await;
        let handle = tokio::spawn(async move { run_migrations(&conn).await });
        handle.await.unwrap().unwrap();
    }
}
