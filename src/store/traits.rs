//! Repository traits for the queue, server, thread, signal and log stores.
//!
//! Every compare-and-set the scheduler relies on is a single conditional
//! statement in the backing store; the returned `bool` reports whether the
//! update won.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::allocator::server::Server;
use crate::allocator::thread::Thread;
use crate::error::DatabaseError;
use crate::queue::model::{ConcurrencyGroup, ExitStatus, NewTask, RunStatus, Task};
use crate::signal::{NewSignal, Signal};

/// A diagnostic entry attached to a task.
#[derive(Debug, Clone)]
pub struct TaskLogEntry {
    pub id: i64,
    pub task_id: i64,
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a task. Returns its id.
    async fn insert_task(&self, task: &NewTask) -> Result<i64, DatabaseError>;

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError>;

    /// Tasks that may run at `now`, ordered for dispatch.
    ///
    /// Excludes complete, paused and sleeping tasks, tasks under a valid
    /// claim, tasks whose group is already full, and tasks whose resource
    /// is held by another active task. Tasks that already occupy a slot
    /// are never excluded by their group or resource.
    async fn list_runnable_tasks(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    /// Number of processing or waiting tasks per group.
    async fn count_active_by_group(&self) -> Result<HashMap<String, i64>, DatabaseError>;

    /// Claim a task if it is not validly claimed, its version matches and its
    /// group is below its limit (counting tasks other than this one).
    async fn claim_task(
        &self,
        id: i64,
        expected_version: i64,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, DatabaseError>;

    /// Give up a claim held by `worker_id`, leaving the task in `status`.
    async fn release_claim(
        &self,
        id: i64,
        worker_id: &str,
        status: RunStatus,
        wake_time: Option<DateTime<Utc>>,
    ) -> Result<bool, DatabaseError>;

    /// Set the start time if it has never been set.
    async fn mark_started(&self, id: i64, now: DateTime<Utc>) -> Result<(), DatabaseError>;

    async fn save_task_state(
        &self,
        id: i64,
        state: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Record the final outcome. No-op (returns false) if already complete.
    async fn complete_task(
        &self,
        id: i64,
        exit_status: ExitStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn set_paused(&self, id: i64, paused: bool) -> Result<bool, DatabaseError>;

    async fn set_terminating(&self, id: i64) -> Result<bool, DatabaseError>;

    async fn set_prioritized(&self, id: i64, prioritized: bool) -> Result<bool, DatabaseError>;

    /// Make a not-started or waiting task due immediately.
    async fn wake_task(&self, id: i64, now: DateTime<Utc>) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn upsert_group(&self, name: &str, max_concurrent: i64) -> Result<(), DatabaseError>;

    async fn get_group(&self, name: &str) -> Result<Option<ConcurrencyGroup>, DatabaseError>;

    async fn list_groups(&self) -> Result<Vec<ConcurrencyGroup>, DatabaseError>;
}

#[async_trait]
pub trait ServerStore: Send + Sync {
    /// Create a server or update its capacity.
    async fn upsert_server(&self, name: &str, total_threads: i64)
    -> Result<Server, DatabaseError>;

    async fn list_servers(&self) -> Result<Vec<Server>, DatabaseError>;

    async fn get_server(&self, id: i64) -> Result<Option<Server>, DatabaseError>;

    async fn remove_server(&self, name: &str) -> Result<bool, DatabaseError>;
}

#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Bind a running thread for `task_id` on `server_id` if the server has
    /// spare capacity. `None` means the slot was taken.
    async fn bind_thread(
        &self,
        server_id: i64,
        task_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<Thread>, DatabaseError>;

    /// The running thread bound to a task, if any.
    async fn thread_for_task(&self, task_id: i64) -> Result<Option<Thread>, DatabaseError>;

    /// Running thread count per server id.
    async fn running_counts(&self) -> Result<HashMap<i64, i64>, DatabaseError>;

    async fn update_process_data(
        &self,
        id: i64,
        data: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    async fn finish_thread(&self, id: i64, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    async fn delete_thread(&self, id: i64) -> Result<bool, DatabaseError>;

    async fn list_threads(&self) -> Result<Vec<Thread>, DatabaseError>;
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert_signal(
        &self,
        signal: &NewSignal,
        now: DateTime<Utc>,
    ) -> Result<Signal, DatabaseError>;

    async fn get_signal(&self, id: i64) -> Result<Option<Signal>, DatabaseError>;

    async fn get_signal_by_uuid(&self, uuid: Uuid) -> Result<Option<Signal>, DatabaseError>;

    /// Attach a delivered payload. False if the signal was already delivered.
    async fn record_delivery(
        &self,
        uuid: Uuid,
        data: &serde_json::Value,
        process_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Set the consumed time. False if it was already set.
    async fn consume_signal(&self, id: i64, now: DateTime<Utc>) -> Result<bool, DatabaseError>;

    /// Clear the consumed time so the signal is pending again.
    async fn restore_signal(&self, id: i64) -> Result<(), DatabaseError>;

    /// Delivered, unconsumed signals for a task, oldest first.
    async fn pending_signals(&self, object_id: i64) -> Result<Vec<Signal>, DatabaseError>;

    /// Record a process result once per process id. False if one exists.
    async fn record_process_result(
        &self,
        process_id: &str,
        task_id: i64,
        result: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    async fn get_process_result(
        &self,
        process_id: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;
}

#[async_trait]
pub trait TaskLogStore: Send + Sync {
    async fn append_task_log(
        &self,
        task_id: i64,
        level: &str,
        message: &str,
    ) -> Result<(), DatabaseError>;

    async fn list_task_logs(&self, task_id: i64) -> Result<Vec<TaskLogEntry>, DatabaseError>;

    /// Delete all entries for a task. Returns the number removed.
    async fn prune_task_logs(&self, task_id: i64) -> Result<usize, DatabaseError>;
}

/// All stores behind one handle.
#[async_trait]
pub trait Database:
    QueueStore + GroupStore + ServerStore + ThreadStore + SignalStore + TaskLogStore
{
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;
}
