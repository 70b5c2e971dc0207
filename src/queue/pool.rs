//! WipPool: the task queue.
//!
//! Selection applies priority, wake time, pause, group limits and resource
//! exclusivity. Claims are conditional updates in the store; losing a claim
//! race is not an error.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::error::{QueueError, Result};
use crate::queue::model::{ExitStatus, NewTask, RunStatus, Task};
use crate::signal::kinds::{DomainSignal, WipCompleteSignal};
use crate::signal::{NewSignal, SignalType};
use crate::store::Database;

/// Rows fetched per requested task, to leave room for the in-batch group
/// and resource checks.
const OVERFETCH: usize = 4;

#[derive(Clone)]
pub struct WipPool {
    db: Arc<dyn Database>,
}

impl WipPool {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Add a task to the queue. Returns its id.
    pub async fn enqueue(&self, task: NewTask) -> Result<i64> {
        let id = self.db.insert_task(&task).await?;
        info!(task_id = id, name = %task.name, class = %task.class_id, "Task enqueued");
        Ok(id)
    }

    /// Load a task, failing with `NoTask` if it does not exist.
    pub async fn get(&self, id: i64) -> Result<Task> {
        self.db
            .get_task(id)
            .await?
            .ok_or_else(|| QueueError::NoTask(Some(id)).into())
    }

    /// Set (or change) the concurrency limit of a group.
    pub async fn set_group_limit(&self, group: &str, max_concurrent: i64) -> Result<()> {
        self.db.upsert_group(group, max_concurrent).await?;
        info!(group, max_concurrent, "Concurrency group configured");
        Ok(())
    }

    /// Next tasks to dispatch, in priority order.
    ///
    /// The store drops tasks whose group is already full. Tasks admitted in
    /// this batch count against their group too, so the batch never pushes a
    /// group past its limit. Tasks that already occupy a slot (waiting, or
    /// processing under an expired lease) are never filtered by their group.
    /// Only one task per resource is admitted.
    pub async fn next_eligible(&self, limit: usize) -> Result<Vec<Task>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let candidates = self
            .db
            .list_runnable_tasks(now, limit.saturating_mul(OVERFETCH))
            .await?;
        let limits: HashMap<String, i64> = self
            .db
            .list_groups()
            .await?
            .into_iter()
            .map(|g| (g.name, g.max_concurrent))
            .collect();
        let mut active = self.db.count_active_by_group().await?;
        let mut resources: HashSet<String> = HashSet::new();

        let mut eligible = Vec::with_capacity(limit);
        for task in candidates {
            if eligible.len() >= limit {
                break;
            }

            if task.run_status.is_active() {
                if let Some(resource) = &task.resource_id {
                    resources.insert(resource.clone());
                }
                eligible.push(task);
                continue;
            }

            if let Some(max) = limits.get(&task.group_name) {
                let running = active.get(&task.group_name).copied().unwrap_or(0);
                if running >= *max {
                    debug!(task_id = task.id, group = %task.group_name, max, "Group at limit");
                    continue;
                }
            }
            if let Some(resource) = &task.resource_id {
                if !resources.insert(resource.clone()) {
                    continue;
                }
            }

            *active.entry(task.group_name.clone()).or_insert(0) += 1;
            eligible.push(task);
        }

        Ok(eligible)
    }

    /// Try to claim a task for `worker_id`.
    ///
    /// `false` means another worker won, the group filled up, or the task
    /// changed since it was read; the caller should move on.
    pub async fn claim(&self, task: &Task, worker_id: &str, lease: Duration) -> Result<bool> {
        let won = self
            .db
            .claim_task(task.id, task.version, worker_id, Utc::now(), lease)
            .await?;
        if !won {
            debug!(task_id = task.id, worker = worker_id, "Claim lost");
        }
        Ok(won)
    }

    /// Release a claim without completing the task.
    pub async fn release(
        &self,
        id: i64,
        worker_id: &str,
        status: RunStatus,
        wake_time: Option<chrono::DateTime<Utc>>,
    ) -> Result<bool> {
        Ok(self
            .db
            .release_claim(id, worker_id, status, wake_time)
            .await?)
    }

    /// Record the final outcome and notify the parent task, if any.
    ///
    /// Returns `false` if the task was already complete.
    pub async fn complete(&self, id: i64, exit_status: ExitStatus, message: &str) -> Result<bool> {
        let won = self
            .db
            .complete_task(id, exit_status, message, Utc::now())
            .await?;
        if !won {
            debug!(task_id = id, "Task already complete");
            return Ok(false);
        }

        info!(task_id = id, exit_status = %exit_status, "Task complete");

        let task = self.get(id).await?;
        if let Some(parent_id) = task.parent_id {
            self.notify_parent(parent_id, id, exit_status, message).await?;
        }
        Ok(true)
    }

    async fn notify_parent(
        &self,
        parent_id: i64,
        child_id: i64,
        exit_status: ExitStatus,
        message: &str,
    ) -> Result<()> {
        let domain = DomainSignal::WipComplete(WipCompleteSignal {
            completed_wip_id: child_id,
            exit_status: Some(exit_status),
            message: (!message.is_empty()).then(|| message.to_string()),
        });
        self.db
            .insert_signal(
                &NewSignal {
                    object_id: parent_id,
                    signal_type: SignalType::Complete,
                    process_id: Some(domain.process_key()),
                    data: domain.to_object(),
                    sent: true,
                },
                Utc::now(),
            )
            .await?;
        self.db.wake_task(parent_id, Utc::now()).await?;

        debug!(parent_id, child_id, "Parent notified of child completion");
        Ok(())
    }

    /// Make a sleeping task due now.
    pub async fn wake(&self, id: i64) -> Result<bool> {
        Ok(self.db.wake_task(id, Utc::now()).await?)
    }

    pub async fn pause(&self, id: i64) -> Result<bool> {
        let changed = self.db.set_paused(id, true).await?;
        if changed {
            info!(task_id = id, "Task paused");
        }
        Ok(changed)
    }

    pub async fn resume(&self, id: i64) -> Result<bool> {
        let changed = self.db.set_paused(id, false).await?;
        if changed {
            self.db.wake_task(id, Utc::now()).await?;
            info!(task_id = id, "Task resumed");
        }
        Ok(changed)
    }

    /// Ask a task to stop. The workflow sees a `terminate` signal on its
    /// next step; the task is deferred behind non-terminating work unless
    /// prioritized.
    pub async fn terminate(&self, id: i64) -> Result<bool> {
        if !self.db.set_terminating(id).await? {
            return Ok(false);
        }
        self.db
            .insert_signal(
                &NewSignal {
                    object_id: id,
                    signal_type: SignalType::Terminate,
                    process_id: None,
                    data: json!({}),
                    sent: true,
                },
                Utc::now(),
            )
            .await?;
        self.db.wake_task(id, Utc::now()).await?;
        info!(task_id = id, "Task terminating");
        Ok(true)
    }

    pub async fn prioritize(&self, id: i64) -> Result<bool> {
        let changed = self.db.set_prioritized(id, true).await?;
        if changed {
            info!(task_id = id, "Task prioritized");
        }
        Ok(changed)
    }

    /// Complete a task as `error-system` without running it, release its
    /// thread and keep a diagnostic entry.
    pub async fn force_fail(&self, id: i64, message: &str) -> Result<bool> {
        self.force_complete(id, ExitStatus::ErrorSystem, message).await
    }

    /// Complete a task with `exit_status` outside the worker loop.
    pub(crate) async fn force_complete(
        &self,
        id: i64,
        exit_status: ExitStatus,
        message: &str,
    ) -> Result<bool> {
        let diagnostic = format!("task {id} forced to {exit_status}: {message}");
        if let Err(e) = self.db.append_task_log(id, "error", &diagnostic).await {
            warn!(task_id = id, error = %e, "Failed to record diagnostic");
        }
        error!(task_id = id, exit_status = %exit_status, message, "Task force-completed");

        let won = self.complete(id, exit_status, message).await?;
        if let Some(thread) = self.db.thread_for_task(id).await? {
            self.db.finish_thread(thread.id, Utc::now()).await?;
        }
        Ok(won)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::kinds::DomainSignal;
    use crate::store::LibSqlBackend;

    async fn pool() -> WipPool {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        WipPool::new(db)
    }

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn group_limit_filters_selection() {
        let pool = pool().await;
        pool.set_group_limit("render", 1).await.unwrap();
        let a = pool.enqueue(NewTask::new("a", "c").with_group("render")).await.unwrap();
        let _b = pool.enqueue(NewTask::new("b", "c").with_group("render")).await.unwrap();
        let c = pool.enqueue(NewTask::new("c", "c")).await.unwrap();

        let ids: Vec<i64> = pool.next_eligible(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a, c]);

        let task = pool.get(a).await.unwrap();
        assert!(pool.claim(&task, "w1", LEASE).await.unwrap());

        // With `a` active the group is full; `a` itself is claimed and hidden.
        let ids: Vec<i64> = pool.next_eligible(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![c]);
    }

    #[tokio::test]
    async fn full_group_does_not_starve_lower_priority_work() {
        let pool = pool().await;
        pool.set_group_limit("render", 1).await.unwrap();
        let held = pool.enqueue(NewTask::new("held", "c").with_group("render")).await.unwrap();
        let task = pool.get(held).await.unwrap();
        assert!(pool.claim(&task, "w1", LEASE).await.unwrap());
        for i in 0..8 {
            pool.enqueue(NewTask::new(format!("r{i}"), "c").with_group("render").with_priority(1))
                .await
                .unwrap();
        }
        let other = pool.enqueue(NewTask::new("other", "c").with_priority(50)).await.unwrap();

        let ids: Vec<i64> = pool.next_eligible(1).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![other]);
    }

    #[tokio::test]
    async fn waiting_task_is_not_blocked_by_its_own_group() {
        let pool = pool().await;
        pool.set_group_limit("render", 1).await.unwrap();
        let a = pool.enqueue(NewTask::new("a", "c").with_group("render")).await.unwrap();
        pool.enqueue(NewTask::new("b", "c").with_group("render")).await.unwrap();

        let task = pool.get(a).await.unwrap();
        assert!(pool.claim(&task, "w1", LEASE).await.unwrap());
        assert!(pool.release(a, "w1", RunStatus::Waiting, None).await.unwrap());

        let ids: Vec<i64> = pool.next_eligible(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a]);
    }

    #[tokio::test]
    async fn one_task_per_resource_in_a_batch() {
        let pool = pool().await;
        let a = pool.enqueue(NewTask::new("a", "c").with_resource("vm")).await.unwrap();
        pool.enqueue(NewTask::new("b", "c").with_resource("vm")).await.unwrap();

        let eligible = pool.next_eligible(10).await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, a);
    }

    #[tokio::test]
    async fn limit_zero_returns_nothing() {
        let pool = pool().await;
        pool.enqueue(NewTask::new("a", "c")).await.unwrap();
        assert!(pool.next_eligible(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_missing_task_is_no_task() {
        let pool = pool().await;
        let err = pool.get(12).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Queue(QueueError::NoTask(Some(12)))));
    }

    #[tokio::test]
    async fn completing_child_signals_and_wakes_parent() {
        let pool = pool().await;
        let later = Utc::now() + chrono::Duration::hours(1);
        let parent = pool
            .enqueue(NewTask::new("parent", "c").with_wake_time(later))
            .await
            .unwrap();
        let child = pool
            .enqueue(NewTask::new("child", "c").with_parent(parent))
            .await
            .unwrap();

        assert!(pool.complete(child, ExitStatus::ErrorUser, "bad").await.unwrap());
        assert!(!pool.complete(child, ExitStatus::Success, "").await.unwrap());

        let pending = pool.db().pending_signals(parent).await.unwrap();
        assert_eq!(pending.len(), 1);
        let DomainSignal::WipComplete(done) = pending[0].domain().unwrap() else {
            panic!("expected wip_complete");
        };
        assert_eq!(done.completed_wip_id, child);
        assert_eq!(done.exit_status, Some(ExitStatus::ErrorUser));

        let parent_task = pool.get(parent).await.unwrap();
        assert!(parent_task.is_awake(Utc::now()));
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let pool = pool().await;
        let id = pool.enqueue(NewTask::new("a", "c")).await.unwrap();
        assert!(pool.pause(id).await.unwrap());
        assert!(pool.next_eligible(10).await.unwrap().is_empty());
        assert!(pool.resume(id).await.unwrap());
        assert_eq!(pool.next_eligible(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminate_flags_and_signals() {
        let pool = pool().await;
        let id = pool.enqueue(NewTask::new("a", "c")).await.unwrap();
        assert!(pool.terminate(id).await.unwrap());

        let task = pool.get(id).await.unwrap();
        assert!(task.terminating);
        let pending = pool.db().pending_signals(id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].signal_type, SignalType::Terminate);
    }

    #[tokio::test]
    async fn terminating_tasks_sort_behind_prioritized() {
        let pool = pool().await;
        let t = pool.enqueue(NewTask::new("t", "c").with_priority(1)).await.unwrap();
        let other = pool.enqueue(NewTask::new("o", "c").with_priority(50)).await.unwrap();
        pool.terminate(t).await.unwrap();

        let ids: Vec<i64> = pool.next_eligible(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![other, t]);

        pool.prioritize(t).await.unwrap();
        let ids: Vec<i64> = pool.next_eligible(10).await.unwrap().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![t, other]);
    }

    #[tokio::test]
    async fn force_fail_keeps_diagnostic_and_releases_thread() {
        let pool = pool().await;
        let server = pool.db().upsert_server("node-1", 1).await.unwrap();
        let id = pool.enqueue(NewTask::new("a", "c")).await.unwrap();
        pool.db().bind_thread(server.id, id, Utc::now()).await.unwrap();

        assert!(pool.force_fail(id, "container never started").await.unwrap());

        let task = pool.get(id).await.unwrap();
        assert_eq!(task.exit_status, ExitStatus::ErrorSystem);
        assert_eq!(task.exit_message, "container never started");
        assert!(pool.db().thread_for_task(id).await.unwrap().is_none());

        let logs = pool.db().list_task_logs(id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].message.contains(&id.to_string()));
    }
}
