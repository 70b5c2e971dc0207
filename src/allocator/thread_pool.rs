//! ThreadPool: the allocator loop.
//!
//! Each pass builds the balanced slot list, asks the queue for eligible
//! tasks, binds each to a slot (or reuses the thread it already holds) and
//! runs a worker for it. Tasks in one pass run concurrently; every
//! cross-worker decision is a conditional update in the store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::allocator::server::{Slot, balanced_slots};
use crate::allocator::thread::Thread;
use crate::config::PoolConfig;
use crate::error::{Error, QueueError, Result};
use crate::queue::model::{RunStatus, Task};
use crate::store::Database;
use crate::worker::iterator::StepStatus;
use crate::worker::worker::{WipWorker, WorkerDeps};

/// What happened to one task in a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed(StepStatus),
    Suspended,
    /// Another worker claimed the task or took the slot first.
    LostRace,
    /// The task raised an error and was force-failed.
    Failed(String),
}

/// Counters for one or more passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub passes: u32,
    pub free_slots: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub suspended: usize,
    pub lost_races: usize,
    pub failed: usize,
}

impl PassReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Completed(_) => {
                self.dispatched += 1;
                self.completed += 1;
            }
            DispatchOutcome::Suspended => {
                self.dispatched += 1;
                self.suspended += 1;
            }
            DispatchOutcome::LostRace => self.lost_races += 1,
            DispatchOutcome::Failed(_) => {
                self.dispatched += 1;
                self.failed += 1;
            }
        }
    }

    fn absorb(&mut self, other: &PassReport) {
        self.passes += other.passes;
        self.free_slots += other.free_slots;
        self.dispatched += other.dispatched;
        self.completed += other.completed;
        self.suspended += other.suspended;
        self.lost_races += other.lost_races;
        self.failed += other.failed;
    }
}

/// Finish the running thread bound to `task_id`.
pub(crate) async fn release_thread(db: &dyn Database, task_id: i64) -> Result<Thread> {
    let mut thread = db.thread_for_task(task_id).await?.ok_or_else(|| {
        QueueError::InvalidOperation(format!("task {task_id} has no bound thread"))
    })?;
    let now = Utc::now();
    db.finish_thread(thread.id, now).await?;
    thread.status = crate::allocator::thread::ThreadStatus::Finished;
    thread.completed_at = Some(now);
    debug!(task_id, thread_id = thread.id, "Thread released");
    Ok(thread)
}

pub struct ThreadPool {
    deps: WorkerDeps,
    config: PoolConfig,
    starved_passes: AtomicU32,
}

impl ThreadPool {
    pub fn new(deps: WorkerDeps, config: PoolConfig) -> Self {
        Self {
            deps,
            config,
            starved_passes: AtomicU32::new(0),
        }
    }

    fn db(&self) -> &dyn Database {
        self.deps.pool.db().as_ref()
    }

    fn worker_id(&self) -> &str {
        &self.deps.config.worker_id
    }

    /// Free slots across all servers, least-loaded server first.
    ///
    /// Having no servers at all is a configuration error, not starvation.
    pub async fn available_slots(&self) -> Result<Vec<Slot>> {
        let servers = self.db().list_servers().await?;
        if servers.is_empty() {
            return Err(QueueError::NoWorkerServers.into());
        }
        let running = self.db().running_counts().await?;
        Ok(balanced_slots(&servers, &running))
    }

    /// Consecutive passes that found no free slot.
    pub fn starved_passes(&self) -> u32 {
        self.starved_passes.load(Ordering::Relaxed)
    }

    /// Update the starvation streak. Returns true on the one pass per streak
    /// that crosses the threshold and logs the warning.
    fn track_starvation(&self, free: usize) -> bool {
        if free > 0 {
            self.starved_passes.store(0, Ordering::Relaxed);
            return false;
        }
        let streak = self.starved_passes.fetch_add(1, Ordering::Relaxed) + 1;
        if streak != self.config.starvation_threshold.saturating_add(1) {
            return false;
        }
        warn!(
            streak,
            threshold = self.config.starvation_threshold,
            "No free execution slots; queued tasks are starving"
        );
        true
    }

    /// Claim `task`, bind it to a thread and run a worker for it.
    ///
    /// A task that already holds a running thread reuses it and needs no
    /// slot. If the slot is taken between listing and binding, the claim is
    /// given back and the task is left for a later pass.
    pub async fn dispatch(&self, task: Task, slot: Option<Slot>) -> Result<DispatchOutcome> {
        let lease = task.lease.max(self.config.lease);
        if !self.deps.pool.claim(&task, self.worker_id(), lease).await? {
            return Ok(DispatchOutcome::LostRace);
        }

        if self.db().thread_for_task(task.id).await?.is_none() {
            let bound = match &slot {
                Some(slot) => self.db().bind_thread(slot.server_id, task.id, Utc::now()).await?,
                None => None,
            };
            let Some(thread) = bound else {
                self.unclaim(&task).await?;
                return Ok(DispatchOutcome::LostRace);
            };
            info!(
                task_id = task.id,
                thread_id = thread.id,
                server = slot.as_ref().map(|s| s.server_name.as_str()).unwrap_or_default(),
                "Thread bound"
            );
        }

        let mut worker = WipWorker::new(self.deps.clone());
        worker.set_task_id(task.id);
        let result = worker.process().await?;

        Ok(if result.complete {
            DispatchOutcome::Completed(result.status)
        } else {
            DispatchOutcome::Suspended
        })
    }

    /// Give a claim back, restoring the task to where it was before.
    async fn unclaim(&self, task: &Task) -> Result<()> {
        let status = match task.run_status {
            RunStatus::Processing => RunStatus::Waiting,
            other => other,
        };
        self.deps
            .pool
            .release(task.id, self.worker_id(), status, task.wake_time)
            .await?;
        debug!(task_id = task.id, "Slot taken; claim returned");
        Ok(())
    }

    /// Dispatch with per-task error isolation: a failing task is completed
    /// as `error-system` and never aborts the pass.
    async fn dispatch_isolated(&self, task: Task, slot: Option<Slot>) -> DispatchOutcome {
        let id = task.id;
        match self.dispatch(task, slot).await {
            Ok(outcome) => outcome,
            Err(Error::Queue(QueueError::ClaimLost { .. } | QueueError::NoTask(_))) => {
                warn!(task_id = id, "Claim lost mid-run");
                DispatchOutcome::LostRace
            }
            Err(e) => {
                let message = format!("task {id}: {e}");
                error!(task_id = id, error = %e, "Task failed during dispatch");
                if let Err(fail) = self.deps.pool.force_fail(id, &message).await {
                    error!(task_id = id, error = %fail, "Could not force-fail task");
                }
                DispatchOutcome::Failed(message)
            }
        }
    }

    /// Finish the thread held by `task_id`.
    pub async fn release(&self, task_id: i64) -> Result<Thread> {
        release_thread(self.db(), task_id).await
    }

    /// Delete finished thread rows; their task results are already stored.
    pub async fn reap_finished_threads(&self) -> Result<usize> {
        let mut reaped = 0;
        for thread in self.db().list_threads().await? {
            if !thread.is_running() && self.db().delete_thread(thread.id).await? {
                reaped += 1;
            }
        }
        if reaped > 0 {
            debug!(reaped, "Finished threads removed");
        }
        Ok(reaped)
    }

    /// One allocation pass.
    pub async fn run_once(&self) -> Result<PassReport> {
        let slots = self.available_slots().await?;
        let mut report = PassReport {
            passes: 1,
            free_slots: slots.len(),
            ..Default::default()
        };
        self.track_starvation(slots.len());

        let tasks = self.deps.pool.next_eligible(self.config.batch_size).await?;
        let mut free = slots.into_iter();
        let mut jobs = Vec::with_capacity(tasks.len());
        for task in tasks {
            let held = match self.db().thread_for_task(task.id).await {
                Ok(thread) => thread.is_some(),
                Err(e) => {
                    error!(task_id = task.id, error = %e, "Thread lookup failed; skipping task");
                    continue;
                }
            };
            let slot = if held {
                None
            } else {
                match free.next() {
                    Some(slot) => Some(slot),
                    None => continue,
                }
            };
            jobs.push(self.dispatch_isolated(task, slot));
        }

        for outcome in join_all(jobs).await {
            report.record(&outcome);
        }

        if report.dispatched > 0 || report.lost_races > 0 {
            debug!(
                dispatched = report.dispatched,
                completed = report.completed,
                suspended = report.suspended,
                lost = report.lost_races,
                failed = report.failed,
                "Pass finished"
            );
        }
        Ok(report)
    }

    /// Run passes until the configured time budget is spent.
    ///
    /// Idle passes sleep for the jittered poll interval so several
    /// allocator processes do not poll in lockstep.
    pub async fn run(&self) -> Result<PassReport> {
        let started = Instant::now();
        let budget = self.config.time_budget;
        let mut total = PassReport::default();

        self.reap_finished_threads().await?;

        while started.elapsed() < budget {
            let pass = self.run_once().await?;
            total.absorb(&pass);

            if pass.dispatched == 0 {
                let remaining = budget.saturating_sub(started.elapsed());
                tokio::time::sleep(jittered(self.config.poll_interval).min(remaining)).await;
            }
        }

        info!(
            passes = total.passes,
            dispatched = total.dispatched,
            completed = total.completed,
            "Allocator budget spent"
        );
        Ok(total)
    }
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}
