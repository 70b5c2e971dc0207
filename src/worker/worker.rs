//! Per-task worker execution.
//!
//! A `WipWorker` drives one claimed task: it rebuilds the task's iterator,
//! steps it until it completes, suspends or runs out of its time budget, and
//! persists state after every step.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::allocator::thread_pool::release_thread;
use crate::config::WorkerConfig;
use crate::error::{Error, QueueError, Result};
use crate::queue::model::{ExitStatus, RunStatus, Task};
use crate::queue::pool::WipPool;
use crate::signal::SignalService;
use crate::store::Database;
use crate::worker::iterator::{
    IteratorResult, StateIterator, StepContext, StepStatus, WorkflowRegistry,
};

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub pool: WipPool,
    pub signals: Arc<SignalService>,
    pub registry: Arc<WorkflowRegistry>,
    pub config: WorkerConfig,
}

impl WorkerDeps {
    fn db(&self) -> &Arc<dyn Database> {
        self.pool.db()
    }
}

/// Worker that executes a single task.
pub struct WipWorker {
    deps: WorkerDeps,
    task_id: Option<i64>,
    iterator: Option<Box<dyn StateIterator>>,
}

impl WipWorker {
    pub fn new(deps: WorkerDeps) -> Self {
        Self {
            deps,
            task_id: None,
            iterator: None,
        }
    }

    pub fn set_task_id(&mut self, task_id: i64) {
        if self.task_id != Some(task_id) {
            self.iterator = None;
        }
        self.task_id = Some(task_id);
    }

    pub fn task_id(&self) -> Option<i64> {
        self.task_id
    }

    /// The task this worker is bound to.
    ///
    /// Fails with `NoTask` if no id is set, the task does not exist, or it is
    /// not currently claimed by this worker.
    pub async fn get_task(&self) -> Result<Task> {
        let id = self.task_id.ok_or(QueueError::NoTask(None))?;
        let task = self.deps.pool.get(id).await?;
        let ours = task.claimed_by.as_deref() == Some(self.deps.config.worker_id.as_str());
        if task.run_status == RunStatus::Complete || !ours || !task.has_valid_claim(Utc::now()) {
            return Err(QueueError::NoTask(Some(id)).into());
        }
        Ok(task)
    }

    /// Run the task until it completes, suspends or the time budget runs out.
    pub async fn process(&mut self) -> Result<IteratorResult> {
        let task = self.get_task().await?;
        let id = task.id;
        let now = Utc::now();

        if task.start_time.is_none() {
            self.deps.db().mark_started(id, now).await?;
        }

        if task.exceeded_max_run_time(now) {
            let ran = task.run_time(now).unwrap_or_default().as_secs();
            let max = task.max_run_time.unwrap_or_default().as_secs();
            let message = format!("task {id} ran for {ran}s, exceeding its maximum of {max}s");
            self.deps
                .pool
                .force_complete(id, ExitStatus::ErrorTimeout, &message)
                .await?;
            return Ok(IteratorResult::done(StepStatus::Timeout, message));
        }

        if self.iterator.is_none() {
            match self.deps.registry.load(&task) {
                Ok(iterator) => self.iterator = Some(iterator),
                Err(e) => {
                    let message = format!("task {id}: failed to load workflow: {e}");
                    self.deps.pool.force_fail(id, &message).await?;
                    return Ok(IteratorResult::done(StepStatus::Error, message));
                }
            }
        }

        let thread = self.deps.db().thread_for_task(id).await?;
        let server_name = match &thread {
            Some(t) => self
                .deps
                .db()
                .get_server(t.server_id)
                .await?
                .map(|s| s.name),
            None => None,
        };

        let budget = self.deps.config.timeout;
        let started = Instant::now();
        let mut ctx = StepContext {
            task,
            thread,
            server_name,
            signals: Vec::new(),
        };

        loop {
            let Some(remaining) = budget.checked_sub(started.elapsed()) else {
                return self.suspend(id, Duration::ZERO).await;
            };

            ctx.signals = self.deps.signals.consume_pending(id).await?;
            let Some(iterator) = self.iterator.as_mut() else {
                return Err(QueueError::InvalidOperation(format!("task {id} has no iterator")).into());
            };

            let stepped = tokio::time::timeout(remaining, iterator.step(&mut ctx)).await;
            let result = match stepped {
                Err(_) => {
                    tracing::warn!(
                        task_id = id,
                        signals = ctx.signals.len(),
                        "Step outlived the worker budget; yielding"
                    );
                    // The cancelled step never saw these.
                    self.deps.signals.restore(&ctx.signals).await?;
                    return self.suspend(id, Duration::ZERO).await;
                }
                Ok(Err(e)) => {
                    let message = format!("task {id}: step failed: {e}");
                    self.deps.pool.force_fail(id, &message).await?;
                    return Ok(IteratorResult::done(StepStatus::Error, message));
                }
                Ok(Ok(result)) => result,
            };

            self.deps
                .db()
                .save_task_state(id, &iterator.snapshot())
                .await?;

            if result.complete {
                self.complete(&result).await?;
                return Ok(result);
            }

            if ctx.terminate_requested() {
                let result = IteratorResult::done(StepStatus::Terminated, "terminated on request");
                self.complete(&result).await?;
                return Ok(result);
            }

            if result.suspends() {
                self.suspend(id, Duration::from_secs(result.wait)).await?;
                return Ok(result);
            }

            tracing::debug!(task_id = id, wait = result.wait, "Stepping again");
        }
    }

    /// Leave the task waiting until `wait` from now. The thread stays bound.
    async fn suspend(&self, id: i64, wait: Duration) -> Result<IteratorResult> {
        let wake = Utc::now() + chrono::Duration::from_std(wait).unwrap_or_default();
        let released = self
            .deps
            .pool
            .release(id, &self.deps.config.worker_id, RunStatus::Waiting, Some(wake))
            .await?;
        if !released {
            return Err(QueueError::ClaimLost { id }.into());
        }
        // A signal delivered while the task was still processing could not wake it.
        if !self.deps.db().pending_signals(id).await?.is_empty() {
            self.deps.pool.wake(id).await?;
        }
        tracing::debug!(task_id = id, wait_secs = wait.as_secs(), "Task suspended");
        Ok(IteratorResult::wait(wait.as_secs()))
    }

    /// Record the final outcome, release the thread and, on success, drop the
    /// task's diagnostic log.
    pub async fn complete(&self, result: &IteratorResult) -> Result<()> {
        let task = self.get_task().await?;
        let exit_status = result.status.exit_status();
        let message = self.final_message(result);

        self.deps.pool.complete(task.id, exit_status, &message).await?;

        match release_thread(self.deps.db().as_ref(), task.id).await {
            Ok(_) => {}
            Err(Error::Queue(QueueError::InvalidOperation(_))) => {
                tracing::debug!(task_id = task.id, "No thread bound at completion");
            }
            Err(e) => return Err(e),
        }

        if exit_status == ExitStatus::Success {
            self.deps.db().prune_task_logs(task.id).await?;
        }

        tracing::info!(
            task_id = task.id,
            exit_status = %exit_status,
            "Worker finished task"
        );
        Ok(())
    }

    /// Most specific message available: the result's, the workflow object's,
    /// then the iterator's.
    fn final_message(&self, result: &IteratorResult) -> String {
        if !result.message.is_empty() {
            return result.message.clone();
        }
        let Some(iterator) = self.iterator.as_ref() else {
            return String::new();
        };
        iterator
            .wip()
            .message()
            .or_else(|| iterator.message())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::error::WorkflowError;
    use crate::queue::model::NewTask;
    use crate::store::LibSqlBackend;
    use crate::worker::iterator::{WorkflowFactory, WorkflowObject};

    struct Note(Option<String>);

    impl WorkflowObject for Note {
        fn message(&self) -> Option<String> {
            self.0.clone()
        }
    }

    /// Plays back a fixed list of results, counting steps in its state.
    struct Scripted {
        script: Vec<IteratorResult>,
        steps: usize,
        note: Note,
    }

    #[async_trait]
    impl StateIterator for Scripted {
        async fn step(&mut self, _ctx: &mut StepContext) -> Result<IteratorResult> {
            let result = self
                .script
                .get(self.steps)
                .cloned()
                .unwrap_or_else(|| IteratorResult::success(""));
            self.steps += 1;
            Ok(result)
        }

        fn wip(&self) -> &dyn WorkflowObject {
            &self.note
        }

        fn message(&self) -> Option<String> {
            Some(format!("step {}", self.steps))
        }

        fn snapshot(&self) -> Value {
            json!({"steps": self.steps})
        }
    }

    struct ScriptedFactory {
        script: Mutex<Vec<IteratorResult>>,
        note: Option<String>,
    }

    impl WorkflowFactory for ScriptedFactory {
        fn class_id(&self) -> &str {
            "scripted"
        }

        fn load(&self, task: &Task) -> std::result::Result<Box<dyn StateIterator>, WorkflowError> {
            let steps = task.state.get("steps").and_then(Value::as_u64).unwrap_or(0) as usize;
            Ok(Box::new(Scripted {
                script: self.script.lock().unwrap().clone(),
                steps,
                note: Note(self.note.clone()),
            }))
        }
    }

    /// Sleeps through each queued nap in turn, then asks to wait. Records
    /// how many signals every finished step was handed.
    struct Napper {
        naps: Arc<Mutex<VecDeque<Duration>>>,
        heard: Arc<Mutex<Vec<usize>>>,
        note: Note,
    }

    #[async_trait]
    impl StateIterator for Napper {
        async fn step(&mut self, ctx: &mut StepContext) -> Result<IteratorResult> {
            let nap = self.naps.lock().unwrap().pop_front();
            if let Some(nap) = nap {
                tokio::time::sleep(nap).await;
            }
            self.heard.lock().unwrap().push(ctx.signals.len());
            let more = !self.naps.lock().unwrap().is_empty();
            Ok(if more {
                IteratorResult::proceed()
            } else {
                IteratorResult::wait(30)
            })
        }

        fn wip(&self) -> &dyn WorkflowObject {
            &self.note
        }

        fn message(&self) -> Option<String> {
            None
        }

        fn snapshot(&self) -> Value {
            json!({})
        }
    }

    #[derive(Clone, Default)]
    struct NapperFactory {
        naps: Arc<Mutex<VecDeque<Duration>>>,
        heard: Arc<Mutex<Vec<usize>>>,
    }

    impl WorkflowFactory for NapperFactory {
        fn class_id(&self) -> &str {
            "napper"
        }

        fn load(&self, _task: &Task) -> std::result::Result<Box<dyn StateIterator>, WorkflowError> {
            Ok(Box::new(Napper {
                naps: Arc::clone(&self.naps),
                heard: Arc::clone(&self.heard),
                note: Note(None),
            }))
        }
    }

    async fn setup(script: Vec<IteratorResult>, note: Option<&str>) -> (WorkerDeps, Arc<dyn Database>) {
        let registry = WorkflowRegistry::new().with(Arc::new(ScriptedFactory {
            script: Mutex::new(script),
            note: note.map(String::from),
        }));
        deps_with(registry, Duration::from_secs(5)).await
    }

    async fn deps_with(registry: WorkflowRegistry, budget: Duration) -> (WorkerDeps, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let pool = WipPool::new(db.clone());
        let deps = WorkerDeps {
            pool,
            signals: Arc::new(SignalService::new(db.clone(), "https://wip.test")),
            registry: Arc::new(registry),
            config: WorkerConfig {
                timeout: budget,
                worker_id: "w1".into(),
            },
        };
        (deps, db)
    }

    /// Claimed napper task bound to a thread on a one-slot server.
    async fn bound_napper(deps: &WorkerDeps, db: &Arc<dyn Database>) -> (i64, i64) {
        let server = db.upsert_server("solo", 1).await.unwrap();
        let id = claimed(deps, "napper").await;
        let thread = db.bind_thread(server.id, id, Utc::now()).await.unwrap().unwrap();
        (id, thread.id)
    }

    async fn claimed(deps: &WorkerDeps, class: &str) -> i64 {
        let id = deps
            .pool
            .enqueue(NewTask::new("job", class))
            .await
            .unwrap();
        let task = deps.pool.get(id).await.unwrap();
        assert!(deps.pool.claim(&task, "w1", Duration::from_secs(60)).await.unwrap());
        id
    }

    #[tokio::test]
    async fn get_task_requires_an_id_and_our_claim() {
        let (deps, _db) = setup(vec![], None).await;
        let mut worker = WipWorker::new(deps.clone());
        assert!(matches!(
            worker.get_task().await,
            Err(Error::Queue(QueueError::NoTask(None)))
        ));

        let id = deps
            .pool
            .enqueue(NewTask::new("job", "scripted"))
            .await
            .unwrap();
        worker.set_task_id(id);
        assert!(matches!(
            worker.get_task().await,
            Err(Error::Queue(QueueError::NoTask(Some(_))))
        ));
    }

    #[tokio::test]
    async fn wait_result_suspends_and_persists_state() {
        let (deps, db) = setup(
            vec![IteratorResult::proceed(), IteratorResult::wait(30)],
            None,
        )
        .await;
        let id = claimed(&deps, "scripted").await;
        let mut worker = WipWorker::new(deps.clone());
        worker.set_task_id(id);

        let result = worker.process().await.unwrap();
        assert!(result.suspends());

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.run_status, RunStatus::Waiting);
        assert!(task.wake_time.unwrap() > Utc::now());
        assert_eq!(task.state["steps"], 2);
        assert!(task.start_time.is_some());
    }

    #[tokio::test]
    async fn message_falls_back_to_the_workflow_object() {
        let (deps, db) = setup(vec![IteratorResult::success("")], Some("built 3 images")).await;
        let id = claimed(&deps, "scripted").await;
        let mut worker = WipWorker::new(deps);
        worker.set_task_id(id);

        worker.process().await.unwrap();
        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.exit_status, ExitStatus::Success);
        assert_eq!(task.exit_message, "built 3 images");
    }

    #[tokio::test]
    async fn message_falls_back_to_the_iterator() {
        let (deps, db) = setup(vec![IteratorResult::success("")], None).await;
        let id = claimed(&deps, "scripted").await;
        let mut worker = WipWorker::new(deps);
        worker.set_task_id(id);

        worker.process().await.unwrap();
        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.exit_message, "step 1");
    }

    #[tokio::test]
    async fn unknown_class_fails_as_system_error_with_diagnostic() {
        let (deps, db) = setup(vec![], None).await;
        let id = claimed(&deps, "missing").await;
        let mut worker = WipWorker::new(deps);
        worker.set_task_id(id);

        let result = worker.process().await.unwrap();
        assert_eq!(result.status, StepStatus::Error);

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.exit_status, ExitStatus::ErrorSystem);
        let logs = db.list_task_logs(id).await.unwrap();
        assert!(logs.iter().any(|l| l.message.contains(&id.to_string())));
    }

    #[tokio::test]
    async fn terminate_signal_ends_a_running_iterator() {
        let (deps, db) = setup(vec![IteratorResult::wait(30)], None).await;
        let id = claimed(&deps, "scripted").await;
        deps.pool.terminate(id).await.unwrap();

        let mut worker = WipWorker::new(deps);
        worker.set_task_id(id);
        let result = worker.process().await.unwrap();
        assert_eq!(result.status, StepStatus::Terminated);

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.exit_status, ExitStatus::Terminated);
    }

    #[tokio::test]
    async fn budget_exhaustion_yields_with_thread_kept() {
        let napper = NapperFactory::default();
        napper
            .naps
            .lock()
            .unwrap()
            .extend([Duration::from_millis(120); 10]);
        let (deps, db) = deps_with(
            WorkflowRegistry::new().with(Arc::new(napper.clone())),
            Duration::from_millis(300),
        )
        .await;
        let (id, thread_id) = bound_napper(&deps, &db).await;

        let mut worker = WipWorker::new(deps);
        worker.set_task_id(id);
        let started = Instant::now();
        let result = worker.process().await.unwrap();

        assert!(!result.complete);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!napper.heard.lock().unwrap().is_empty());
        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.run_status, RunStatus::Waiting);
        assert!(task.claimed_by.is_none());
        assert!(task.is_awake(Utc::now()));
        assert_eq!(db.thread_for_task(id).await.unwrap().unwrap().id, thread_id);
    }

    #[tokio::test]
    async fn signals_survive_a_step_cut_off_by_the_budget() {
        let napper = NapperFactory::default();
        napper.naps.lock().unwrap().push_back(Duration::from_secs(2));
        let (deps, db) = deps_with(
            WorkflowRegistry::new().with(Arc::new(napper.clone())),
            Duration::from_millis(300),
        )
        .await;
        let (id, thread_id) = bound_napper(&deps, &db).await;
        deps.pool.terminate(id).await.unwrap();

        let mut worker = WipWorker::new(deps.clone());
        worker.set_task_id(id);
        let result = worker.process().await.unwrap();
        assert!(!result.complete);
        assert!(napper.heard.lock().unwrap().is_empty());

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.run_status, RunStatus::Waiting);
        assert_eq!(db.pending_signals(id).await.unwrap().len(), 1);
        assert_eq!(db.thread_for_task(id).await.unwrap().unwrap().id, thread_id);

        // The next run hands the terminate signal to the step, then stops.
        assert!(deps.pool.claim(&task, "w1", Duration::from_secs(60)).await.unwrap());
        let mut worker = WipWorker::new(deps);
        worker.set_task_id(id);
        let result = worker.process().await.unwrap();
        assert_eq!(result.status, StepStatus::Terminated);
        assert_eq!(*napper.heard.lock().unwrap(), vec![1]);

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.exit_status, ExitStatus::Terminated);
        assert!(db.thread_for_task(id).await.unwrap().is_none());
    }
}
