//! `command` workflow: run one shell command through the configured backend.
//!
//! `launch → wait → done`. The launched command posts its completion to a
//! pre-registered signal; `wait` also polls the backend so a lost callback
//! only delays completion.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, WorkflowError};
use crate::process::handle::{ProcessHandle, ProcessResult, ProcessState};
use crate::process::{Backend, LaunchSpec, SIGNAL_URL_ENV, check_completion};
use crate::queue::model::{NewTask, Task};
use crate::signal::kinds::DomainSignal;
use crate::signal::{SignalService, SignalType};
use crate::store::Database;
use crate::worker::iterator::{
    IteratorResult, StateIterator, StepContext, StepStatus, WorkflowFactory, WorkflowObject,
};

pub const CLASS_ID: &str = "command";

const DEFAULT_POLL_SECS: u64 = 5;

fn default_poll_secs() -> u64 {
    DEFAULT_POLL_SECS
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Launch,
    Wait,
    Done,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Wait => "wait",
            Self::Done => "done",
        }
    }
}

/// Persisted state of a command task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandState {
    pub command: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub process: ProcessState,
    #[serde(default)]
    pub signal_uuid: Option<Uuid>,
    #[serde(default)]
    pub result: Option<ProcessResult>,
    /// Seconds between backend polls while waiting.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

impl CommandState {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            poll_secs: DEFAULT_POLL_SECS,
            ..Self::default()
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_poll_secs(mut self, secs: u64) -> Self {
        self.poll_secs = secs;
        self
    }

    /// A task that runs this command.
    pub fn into_task(self, name: impl Into<String>) -> NewTask {
        let state = serde_json::to_value(&self).unwrap_or(Value::Null);
        NewTask::new(name, CLASS_ID).with_state(state)
    }
}

impl WorkflowObject for CommandState {
    fn message(&self) -> Option<String> {
        self.result
            .as_ref()
            .map(|r| r.message.clone())
            .filter(|m| !m.is_empty())
    }
}

pub struct CommandWorkflow {
    state: CommandState,
    handle: ProcessHandle,
    signals: Arc<SignalService>,
    db: Arc<dyn Database>,
}

impl CommandWorkflow {
    pub fn state(&self) -> &CommandState {
        &self.state
    }

    async fn launch(&mut self, ctx: &StepContext) -> Result<IteratorResult> {
        let server = ctx
            .server_name
            .clone()
            .ok_or_else(|| WorkflowError::StepFailed {
                state: Stage::Launch.as_str().into(),
                reason: format!("task {} is not bound to a server", ctx.task.id),
            })?;

        let signal = self.signals.register(ctx.task.id, SignalType::Complete).await?;
        let mut spec = LaunchSpec::new(ctx.task.id, server, self.state.command.clone())
            .with_env(SIGNAL_URL_ENV, self.signals.callback_url(&signal));
        for (key, value) in &self.state.env {
            spec = spec.with_env(key.clone(), value.clone());
        }
        for port in &self.state.ports {
            spec = spec.with_port(*port);
        }

        let info = self.handle.run(&spec).await?.clone();
        if let Some(thread) = &ctx.thread {
            let data = serde_json::to_value(&info).map_err(|e| WorkflowError::StepFailed {
                state: Stage::Launch.as_str().into(),
                reason: format!("process info not serializable: {e}"),
            })?;
            self.db.update_process_data(thread.id, &data).await?;
        }

        self.state.signal_uuid = Some(signal.uuid);
        self.state.stage = Stage::Wait;
        Ok(IteratorResult::wait(self.state.poll_secs))
    }

    async fn wait(&mut self, ctx: &StepContext) -> Result<IteratorResult> {
        let task_id = ctx.task.id;

        if ctx.terminate_requested() {
            if let Err(e) = self.handle.kill().await {
                warn!(task_id, error = %e, "Kill on terminate failed");
            }
            self.finish(self.handle.result().cloned());
            return Ok(IteratorResult::done(StepStatus::Terminated, "terminated on request"));
        }

        let recorded = self.recorded_completion().await?;
        let delivered = ctx
            .signals
            .iter()
            .filter_map(|c| c.domain.as_ref())
            .chain(recorded.as_ref());
        if let Some(result) = check_completion(&mut self.handle, delivered).await? {
            self.finish(Some(result));
            return Ok(IteratorResult::proceed());
        }

        debug!(task_id, poll_secs = self.state.poll_secs, "Command still running");
        Ok(IteratorResult::wait(self.state.poll_secs))
    }

    /// Completion recorded for our process when its signal was consumed, in
    /// case that signal never reached a step.
    async fn recorded_completion(&self) -> Result<Option<DomainSignal>> {
        let Some(process_id) = self.handle.unique_process_id() else {
            return Ok(None);
        };
        let Some(stored) = self.signals.process_result(&process_id).await? else {
            return Ok(None);
        };
        match DomainSignal::from_object(&stored) {
            Ok(domain) => Ok(Some(domain)),
            Err(e) => {
                warn!(process_id = %process_id, error = %e, "Recorded process result unreadable");
                Ok(None)
            }
        }
    }

    fn finish(&mut self, result: Option<ProcessResult>) {
        self.state.result = result;
        self.state.stage = Stage::Done;
    }

    fn done(&self) -> IteratorResult {
        match &self.state.result {
            Some(result) if result.succeeded() => {
                info!(process_id = %result.process_id, secs = result.duration_secs(), "Command succeeded");
                IteratorResult::success(result.message.clone())
            }
            Some(result) => {
                let message = if result.message.is_empty() {
                    "command failed".to_string()
                } else {
                    result.message.clone()
                };
                IteratorResult::done(StepStatus::UserError, message)
            }
            None => IteratorResult::done(StepStatus::Error, "command finished without a result"),
        }
    }
}

#[async_trait]
impl StateIterator for CommandWorkflow {
    async fn step(&mut self, ctx: &mut StepContext) -> Result<IteratorResult> {
        match self.state.stage {
            Stage::Launch => self.launch(ctx).await,
            Stage::Wait => self.wait(ctx).await,
            Stage::Done => Ok(self.done()),
        }
    }

    fn wip(&self) -> &dyn WorkflowObject {
        &self.state
    }

    fn message(&self) -> Option<String> {
        Some(format!("command in stage {}", self.state.stage.as_str()))
    }

    fn snapshot(&self) -> Value {
        let mut state = self.state.clone();
        state.process = self.handle.snapshot();
        serde_json::to_value(&state).unwrap_or(Value::Null)
    }
}

/// Rebuilds `CommandWorkflow`s from task state.
pub struct CommandWorkflowFactory {
    backend: Arc<dyn Backend>,
    signals: Arc<SignalService>,
    db: Arc<dyn Database>,
}

impl CommandWorkflowFactory {
    pub fn new(backend: Arc<dyn Backend>, signals: Arc<SignalService>, db: Arc<dyn Database>) -> Self {
        Self {
            backend,
            signals,
            db,
        }
    }
}

impl WorkflowFactory for CommandWorkflowFactory {
    fn class_id(&self) -> &str {
        CLASS_ID
    }

    fn load(&self, task: &Task) -> std::result::Result<Box<dyn StateIterator>, WorkflowError> {
        let corrupt = |reason: String| WorkflowError::CorruptState {
            task_id: task.id,
            reason,
        };
        let state: CommandState =
            serde_json::from_value(task.state.clone()).map_err(|e| corrupt(e.to_string()))?;
        if state.command.trim().is_empty() {
            return Err(corrupt("command is empty".into()));
        }

        let handle = ProcessHandle::restore(self.backend.clone(), state.process.clone());
        Ok(Box::new(CommandWorkflow {
            state,
            handle,
            signals: self.signals.clone(),
            db: self.db.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::process::{NullBackend, NullScript};
    use crate::queue::pool::WipPool;
    use crate::signal::kinds::{ContainerSignal, ProcessReport};
    use crate::store::LibSqlBackend;

    struct Fixture {
        db: Arc<dyn Database>,
        signals: Arc<SignalService>,
        factory: CommandWorkflowFactory,
    }

    async fn fixture(script: NullScript) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let signals = Arc::new(SignalService::new(db.clone(), "https://wip.test"));
        let factory = CommandWorkflowFactory::new(
            Arc::new(NullBackend::new(script)),
            signals.clone(),
            db.clone(),
        );
        Fixture {
            db,
            signals,
            factory,
        }
    }

    async fn bound_context(f: &Fixture, state: CommandState) -> StepContext {
        let id = f.db.insert_task(&state.into_task("build")).await.unwrap();
        let server = f.db.upsert_server("local", 1).await.unwrap();
        let thread = f.db.bind_thread(server.id, id, Utc::now()).await.unwrap();
        StepContext {
            task: f.db.get_task(id).await.unwrap().unwrap(),
            thread,
            server_name: Some(server.name),
            signals: Vec::new(),
        }
    }

    #[tokio::test]
    async fn runs_to_success_by_polling() {
        let f = fixture(NullScript {
            exit_code: Some(0),
            ..Default::default()
        })
        .await;
        let mut ctx = bound_context(&f, CommandState::new("make all")).await;
        let mut wf = f.factory.load(&ctx.task).unwrap();

        let launched = wf.step(&mut ctx).await.unwrap();
        assert!(launched.suspends());
        let thread = f.db.thread_for_task(ctx.task.id).await.unwrap().unwrap();
        assert_eq!(thread.process_data["pid"], "null-1");

        let waited = wf.step(&mut ctx).await.unwrap();
        assert!(!waited.complete && !waited.suspends());

        let done = wf.step(&mut ctx).await.unwrap();
        assert!(done.complete);
        assert_eq!(done.status, StepStatus::Ok);
    }

    #[tokio::test]
    async fn completion_signal_drives_the_result() {
        let f = fixture(NullScript::default()).await;
        let mut ctx = bound_context(&f, CommandState::new("make lint")).await;
        let mut wf = f.factory.load(&ctx.task).unwrap();
        wf.step(&mut ctx).await.unwrap();

        let saved: CommandState = serde_json::from_value(wf.snapshot()).unwrap();
        let info = saved.process.info.clone().unwrap();
        let payload = DomainSignal::Container(ContainerSignal {
            pid: info.pid.clone(),
            report: ProcessReport {
                start_time: info.start_time,
                exit_code: Some(3),
                exit_message: Some("3 lint errors".into()),
                ..Default::default()
            },
            queue_name: None,
            state: None,
            logs: None,
            disk_use: None,
        })
        .to_object();
        f.signals
            .deliver(saved.signal_uuid.unwrap(), &payload)
            .await
            .unwrap();

        ctx.signals = f.signals.consume_pending(ctx.task.id).await.unwrap();
        wf.step(&mut ctx).await.unwrap();
        ctx.signals.clear();

        let done = wf.step(&mut ctx).await.unwrap();
        assert_eq!(done.status, StepStatus::UserError);
        assert_eq!(done.message, "3 lint errors");
        assert_eq!(wf.wip().message().as_deref(), Some("3 lint errors"));
    }

    #[tokio::test]
    async fn recorded_result_completes_when_the_signal_missed_the_step() {
        let f = fixture(NullScript::default()).await;
        let mut ctx = bound_context(&f, CommandState::new("make docs")).await;
        let mut wf = f.factory.load(&ctx.task).unwrap();
        wf.step(&mut ctx).await.unwrap();

        let saved: CommandState = serde_json::from_value(wf.snapshot()).unwrap();
        let info = saved.process.info.clone().unwrap();
        let payload = DomainSignal::Container(ContainerSignal {
            pid: info.pid.clone(),
            report: ProcessReport {
                start_time: info.start_time,
                exit_code: Some(0),
                exit_message: Some("docs built".into()),
                ..Default::default()
            },
            queue_name: None,
            state: None,
            logs: None,
            disk_use: None,
        })
        .to_object();
        f.signals
            .deliver(saved.signal_uuid.unwrap(), &payload)
            .await
            .unwrap();
        // Consumed elsewhere; this step never sees it.
        assert_eq!(f.signals.consume_pending(ctx.task.id).await.unwrap().len(), 1);

        wf.step(&mut ctx).await.unwrap();
        let done = wf.step(&mut ctx).await.unwrap();
        assert_eq!(done.status, StepStatus::Ok);
        assert_eq!(done.message, "docs built");
    }

    #[tokio::test]
    async fn state_survives_a_reload_between_steps() {
        let f = fixture(NullScript::default()).await;
        let mut ctx = bound_context(&f, CommandState::new("sleep 600")).await;
        let mut wf = f.factory.load(&ctx.task).unwrap();
        wf.step(&mut ctx).await.unwrap();

        f.db.save_task_state(ctx.task.id, &wf.snapshot()).await.unwrap();
        let task = f.db.get_task(ctx.task.id).await.unwrap().unwrap();
        let reloaded = f.factory.load(&task).unwrap();
        assert_eq!(reloaded.message().as_deref(), Some("command in stage wait"));
    }

    #[tokio::test]
    async fn terminate_kills_the_process() {
        let f = fixture(NullScript::default()).await;
        let mut ctx = bound_context(&f, CommandState::new("sleep 600")).await;
        let mut wf = f.factory.load(&ctx.task).unwrap();
        wf.step(&mut ctx).await.unwrap();

        WipPool::new(f.db.clone()).terminate(ctx.task.id).await.unwrap();
        ctx.signals = f.signals.consume_pending(ctx.task.id).await.unwrap();

        let result = wf.step(&mut ctx).await.unwrap();
        assert!(result.complete);
        assert_eq!(result.status, StepStatus::Terminated);
    }

    #[tokio::test]
    async fn launch_failure_ends_as_user_error() {
        let f = fixture(NullScript {
            never_starts: true,
            ..Default::default()
        })
        .await;
        let mut ctx = bound_context(&f, CommandState::new("false")).await;
        let mut wf = f.factory.load(&ctx.task).unwrap();
        wf.step(&mut ctx).await.unwrap();
        wf.step(&mut ctx).await.unwrap();

        let done = wf.step(&mut ctx).await.unwrap();
        assert_eq!(done.status, StepStatus::UserError);
        assert!(done.message.contains("before it started"));
    }

    #[tokio::test]
    async fn empty_or_missing_command_is_corrupt_state() {
        let f = fixture(NullScript::default()).await;
        let mut task = bound_context(&f, CommandState::new("true")).await.task;

        task.state = Value::Null;
        assert!(matches!(
            f.factory.load(&task).err(),
            Some(WorkflowError::CorruptState { .. })
        ));

        task.state = serde_json::json!({"command": "  "});
        assert!(matches!(
            f.factory.load(&task).err(),
            Some(WorkflowError::CorruptState { .. })
        ));
    }
}
