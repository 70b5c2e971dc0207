//! The state-machine interface the worker drives, and the registry that
//! rebuilds iterators from persisted task state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::allocator::thread::Thread;
use crate::error::{Result, WorkflowError};
use crate::queue::model::{ExitStatus, Task};
use crate::signal::{ConsumedSignal, SignalType};

/// Outcome status reported by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    /// System-side failure.
    Error,
    /// Failure caused by the task's input or command.
    UserError,
    Timeout,
    Terminated,
}

impl StepStatus {
    pub fn exit_status(&self) -> ExitStatus {
        match self {
            Self::Ok => ExitStatus::Success,
            Self::Error => ExitStatus::ErrorSystem,
            Self::UserError => ExitStatus::ErrorUser,
            Self::Timeout => ExitStatus::ErrorTimeout,
            Self::Terminated => ExitStatus::Terminated,
        }
    }
}

/// Result of one iterator step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IteratorResult {
    /// Seconds until the next step is due.
    pub wait: u64,
    /// Keep stepping in this invocation even though `wait` is set.
    pub exec: bool,
    pub complete: bool,
    pub status: StepStatus,
    pub message: String,
}

impl IteratorResult {
    /// Step again right away.
    pub fn proceed() -> Self {
        Self {
            wait: 0,
            exec: true,
            complete: false,
            status: StepStatus::Ok,
            message: String::new(),
        }
    }

    /// Suspend for `secs` seconds.
    pub fn wait(secs: u64) -> Self {
        Self {
            wait: secs,
            exec: false,
            ..Self::proceed()
        }
    }

    pub fn done(status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            wait: 0,
            exec: false,
            complete: true,
            status,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::done(StepStatus::Ok, message)
    }

    /// Whether this result ends the current `process()` call without completing.
    pub fn suspends(&self) -> bool {
        !self.complete && self.wait > 0 && !self.exec
    }
}

/// What a step can see: the task row, its slot and the signals consumed for it.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub task: Task,
    pub thread: Option<Thread>,
    /// Name of the server the task's thread is bound to.
    pub server_name: Option<String>,
    pub signals: Vec<ConsumedSignal>,
}

impl StepContext {
    pub fn terminate_requested(&self) -> bool {
        self.task.terminating
            || self
                .signals
                .iter()
                .any(|s| s.signal.signal_type == SignalType::Terminate)
    }
}

/// The business object a workflow operates on.
pub trait WorkflowObject: Send + Sync {
    /// Most specific diagnostic the object holds, if any.
    fn message(&self) -> Option<String>;
}

#[async_trait]
pub trait StateIterator: Send + Sync {
    /// Execute exactly one state transition.
    async fn step(&mut self, ctx: &mut StepContext) -> Result<IteratorResult>;

    fn wip(&self) -> &dyn WorkflowObject;

    /// The iterator's own message, e.g. a description of its current state.
    fn message(&self) -> Option<String>;

    /// State persisted on the task between steps.
    fn snapshot(&self) -> serde_json::Value;
}

/// Rebuilds iterators of one workflow class from task state.
pub trait WorkflowFactory: Send + Sync {
    fn class_id(&self) -> &str;

    fn load(&self, task: &Task) -> std::result::Result<Box<dyn StateIterator>, WorkflowError>;
}

#[derive(Default, Clone)]
pub struct WorkflowRegistry {
    factories: HashMap<String, Arc<dyn WorkflowFactory>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, factory: Arc<dyn WorkflowFactory>) {
        self.factories
            .insert(factory.class_id().to_string(), factory);
    }

    pub fn with(mut self, factory: Arc<dyn WorkflowFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn load(&self, task: &Task) -> std::result::Result<Box<dyn StateIterator>, WorkflowError> {
        self.factories
            .get(&task.class_id)
            .ok_or_else(|| WorkflowError::UnknownClass(task.class_id.clone()))?
            .load(task)
    }

    pub fn class_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_rules() {
        assert!(IteratorResult::wait(5).suspends());
        assert!(!IteratorResult::proceed().suspends());
        assert!(!IteratorResult::success("ok").suspends());

        let mut eager = IteratorResult::wait(5);
        eager.exec = true;
        assert!(!eager.suspends());
    }

    #[test]
    fn step_status_maps_to_exit_status() {
        assert_eq!(StepStatus::Ok.exit_status(), ExitStatus::Success);
        assert_eq!(StepStatus::UserError.exit_status(), ExitStatus::ErrorUser);
        assert_eq!(StepStatus::Timeout.exit_status(), ExitStatus::ErrorTimeout);
    }

    #[test]
    fn empty_registry_lists_no_classes() {
        let registry = WorkflowRegistry::new();
        assert!(registry.class_ids().is_empty());
    }
}
