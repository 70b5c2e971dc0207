//! Built-in workflows.

pub mod command;

use std::sync::Arc;

pub use command::{CommandState, CommandWorkflow, CommandWorkflowFactory};

use crate::process::Backend;
use crate::signal::SignalService;
use crate::store::Database;
use crate::worker::WorkflowRegistry;

/// Registry with every built-in workflow class.
pub fn builtin_registry(
    backend: Arc<dyn Backend>,
    signals: Arc<SignalService>,
    db: Arc<dyn Database>,
) -> WorkflowRegistry {
    WorkflowRegistry::new().with(Arc::new(CommandWorkflowFactory::new(backend, signals, db)))
}
