//! Worker system: drives one claimed task's state machine per invocation.
//!
//! - `iterator`: the `StateIterator` contract, step results and the registry
//!   that rebuilds iterators from persisted task state
//! - `worker`: `WipWorker`, the claim/step/suspend/complete loop

pub mod iterator;
pub mod worker;

pub use iterator::{
    IteratorResult, StateIterator, StepContext, StepStatus, WorkflowFactory, WorkflowObject,
    WorkflowRegistry,
};
pub use worker::{WipWorker, WorkerDeps};
