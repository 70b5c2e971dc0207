//! WIP runtime: durable task queue, slot allocator, worker loop, process
//! backends and the signal protocol that reports remote completion.

pub mod allocator;
pub mod config;
pub mod error;
pub mod process;
pub mod queue;
pub mod signal;
pub mod store;
pub mod worker;
pub mod workflow;
