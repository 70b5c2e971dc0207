//! Persistence layer: libSQL-backed storage for tasks, slots, signals and task logs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    Database, GroupStore, QueueStore, ServerStore, SignalStore, TaskLogEntry, TaskLogStore,
    ThreadStore,
};
