//! Task queue: the persisted task model and the `WipPool` that selects,
//! claims and completes tasks.

pub mod model;
pub mod pool;

pub use model::{ConcurrencyGroup, ExitStatus, NewTask, RunStatus, Task};
pub use pool::WipPool;
