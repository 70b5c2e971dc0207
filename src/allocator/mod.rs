//! Slot allocation: servers, threads and the allocator loop.

pub mod server;
pub mod thread;
pub mod thread_pool;

pub use server::{Server, Slot, balanced_slots};
pub use thread::{Thread, ThreadStatus};
pub use thread_pool::{DispatchOutcome, PassReport, ThreadPool};
