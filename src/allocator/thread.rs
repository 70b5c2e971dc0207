//! Thread records: one claimed execution slot binding a task to a server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Running,
    Finished,
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Finished => "finished",
        }
    }
}

impl std::str::FromStr for ThreadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            other => Err(format!("unknown thread status '{other}'")),
        }
    }
}

/// A durable slot binding. The row is the source of truth for
/// "this task occupies a slot on this server".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub server_id: i64,
    pub task_id: i64,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Backend-specific process data recorded by the running workflow.
    pub process_data: serde_json::Value,
}

impl Thread {
    pub fn is_running(&self) -> bool {
        self.status == ThreadStatus::Running
    }
}
