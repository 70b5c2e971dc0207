//! Task model: run/exit status, concurrency groups, and the persisted task row.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Enqueued, never claimed.
    NotStarted,
    /// Claimed by a worker under a valid lease.
    Processing,
    /// Suspended between steps; still bound to its thread.
    Waiting,
    /// Finished with an exit status.
    Complete,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Processing => "processing",
            Self::Waiting => "waiting",
            Self::Complete => "complete",
        }
    }

    /// Whether the task occupies an execution slot in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Processing | Self::Waiting)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "processing" => Ok(Self::Processing),
            "waiting" => Ok(Self::Waiting),
            "complete" => Ok(Self::Complete),
            other => Err(format!("unknown run status '{other}'")),
        }
    }
}

/// Outcome of a finished task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitStatus {
    #[serde(rename = "not-finished")]
    NotFinished,
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "error-system")]
    ErrorSystem,
    #[serde(rename = "error-user")]
    ErrorUser,
    #[serde(rename = "error-timeout")]
    ErrorTimeout,
    #[serde(rename = "terminated")]
    Terminated,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFinished => "not-finished",
            Self::Success => "success",
            Self::ErrorSystem => "error-system",
            Self::ErrorUser => "error-user",
            Self::ErrorTimeout => "error-timeout",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, Self::NotFinished | Self::Success)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-finished" => Ok(Self::NotFinished),
            "success" => Ok(Self::Success),
            "error-system" => Ok(Self::ErrorSystem),
            "error-user" => Ok(Self::ErrorUser),
            "error-timeout" => Ok(Self::ErrorTimeout),
            "terminated" => Ok(Self::Terminated),
            other => Err(format!("unknown exit status '{other}'")),
        }
    }
}

/// A concurrency group and its limit on simultaneously active tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyGroup {
    pub name: String,
    pub max_concurrent: i64,
}

/// A persisted unit of schedulable workflow work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// Namespace key shared by related tasks.
    pub work_id: String,
    pub parent_id: Option<i64>,
    pub name: String,
    pub group_name: String,
    /// Lower is more urgent.
    pub priority: i64,
    pub run_status: RunStatus,
    pub exit_status: ExitStatus,
    pub terminating: bool,
    /// Escapes the deferral applied to terminating tasks.
    pub prioritized: bool,
    pub paused: bool,
    /// Earliest time the task may run again.
    pub wake_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub completed_time: Option<DateTime<Utc>>,
    pub claim_time: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub lease: Duration,
    pub max_run_time: Option<Duration>,
    pub exit_message: String,
    /// External object this task operates on; at most one active task per resource.
    pub resource_id: Option<String>,
    /// Workflow class that owns the persisted state.
    pub class_id: String,
    pub job_id: Option<String>,
    /// Persisted workflow object / iterator state.
    pub state: serde_json::Value,
    /// Incremented on every claim transition; used for compare-and-set.
    pub version: i64,
}

impl Task {
    /// Whether a worker holds an unexpired claim at `now`.
    pub fn has_valid_claim(&self, now: DateTime<Utc>) -> bool {
        if self.run_status != RunStatus::Processing {
            return false;
        }
        match (self.claim_time, chrono::Duration::from_std(self.lease)) {
            (Some(claimed), Ok(lease)) => now < claimed + lease,
            _ => false,
        }
    }

    /// Whether the task is due at `now` (no wake time, or wake time passed).
    pub fn is_awake(&self, now: DateTime<Utc>) -> bool {
        self.wake_time.is_none_or(|wake| wake <= now)
    }

    /// Time spent since first start, if started.
    pub fn run_time(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.start_time
            .map(|start| (now - start).to_std().unwrap_or(Duration::ZERO))
    }

    /// Whether the task has exceeded its configured maximum run time.
    pub fn exceeded_max_run_time(&self, now: DateTime<Utc>) -> bool {
        match (self.max_run_time, self.run_time(now)) {
            (Some(max), Some(ran)) => ran > max,
            _ => false,
        }
    }
}

/// Parameters for enqueueing a new task.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub work_id: String,
    pub parent_id: Option<i64>,
    pub name: String,
    pub group_name: String,
    pub priority: i64,
    pub prioritized: bool,
    pub wake_time: Option<DateTime<Utc>>,
    pub lease: Duration,
    pub max_run_time: Option<Duration>,
    pub resource_id: Option<String>,
    pub class_id: String,
    pub job_id: Option<String>,
    pub state: serde_json::Value,
}

impl NewTask {
    pub fn new(name: impl Into<String>, class_id: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            work_id: name.clone(),
            parent_id: None,
            name,
            group_name: "default".to_string(),
            priority: 100,
            prioritized: false,
            wake_time: None,
            lease: Duration::from_secs(120),
            max_run_time: None,
            resource_id: None,
            class_id: class_id.into(),
            job_id: None,
            state: serde_json::Value::Null,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group_name = group.into();
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_work_id(mut self, work_id: impl Into<String>) -> Self {
        self.work_id = work_id.into();
        self
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_wake_time(mut self, wake: DateTime<Utc>) -> Self {
        self.wake_time = Some(wake);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_max_run_time(mut self, max: Duration) -> Self {
        self.max_run_time = Some(max);
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }

    pub fn prioritized(mut self) -> Self {
        self.prioritized = true;
        self
    }
}
