//! Process backends: one uniform capability interface over remote work.
//!
//! A `Backend` launches, inspects, kills and locates a unit of work. The
//! per-instance lifecycle (started → configured → completed | failed) lives
//! in `ProcessHandle`, which is backend-agnostic.

pub mod completion;
pub mod container;
pub mod handle;
pub mod null;
pub mod ssh;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProcessError;
use crate::signal::kinds::{container_process_id, ssh_process_id};

pub use completion::{check_completion, wait_for_completion};
pub use container::DockerBackend;
pub use handle::{ProcessHandle, ProcessResult, ProcessState};
pub use null::{NullBackend, NullScript};
pub use ssh::SshBackend;

/// Environment variable carrying the callback URL into launched work.
pub const SIGNAL_URL_ENV: &str = "WIP_SIGNAL_URL";
/// Process id reported back in the completion signal (defaults to the shell pid).
pub const PROCESS_PID_ENV: &str = "WIP_PROCESS_PID";
/// Start time (unix seconds) reported back in the completion signal.
pub const PROCESS_START_ENV: &str = "WIP_PROCESS_START";
pub const PROCESS_SERVER_ENV: &str = "WIP_PROCESS_SERVER";

/// Attempts made by launched work to post its completion signal.
const CALLBACK_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Ssh,
    Docker,
    Null,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Docker => "docker",
            Self::Null => "null",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to launch and where.
#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub task_id: i64,
    /// Host the work runs on (SSH target, or the slot's server name).
    pub server: String,
    /// Shell command line.
    pub command: String,
    pub env: BTreeMap<String, String>,
    /// Container ports to publish.
    pub ports: Vec<u16>,
}

impl LaunchSpec {
    pub fn new(task_id: i64, server: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            task_id,
            server: server.into(),
            command: command.into(),
            ..Default::default()
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
}

/// Identity of one launched process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub backend: BackendKind,
    pub server: String,
    /// OS pid for SSH, container id otherwise.
    pub pid: String,
    /// Unix seconds, as reported back in completion signals.
    pub start_time: i64,
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl ProcessInfo {
    /// Correlation key; matches `DomainSignal::process_key` for the same process.
    pub fn unique_id(&self) -> String {
        match self.backend {
            BackendKind::Ssh => ssh_process_id(&self.server, &self.pid, self.start_time),
            BackendKind::Docker | BackendKind::Null => {
                container_process_id(&self.pid, self.start_time)
            }
        }
    }
}

/// Backend's view of a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendStatus {
    /// Accepted but not yet running.
    Pending,
    Running,
    /// No longer running. `ran` is false when it never got going.
    Stopped { ran: bool, exit_code: Option<i64> },
}

/// Host and published ports of a running process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoints {
    pub host: String,
    /// Keyed by port type, e.g. `"8080/tcp"`.
    pub ports: BTreeMap<String, u16>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Launch the work and return as soon as it has been accepted.
    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessInfo, ProcessError>;

    async fn status(&self, info: &ProcessInfo) -> Result<BackendStatus, ProcessError>;

    async fn kill(&self, info: &ProcessInfo) -> Result<(), ProcessError>;

    /// `None` while bindings are not yet available.
    async fn endpoints(&self, info: &ProcessInfo) -> Result<Option<Endpoints>, ProcessError>;
}

/// Wrap a command line so that, when it exits, it posts a completion signal
/// of kind `class_id` to `$WIP_SIGNAL_URL` (if set) and exits with the
/// command's own code. Delivery is retried a few times; the runtime never
/// retries on its side.
pub fn wrap_with_callback(class_id: &str, command: &str) -> String {
    format!(
        r#"{command}
code=$?
end=$(date +%s)
if [ -n "${{{url}:-}}" ]; then
  body="{{\"classId\":\"{class_id}\",\"server\":\"${{{server}:-}}\",\"pid\":\"${{{pid}:-$$}}\",\"startTime\":${{{start}:-0}},\"endTime\":$end,\"exitCode\":$code}}"
  i=0
  while [ $i -lt {attempts} ]; do
    if command -v curl >/dev/null 2>&1; then
      curl -fsS -m 10 -X POST -H 'Content-Type: application/json' --data "$body" "${{{url}}}" >/dev/null && break
    else
      wget -q -O /dev/null --header='Content-Type: application/json' --post-data="$body" "${{{url}}}" && break
    fi
    i=$((i + 1))
    sleep 2
  done
fi
exit $code"#,
        url = SIGNAL_URL_ENV,
        server = PROCESS_SERVER_ENV,
        pid = PROCESS_PID_ENV,
        start = PROCESS_START_ENV,
        attempts = CALLBACK_ATTEMPTS,
    )
}

/// Quote a string for a POSIX shell.
pub(crate) fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
