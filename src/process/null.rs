//! In-process backend with scripted behaviour, used for dry runs and tests.
//!
//! When a `CallbackClient` is attached and the launch environment carries a
//! signal URL, the backend plays the remote side and posts a
//! `container_process` completion to that URL.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::process::{
    Backend, BackendKind, BackendStatus, Endpoints, LaunchSpec, ProcessInfo, SIGNAL_URL_ENV,
};
use crate::signal::CallbackClient;
use crate::signal::kinds::CLASS_CONTAINER;

/// How every process launched by a `NullBackend` behaves.
#[derive(Debug, Clone, Default)]
pub struct NullScript {
    /// Status polls answered with `Pending` before the process runs.
    pub pending_polls: u32,
    /// Status polls answered with `Running` before it stops. Only applies
    /// when `exit_code` is set; otherwise it runs until killed.
    pub running_polls: u32,
    pub exit_code: Option<i64>,
    /// Report a stop without ever running.
    pub never_starts: bool,
    /// Fail `run()` outright.
    pub refuse_launch: bool,
    /// Delay before posting the completion callback.
    pub callback_delay: Duration,
}

#[derive(Debug, Default)]
struct Instance {
    polls: u32,
    killed: bool,
}

pub struct NullBackend {
    script: NullScript,
    callback: Option<CallbackClient>,
    instances: Mutex<HashMap<String, Instance>>,
    next_id: AtomicU64,
    total_polls: AtomicU64,
}

impl NullBackend {
    pub fn new(script: NullScript) -> Self {
        Self {
            script,
            callback: None,
            instances: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            total_polls: AtomicU64::new(0),
        }
    }

    /// Post completion signals to the launch's callback URL.
    pub fn with_callback(mut self, client: CallbackClient) -> Self {
        self.callback = Some(client);
        self
    }

    /// Number of status polls answered so far.
    pub fn polls(&self) -> u64 {
        self.total_polls.load(Ordering::SeqCst)
    }

    fn spawn_callback(&self, url: String, info: &ProcessInfo) {
        let Some(client) = self.callback.clone() else {
            return;
        };
        let delay = self.script.callback_delay;
        let exit_code = self.script.exit_code.unwrap_or(0);
        let pid = info.pid.clone();
        let start_time = info.start_time;

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let body = json!({
                "classId": CLASS_CONTAINER,
                "pid": pid,
                "startTime": start_time,
                "endTime": Utc::now().timestamp(),
                "exitCode": exit_code,
                "exitMessage": format!("exited with code {exit_code}"),
            });
            client.notify(&url, &body).await;
        });
    }
}

#[async_trait]
impl Backend for NullBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Null
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessInfo, ProcessError> {
        if self.script.refuse_launch {
            return Err(ProcessError::CommandFailed {
                backend: "null".into(),
                reason: "launch refused by script".into(),
            });
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let info = ProcessInfo {
            backend: BackendKind::Null,
            server: spec.server.clone(),
            pid: format!("null-{n}"),
            start_time: Utc::now().timestamp(),
            ports: spec.ports.clone(),
        };
        self.instances
            .lock()
            .await
            .insert(info.pid.clone(), Instance::default());
        debug!(task_id = spec.task_id, pid = %info.pid, command = %spec.command, "Null process launched");

        if !self.script.never_starts {
            if let Some(url) = spec.env.get(SIGNAL_URL_ENV) {
                self.spawn_callback(url.clone(), &info);
            }
        }
        Ok(info)
    }

    async fn status(&self, info: &ProcessInfo) -> Result<BackendStatus, ProcessError> {
        self.total_polls.fetch_add(1, Ordering::SeqCst);
        let mut instances = self.instances.lock().await;
        let Some(instance) = instances.get_mut(&info.pid) else {
            warn!(pid = %info.pid, "Status requested for unknown null process");
            return Ok(BackendStatus::Stopped {
                ran: false,
                exit_code: None,
            });
        };

        let seen = instance.polls;
        instance.polls += 1;

        if instance.killed {
            return Ok(BackendStatus::Stopped {
                ran: true,
                exit_code: Some(137),
            });
        }
        if self.script.never_starts {
            return Ok(BackendStatus::Stopped {
                ran: false,
                exit_code: None,
            });
        }
        if seen < self.script.pending_polls {
            return Ok(BackendStatus::Pending);
        }
        match self.script.exit_code {
            Some(code) if seen >= self.script.pending_polls + self.script.running_polls => {
                Ok(BackendStatus::Stopped {
                    ran: true,
                    exit_code: Some(code),
                })
            }
            _ => Ok(BackendStatus::Running),
        }
    }

    async fn kill(&self, info: &ProcessInfo) -> Result<(), ProcessError> {
        let mut instances = self.instances.lock().await;
        match instances.get_mut(&info.pid) {
            Some(instance) => {
                instance.killed = true;
                Ok(())
            }
            None => Err(ProcessError::CommandFailed {
                backend: "null".into(),
                reason: format!("no such process {}", info.pid),
            }),
        }
    }

    async fn endpoints(&self, info: &ProcessInfo) -> Result<Option<Endpoints>, ProcessError> {
        let ports: BTreeMap<String, u16> = info
            .ports
            .iter()
            .enumerate()
            .map(|(i, port)| (format!("{port}/tcp"), 30000 + i as u16))
            .collect();
        Ok(Some(Endpoints {
            host: "127.0.0.1".into(),
            ports,
        }))
    }
}
