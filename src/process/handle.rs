//! Per-instance process lifecycle.
//!
//! `not-started → started → configured → completed | failed`. Positive
//! answers are cached so the predicates are cheap to poll; the state can be
//! snapshotted into a workflow's persisted JSON and restored on the next step.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ProcessError;
use crate::process::{Backend, BackendStatus, Endpoints, LaunchSpec, ProcessInfo};
use crate::signal::kinds::{DomainSignal, Timers};

/// Typed outcome of a process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessResult {
    pub process_id: String,
    /// `None` when the process never reported one.
    pub exit_code: Option<i64>,
    pub message: String,
    /// Unix seconds.
    pub start_time: i64,
    pub end_time: i64,
    #[serde(default)]
    pub timers: Timers,
}

impl ProcessResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn duration_secs(&self) -> i64 {
        (self.end_time - self.start_time).max(0)
    }
}

/// Serializable lifecycle state of a handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub info: Option<ProcessInfo>,
    #[serde(default)]
    pub started: bool,
    #[serde(default)]
    pub configured: bool,
    #[serde(default)]
    pub completed: bool,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub endpoints: Option<Endpoints>,
    #[serde(default)]
    pub result: Option<ProcessResult>,
}

pub struct ProcessHandle {
    backend: Arc<dyn Backend>,
    state: ProcessState,
}

impl ProcessHandle {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            state: ProcessState::default(),
        }
    }

    pub fn restore(backend: Arc<dyn Backend>, state: ProcessState) -> Self {
        Self { backend, state }
    }

    pub fn snapshot(&self) -> ProcessState {
        self.state.clone()
    }

    pub fn info(&self) -> Option<&ProcessInfo> {
        self.state.info.as_ref()
    }

    pub fn result(&self) -> Option<&ProcessResult> {
        self.state.result.as_ref()
    }

    pub fn unique_process_id(&self) -> Option<String> {
        self.state.info.as_ref().map(ProcessInfo::unique_id)
    }

    fn require_info(&self) -> Result<&ProcessInfo, ProcessError> {
        self.state.info.as_ref().ok_or(ProcessError::NotStarted)
    }

    /// Launch through the backend.
    pub async fn run(&mut self, spec: &LaunchSpec) -> Result<&ProcessInfo, ProcessError> {
        let info = self.backend.run(spec).await?;
        info!(
            task_id = spec.task_id,
            backend = %info.backend,
            process_id = %info.unique_id(),
            "Process launched"
        );
        self.state = ProcessState {
            info: Some(info),
            ..ProcessState::default()
        };
        self.require_info()
    }

    /// Ask the backend for the next status and fold it into the lifecycle.
    async fn observe(&mut self) -> Result<BackendStatus, ProcessError> {
        let info = self.require_info()?.clone();
        let status = self.backend.status(&info).await?;
        match &status {
            BackendStatus::Pending => {}
            BackendStatus::Running => self.state.started = true,
            BackendStatus::Stopped { ran: true, exit_code } => {
                self.state.started = true;
                if self.state.result.is_none() {
                    self.state.result = Some(self.result_from_exit(*exit_code, None));
                }
                self.state.completed = true;
            }
            BackendStatus::Stopped { ran: false, .. } => {
                if !self.state.started {
                    self.state.failed = true;
                    warn!(process_id = %info.unique_id(), "Process stopped before starting");
                }
            }
        }
        Ok(status)
    }

    /// Whether the process has ever been seen running. Cached once true.
    pub async fn has_started(&mut self) -> Result<bool, ProcessError> {
        if self.state.started {
            return Ok(true);
        }
        if self.state.info.is_none() || self.state.failed {
            return Ok(false);
        }
        self.observe().await?;
        Ok(self.state.started)
    }

    /// Started and host/port bindings resolved.
    pub async fn is_configured(&mut self) -> Result<bool, ProcessError> {
        if self.state.configured {
            return Ok(true);
        }
        if !self.has_started().await? {
            return Ok(false);
        }
        if self.load_host_and_ports().await?.is_some() {
            self.state.configured = true;
        }
        Ok(self.state.configured)
    }

    /// True once the backend reports a stop without the process ever starting.
    pub async fn launch_failed(&mut self) -> Result<bool, ProcessError> {
        if self.state.failed {
            return Ok(true);
        }
        if self.state.started || self.state.info.is_none() {
            return Ok(false);
        }
        self.observe().await?;
        Ok(self.state.failed)
    }

    pub async fn has_stopped(&mut self) -> Result<bool, ProcessError> {
        if self.state.completed || self.state.failed {
            return Ok(true);
        }
        if self.state.info.is_none() {
            return Ok(false);
        }
        let status = self.observe().await?;
        Ok(matches!(status, BackendStatus::Stopped { .. }))
    }

    pub async fn kill(&mut self) -> Result<(), ProcessError> {
        let info = self.require_info()?.clone();
        self.backend.kill(&info).await?;
        info!(process_id = %info.unique_id(), "Process killed");
        if self.state.result.is_none() {
            self.state.result = Some(self.result_from_exit(None, Some("killed")));
        }
        self.state.completed = true;
        Ok(())
    }

    /// Resolve and cache host/port bindings.
    pub async fn load_host_and_ports(&mut self) -> Result<Option<&Endpoints>, ProcessError> {
        if self.state.endpoints.is_none() {
            let info = self.require_info()?.clone();
            self.state.endpoints = self.backend.endpoints(&info).await?;
            if let Some(endpoints) = &self.state.endpoints {
                debug!(host = %endpoints.host, ports = endpoints.ports.len(), "Endpoints resolved");
            }
        }
        Ok(self.state.endpoints.as_ref())
    }

    pub fn host(&self) -> Option<&str> {
        self.state.endpoints.as_ref().map(|e| e.host.as_str())
    }

    /// Published port for a port type such as `"8080/tcp"`.
    pub fn port(&self, port_type: &str) -> Option<u16> {
        self.state
            .endpoints
            .as_ref()
            .and_then(|e| e.ports.get(port_type).copied())
    }

    /// Convert a completion signal into a result and mark the handle complete.
    ///
    /// Missing fields fall back to what the handle already knows.
    pub fn result_from_signal(&mut self, signal: &DomainSignal) -> ProcessResult {
        let now = Utc::now().timestamp();
        let known_start = self.state.info.as_ref().map(|i| i.start_time);
        let process_id = self
            .unique_process_id()
            .unwrap_or_else(|| signal.process_key());

        let result = match signal.report() {
            Some(report) => ProcessResult {
                process_id,
                exit_code: report.exit_code,
                message: report.exit_message.clone().unwrap_or_default(),
                start_time: known_start.unwrap_or(report.start_time),
                end_time: report.end_time.unwrap_or(now),
                timers: report.timers.clone(),
            },
            None => ProcessResult {
                process_id,
                exit_code: None,
                message: String::new(),
                start_time: known_start.unwrap_or(now),
                end_time: now,
                timers: Timers::new(),
            },
        };

        self.state.started = true;
        self.state.completed = true;
        self.state.result = Some(result.clone());
        result
    }

    /// Give up on the process and synthesize a terminal result.
    pub fn force_fail(&mut self, message: &str) -> ProcessResult {
        let result = self.result_from_exit(None, Some(message));
        warn!(process_id = %result.process_id, message, "Process force-failed");
        self.state.failed = true;
        self.state.result = Some(result.clone());
        result
    }

    fn result_from_exit(&self, exit_code: Option<i64>, message: Option<&str>) -> ProcessResult {
        let now = Utc::now().timestamp();
        ProcessResult {
            process_id: self.unique_process_id().unwrap_or_default(),
            exit_code,
            message: message
                .map(str::to_string)
                .or_else(|| exit_code.map(|code| format!("exited with code {code}")))
                .unwrap_or_default(),
            start_time: self.state.info.as_ref().map_or(now, |i| i.start_time),
            end_time: now,
            timers: Timers::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{NullBackend, NullScript};
    use crate::signal::kinds::{ContainerSignal, ProcessReport};

    fn spec() -> LaunchSpec {
        LaunchSpec::new(1, "local", "true").with_port(8080)
    }

    #[tokio::test]
    async fn lifecycle_started_configured_completed() {
        let backend = Arc::new(NullBackend::new(NullScript {
            pending_polls: 1,
            exit_code: Some(0),
            ..Default::default()
        }));
        let mut handle = ProcessHandle::new(backend.clone());

        assert!(!handle.has_started().await.unwrap());
        handle.run(&spec()).await.unwrap();
        assert!(!handle.has_started().await.unwrap());
        assert!(handle.has_started().await.unwrap());
        // Cached: no further backend polls.
        let polls = backend.polls();
        assert!(handle.has_started().await.unwrap());
        assert_eq!(backend.polls(), polls);

        assert!(handle.is_configured().await.unwrap());
        assert_eq!(handle.host(), Some("127.0.0.1"));
        assert!(handle.port("8080/tcp").is_some());
        assert!(!handle.launch_failed().await.unwrap());
    }

    #[tokio::test]
    async fn launch_failure_is_detected() {
        let backend = Arc::new(NullBackend::new(NullScript {
            never_starts: true,
            ..Default::default()
        }));
        let mut handle = ProcessHandle::new(backend);
        handle.run(&spec()).await.unwrap();

        assert!(handle.launch_failed().await.unwrap());
        assert!(!handle.has_started().await.unwrap());
        assert!(handle.has_stopped().await.unwrap());
    }

    #[tokio::test]
    async fn signal_result_tolerates_missing_fields() {
        let backend = Arc::new(NullBackend::new(NullScript::default()));
        let mut handle = ProcessHandle::new(backend);
        let info = handle.run(&spec()).await.unwrap().clone();

        let signal = DomainSignal::Container(ContainerSignal {
            pid: info.pid.clone(),
            report: ProcessReport {
                start_time: info.start_time,
                ..Default::default()
            },
            queue_name: None,
            state: None,
            logs: None,
            disk_use: None,
        });
        let result = handle.result_from_signal(&signal);

        assert_eq!(result.process_id, info.unique_id());
        assert_eq!(result.exit_code, None);
        assert!(!result.succeeded());
        assert!(handle.has_stopped().await.unwrap());
    }

    #[tokio::test]
    async fn snapshot_restores_lifecycle() {
        let backend = Arc::new(NullBackend::new(NullScript::default()));
        let mut handle = ProcessHandle::new(backend.clone());
        handle.run(&spec()).await.unwrap();
        assert!(handle.has_started().await.unwrap());

        let state = serde_json::to_value(handle.snapshot()).unwrap();
        let restored: ProcessState = serde_json::from_value(state).unwrap();
        let mut again = ProcessHandle::restore(backend, restored);
        assert!(again.has_started().await.unwrap());
        assert_eq!(again.unique_process_id(), handle.unique_process_id());
    }

    #[tokio::test]
    async fn force_fail_synthesizes_timing() {
        let backend = Arc::new(NullBackend::new(NullScript::default()));
        let mut handle = ProcessHandle::new(backend);
        handle.run(&spec()).await.unwrap();

        let result = handle.force_fail("container never started");
        assert_eq!(result.message, "container never started");
        assert!(result.end_time >= result.start_time);
        assert!(handle.launch_failed().await.unwrap());
    }

    #[tokio::test]
    async fn operations_before_run_fail_cleanly() {
        let backend = Arc::new(NullBackend::new(NullScript::default()));
        let mut handle = ProcessHandle::new(backend);
        assert!(matches!(handle.kill().await, Err(ProcessError::NotStarted)));
        assert!(!handle.has_stopped().await.unwrap());
        assert!(!handle.launch_failed().await.unwrap());
    }
}
