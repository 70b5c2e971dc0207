//! Docker backend: drives the local `docker` CLI.
//!
//! Containers are named up front so the id reported back by the container's
//! completion signal is known before launch. Published ports are resolved
//! lazily with `docker port`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ProcessError;
use crate::process::{
    Backend, BackendKind, BackendStatus, Endpoints, LaunchSpec, PROCESS_PID_ENV,
    PROCESS_SERVER_ENV, PROCESS_START_ENV, ProcessInfo, wrap_with_callback,
};
use crate::signal::kinds::CLASS_CONTAINER;

/// `8080/tcp -> 0.0.0.0:49153`
static PORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\d+/[a-z]+)\s+->\s+(\S+):(\d+)\s*$").expect("port line regex")
});

/// Docker reports this start time for containers that never started.
const NEVER_STARTED: &str = "0001-01-01";

#[derive(Debug, Clone)]
pub struct DockerBackend {
    image: String,
    /// Host advertised for ports bound on all interfaces.
    public_host: String,
    network: Option<String>,
}

impl DockerBackend {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            public_host: "127.0.0.1".to_string(),
            network: None,
        }
    }

    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = host.into();
        self
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = Some(network.into());
        self
    }

    fn run_args(&self, spec: &LaunchSpec, name: &str, start_time: i64) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "--label".to_string(),
            format!("wip.task={}", spec.task_id),
        ];

        if let Some(network) = &self.network {
            args.push(format!("--network={network}"));
        }

        let mut env = spec.env.clone();
        env.insert(PROCESS_PID_ENV.to_string(), name.to_string());
        env.insert(PROCESS_START_ENV.to_string(), start_time.to_string());
        env.insert(PROCESS_SERVER_ENV.to_string(), spec.server.clone());
        for (key, value) in &env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }

        for port in &spec.ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }

        args.push(self.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(wrap_with_callback(CLASS_CONTAINER, &spec.command));
        args
    }

    async fn docker(&self, args: &[String]) -> Result<String, ProcessError> {
        let output = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ProcessError::SpawnFailed {
                program: "docker".into(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProcessError::CommandFailed {
                backend: "docker".into(),
                reason: if stderr.is_empty() {
                    format!("exit code {:?}", output.status.code())
                } else {
                    stderr
                },
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Container name for a launch: unique per task and start second.
fn container_name(task_id: i64, start_time: i64) -> String {
    let suffix: u32 = rand::random();
    format!("wip-{task_id}-{start_time}-{suffix:08x}")
}

/// Parse `docker inspect -f '{{.State.Status}} {{.State.ExitCode}} {{.State.StartedAt}}'`.
pub(crate) fn parse_inspect(output: &str) -> Result<BackendStatus, ProcessError> {
    let bad = || ProcessError::BadOutput {
        backend: "docker".into(),
        output: output.trim().to_string(),
    };
    let mut parts = output.split_whitespace();
    let status = parts.next().ok_or_else(bad)?;
    let exit_code: i64 = parts.next().and_then(|c| c.parse().ok()).ok_or_else(bad)?;
    let started_at = parts.next().unwrap_or(NEVER_STARTED);
    let ran = !started_at.starts_with(NEVER_STARTED);

    Ok(match status {
        "running" | "restarting" | "paused" => BackendStatus::Running,
        "created" if exit_code == 0 => BackendStatus::Pending,
        "created" | "exited" | "dead" | "removing" => BackendStatus::Stopped {
            ran,
            exit_code: Some(exit_code),
        },
        _ => return Err(bad()),
    })
}

/// Parse `docker port` output into port bindings.
pub(crate) fn parse_ports(output: &str, public_host: &str) -> (Option<String>, BTreeMap<String, u16>) {
    let mut host = None;
    let mut ports = BTreeMap::new();
    for caps in PORT_LINE.captures_iter(output) {
        let Ok(port) = caps[3].parse::<u16>() else {
            continue;
        };
        let bound = caps[2].trim_matches(|c| c == '[' || c == ']');
        if host.is_none() {
            host = Some(match bound {
                "0.0.0.0" | "::" => public_host.to_string(),
                other => other.to_string(),
            });
        }
        ports.entry(caps[1].to_string()).or_insert(port);
    }
    (host, ports)
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessInfo, ProcessError> {
        let start_time = Utc::now().timestamp();
        let name = container_name(spec.task_id, start_time);
        let container_id = self.docker(&self.run_args(spec, &name, start_time)).await?;
        info!(
            task_id = spec.task_id,
            name = %name,
            container_id = %container_id.trim(),
            image = %self.image,
            "Container started"
        );

        Ok(ProcessInfo {
            backend: BackendKind::Docker,
            server: spec.server.clone(),
            pid: name,
            start_time,
            ports: spec.ports.clone(),
        })
    }

    async fn status(&self, info: &ProcessInfo) -> Result<BackendStatus, ProcessError> {
        let output = self
            .docker(&[
                "inspect".to_string(),
                "-f".to_string(),
                "{{.State.Status}} {{.State.ExitCode}} {{.State.StartedAt}}".to_string(),
                info.pid.clone(),
            ])
            .await?;
        parse_inspect(&output)
    }

    async fn kill(&self, info: &ProcessInfo) -> Result<(), ProcessError> {
        match self.docker(&["kill".to_string(), info.pid.clone()]).await {
            Ok(_) => Ok(()),
            Err(ProcessError::CommandFailed { reason, .. }) if reason.contains("is not running") => {
                debug!(name = %info.pid, "Container already stopped");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn endpoints(&self, info: &ProcessInfo) -> Result<Option<Endpoints>, ProcessError> {
        if info.ports.is_empty() {
            return Ok(Some(Endpoints {
                host: self.public_host.clone(),
                ports: BTreeMap::new(),
            }));
        }

        let output = self.docker(&["port".to_string(), info.pid.clone()]).await?;
        let (host, ports) = parse_ports(&output, &self.public_host);
        match host {
            Some(host) if !ports.is_empty() => Ok(Some(Endpoints { host, ports })),
            _ => Ok(None),
        }
    }
}
