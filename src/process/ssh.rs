//! SSH backend: runs work on a remote host through the system `ssh` client.
//!
//! The command is detached with `nohup` so the SSH session returns at once.
//! The remote shell records its exit code under `/tmp` for the status poller
//! and posts an `ssh_process` completion signal when a callback URL is set.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::SshConfig;
use crate::error::ProcessError;
use crate::process::{
    Backend, BackendKind, BackendStatus, Endpoints, LaunchSpec, PROCESS_SERVER_ENV,
    PROCESS_START_ENV, ProcessInfo, shell_quote, wrap_with_callback,
};
use crate::signal::kinds::CLASS_SSH;

static LAUNCH_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(\d+)\s+(\d+)\s*$").expect("launch line regex")
});

static STATUS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(running|gone|exited\s+(-?\d+))\s*$").expect("status line regex")
});

pub struct SshBackend {
    config: SshConfig,
}

impl SshBackend {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    /// Arguments for `ssh` up to and including the destination.
    fn ssh_args(&self, host: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.connect_timeout.as_secs()),
            "-p".to_string(),
            self.config.port.to_string(),
        ];
        if let Some(key) = &self.config.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push(format!("{}@{}", self.config.user, host));
        args
    }

    async fn remote(&self, host: &str, script: &str) -> Result<String, ProcessError> {
        let mut args = self.ssh_args(host);
        args.push(script.to_string());

        let output = Command::new("ssh")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ProcessError::SpawnFailed {
                program: "ssh".into(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProcessError::CommandFailed {
                backend: "ssh".into(),
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

/// Remote script that detaches the wrapped command and prints `pid start`.
pub(crate) fn launch_script(spec: &LaunchSpec) -> String {
    let mut exports = String::new();
    for (key, value) in &spec.env {
        exports.push_str(&format!("export {key}={}; ", shell_quote(value)));
    }
    exports.push_str(&format!(
        "export {PROCESS_SERVER_ENV}={}; ",
        shell_quote(&spec.server)
    ));

    // The exit code is kept on the host for the status poller.
    let command = format!(
        "{}\ncode=$?; echo $code > /tmp/wip-$$.exit; (exit $code)",
        spec.command
    );
    let body = wrap_with_callback(CLASS_SSH, &command);

    format!(
        "{exports}start=$(date +%s); export {PROCESS_START_ENV}=$start; \
         nohup sh -c {} >/dev/null 2>&1 & echo \"$! $start\"",
        shell_quote(&body)
    )
}

fn status_script(pid: &str) -> String {
    let pid = shell_quote(pid);
    format!(
        "if kill -0 {pid} 2>/dev/null; then echo running; \
         elif [ -f /tmp/wip-{pid}.exit ]; then echo \"exited $(cat /tmp/wip-{pid}.exit)\"; \
         else echo gone; fi"
    )
}

pub(crate) fn parse_launch_output(output: &str) -> Result<(String, i64), ProcessError> {
    let caps = LAUNCH_LINE
        .captures(output)
        .ok_or_else(|| ProcessError::BadOutput {
            backend: "ssh".into(),
            output: output.trim().to_string(),
        })?;
    let start = caps[2].parse::<i64>().map_err(|_| ProcessError::BadOutput {
        backend: "ssh".into(),
        output: output.trim().to_string(),
    })?;
    Ok((caps[1].to_string(), start))
}

pub(crate) fn parse_status_output(output: &str) -> Result<BackendStatus, ProcessError> {
    let caps = STATUS_LINE
        .captures(output)
        .ok_or_else(|| ProcessError::BadOutput {
            backend: "ssh".into(),
            output: output.trim().to_string(),
        })?;
    Ok(match &caps[1] {
        "running" => BackendStatus::Running,
        "gone" => BackendStatus::Stopped {
            ran: true,
            exit_code: None,
        },
        _ => BackendStatus::Stopped {
            ran: true,
            exit_code: caps.get(2).and_then(|m| m.as_str().parse().ok()),
        },
    })
}

#[async_trait]
impl Backend for SshBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Ssh
    }

    async fn run(&self, spec: &LaunchSpec) -> Result<ProcessInfo, ProcessError> {
        let output = self.remote(&spec.server, &launch_script(spec)).await?;
        let (pid, start_time) = parse_launch_output(&output)?;
        debug!(task_id = spec.task_id, server = %spec.server, pid = %pid, "SSH process detached");

        Ok(ProcessInfo {
            backend: BackendKind::Ssh,
            server: spec.server.clone(),
            pid,
            start_time,
            ports: spec.ports.clone(),
        })
    }

    async fn status(&self, info: &ProcessInfo) -> Result<BackendStatus, ProcessError> {
        let output = self.remote(&info.server, &status_script(&info.pid)).await?;
        parse_status_output(&output)
    }

    async fn kill(&self, info: &ProcessInfo) -> Result<(), ProcessError> {
        let script = format!("kill {} 2>/dev/null || true", shell_quote(&info.pid));
        if let Err(e) = self.remote(&info.server, &script).await {
            warn!(server = %info.server, pid = %info.pid, error = %e, "SSH kill failed");
            return Err(e);
        }
        Ok(())
    }

    async fn endpoints(&self, info: &ProcessInfo) -> Result<Option<Endpoints>, ProcessError> {
        // Work binds directly on the host; ports are not remapped.
        let ports: BTreeMap<String, u16> = info
            .ports
            .iter()
            .map(|port| (format!("{port}/tcp"), *port))
            .collect();
        Ok(Some(Endpoints {
            host: info.server.clone(),
            ports,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn ssh_args_include_key_and_destination() {
        let backend = SshBackend::new(SshConfig {
            user: "runner".into(),
            port: 2222,
            identity_file: Some(PathBuf::from("/keys/id_ed25519")),
            connect_timeout: Duration::from_secs(5),
        });
        let args = backend.ssh_args("node-1");
        assert_eq!(args.last().unwrap(), "runner@node-1");
        assert!(args.contains(&"2222".to_string()));
        assert!(args.contains(&"/keys/id_ed25519".to_string()));
        assert!(args.contains(&"ConnectTimeout=5".to_string()));
    }

    #[test]
    fn launch_script_detaches_and_records_exit() {
        let spec = LaunchSpec::new(7, "node-1", "echo hi").with_env("WIP_SIGNAL_URL", "https://x/y");
        let script = launch_script(&spec);
        assert!(script.contains("export WIP_SIGNAL_URL=https://x/y;"));
        assert!(script.contains("export WIP_PROCESS_SERVER=node-1;"));
        assert!(script.contains("nohup sh -c"));
        assert!(script.contains("/tmp/wip-$$.exit"));
        assert!(script.ends_with("echo \"$! $start\""));
    }

    #[test]
    fn launch_output_is_parsed() {
        let (pid, start) = parse_launch_output("motd noise\n4242 1700000000\n").unwrap();
        assert_eq!(pid, "4242");
        assert_eq!(start, 1_700_000_000);
        assert!(parse_launch_output("Permission denied").is_err());
    }

    #[test]
    fn status_output_is_parsed() {
        assert_eq!(parse_status_output("running\n").unwrap(), BackendStatus::Running);
        assert_eq!(
            parse_status_output("exited 2\n").unwrap(),
            BackendStatus::Stopped {
                ran: true,
                exit_code: Some(2)
            }
        );
        assert_eq!(
            parse_status_output("gone").unwrap(),
            BackendStatus::Stopped {
                ran: true,
                exit_code: None
            }
        );
        assert!(parse_status_output("???").is_err());
    }
}
