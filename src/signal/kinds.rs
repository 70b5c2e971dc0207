//! Domain signal kinds.
//!
//! Payloads arrive from remote processes over the network, so decoding is
//! field-by-field: absent or malformed *optional* fields are simply left
//! unset, while a missing or mistyped *required* field is rejected with
//! `SignalError::InvalidArgument`. The `classId` tag selects one of a closed
//! set of kinds; unknown tags are rejected.

use std::collections::BTreeMap;

use serde_json::{Map, Value, json};

use crate::error::SignalError;
use crate::queue::model::ExitStatus;

pub const CLASS_SSH: &str = "ssh_process";
pub const CLASS_CONTAINER: &str = "container_process";
pub const CLASS_CLOUD_TASK: &str = "cloud_task";
pub const CLASS_WIP_COMPLETE: &str = "wip_complete";

/// Per-phase timing reported by remote work, in seconds.
pub type Timers = BTreeMap<String, f64>;

/// Correlation id of a process launched over SSH.
pub fn ssh_process_id(server: &str, pid: impl std::fmt::Display, start_time: i64) -> String {
    format!("{server}:{pid}@{start_time}")
}

/// Correlation id of a container process.
pub fn container_process_id(pid: &str, start_time: i64) -> String {
    format!("{pid}@{start_time}")
}

/// Fields shared by every process-completion kind.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProcessReport {
    /// Unix seconds.
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub exit_code: Option<i64>,
    pub exit_message: Option<String>,
    pub timers: Timers,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SshSignal {
    pub server: String,
    pub pid: i64,
    pub report: ProcessReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSignal {
    /// Container id.
    pub pid: String,
    pub report: ProcessReport,
    pub queue_name: Option<String>,
    pub state: Option<String>,
    pub logs: Option<String>,
    /// Bytes.
    pub disk_use: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudTaskSignal {
    /// Task identifier assigned by the cluster.
    pub pid: String,
    pub report: ProcessReport,
    pub queue_name: Option<String>,
    pub state: Option<String>,
    pub logs: Option<String>,
}

/// Sent to a parent task when one of its children completes.
#[derive(Debug, Clone, PartialEq)]
pub struct WipCompleteSignal {
    pub completed_wip_id: i64,
    pub exit_status: Option<ExitStatus>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainSignal {
    Ssh(SshSignal),
    Container(ContainerSignal),
    CloudTask(CloudTaskSignal),
    WipComplete(WipCompleteSignal),
}

impl DomainSignal {
    pub fn class_id(&self) -> &'static str {
        match self {
            Self::Ssh(_) => CLASS_SSH,
            Self::Container(_) => CLASS_CONTAINER,
            Self::CloudTask(_) => CLASS_CLOUD_TASK,
            Self::WipComplete(_) => CLASS_WIP_COMPLETE,
        }
    }

    /// Key correlating this signal with one physical process instance.
    pub fn process_key(&self) -> String {
        match self {
            Self::Ssh(s) => ssh_process_id(&s.server, s.pid, s.report.start_time),
            Self::Container(c) => container_process_id(&c.pid, c.report.start_time),
            Self::CloudTask(c) => c.pid.clone(),
            Self::WipComplete(w) => w.completed_wip_id.to_string(),
        }
    }

    /// Process fields, for the kinds that report a process.
    pub fn report(&self) -> Option<&ProcessReport> {
        match self {
            Self::Ssh(s) => Some(&s.report),
            Self::Container(c) => Some(&c.report),
            Self::CloudTask(c) => Some(&c.report),
            Self::WipComplete(_) => None,
        }
    }

    /// Decode from the object form, dispatching on `classId`.
    pub fn from_object(value: &Value) -> Result<Self, SignalError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SignalError::invalid("payload", "expected a JSON object"))?;
        let fields = Fields { obj };
        let class_id = fields.required_str("classId")?;

        match class_id.as_str() {
            CLASS_SSH => Ok(Self::Ssh(SshSignal {
                server: fields.required_str("server")?,
                pid: fields.required_i64("pid")?,
                report: fields.report()?,
            })),
            CLASS_CONTAINER => Ok(Self::Container(ContainerSignal {
                pid: fields.required_str("pid")?,
                report: fields.report()?,
                queue_name: fields.opt_str("queueName"),
                state: fields.opt_str("state"),
                logs: fields.opt_str("logs"),
                disk_use: fields.opt_i64("diskUse"),
            })),
            CLASS_CLOUD_TASK => Ok(Self::CloudTask(CloudTaskSignal {
                pid: fields.required_str("pid")?,
                report: fields.report()?,
                queue_name: fields.opt_str("queueName"),
                state: fields.opt_str("state"),
                logs: fields.opt_str("logs"),
            })),
            CLASS_WIP_COMPLETE => Ok(Self::WipComplete(WipCompleteSignal {
                completed_wip_id: fields.required_i64("completedWipId")?,
                exit_status: fields
                    .opt_str("exitStatus")
                    .and_then(|s| s.parse::<ExitStatus>().ok()),
                message: fields.opt_str("message"),
            })),
            other => Err(SignalError::UnknownKind(other.to_string())),
        }
    }

    /// Encode to the object form carried in a signal's data.
    pub fn to_object(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("classId".into(), json!(self.class_id()));

        match self {
            Self::Ssh(s) => {
                obj.insert("server".into(), json!(s.server));
                obj.insert("pid".into(), json!(s.pid));
                write_report(&mut obj, &s.report);
            }
            Self::Container(c) => {
                obj.insert("pid".into(), json!(c.pid));
                write_report(&mut obj, &c.report);
                put_opt(&mut obj, "queueName", c.queue_name.as_ref());
                put_opt(&mut obj, "state", c.state.as_ref());
                put_opt(&mut obj, "logs", c.logs.as_ref());
                put_opt(&mut obj, "diskUse", c.disk_use.as_ref());
            }
            Self::CloudTask(c) => {
                obj.insert("pid".into(), json!(c.pid));
                write_report(&mut obj, &c.report);
                put_opt(&mut obj, "queueName", c.queue_name.as_ref());
                put_opt(&mut obj, "state", c.state.as_ref());
                put_opt(&mut obj, "logs", c.logs.as_ref());
            }
            Self::WipComplete(w) => {
                obj.insert("completedWipId".into(), json!(w.completed_wip_id));
                put_opt(&mut obj, "exitStatus", w.exit_status.map(|s| s.as_str()).as_ref());
                put_opt(&mut obj, "message", w.message.as_ref());
            }
        }

        Value::Object(obj)
    }
}

fn put_opt<T: serde::Serialize>(obj: &mut Map<String, Value>, key: &str, value: Option<&T>) {
    if let Some(v) = value {
        obj.insert(key.to_string(), json!(v));
    }
}

fn write_report(obj: &mut Map<String, Value>, report: &ProcessReport) {
    obj.insert("startTime".into(), json!(report.start_time));
    put_opt(obj, "endTime", report.end_time.as_ref());
    put_opt(obj, "exitCode", report.exit_code.as_ref());
    put_opt(obj, "exitMessage", report.exit_message.as_ref());
    if !report.timers.is_empty() {
        obj.insert("timers".into(), json!(report.timers));
    }
}

/// Field-by-field reader over an untrusted payload object.
struct Fields<'a> {
    obj: &'a Map<String, Value>,
}

impl Fields<'_> {
    fn required_i64(&self, key: &str) -> Result<i64, SignalError> {
        match self.obj.get(key) {
            None | Some(Value::Null) => Err(SignalError::invalid(key, "missing")),
            Some(v) => as_i64(v).ok_or_else(|| SignalError::invalid(key, format!("not an integer: {v}"))),
        }
    }

    fn required_str(&self, key: &str) -> Result<String, SignalError> {
        match self.obj.get(key) {
            None | Some(Value::Null) => Err(SignalError::invalid(key, "missing")),
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(v) => Err(SignalError::invalid(key, format!("not a string: {v}"))),
        }
    }

    fn opt_i64(&self, key: &str) -> Option<i64> {
        self.obj.get(key).and_then(as_i64)
    }

    fn opt_str(&self, key: &str) -> Option<String> {
        match self.obj.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn timers(&self) -> Timers {
        self.obj
            .get("timers")
            .and_then(Value::as_object)
            .map(|timers| {
                timers
                    .iter()
                    .filter_map(|(k, v)| v.as_f64().map(|secs| (k.clone(), secs)))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn report(&self) -> Result<ProcessReport, SignalError> {
        Ok(ProcessReport {
            start_time: self.required_i64("startTime")?,
            end_time: self.opt_i64("endTime"),
            exit_code: self.opt_i64("exitCode"),
            exit_message: self.opt_str("exitMessage"),
            timers: self.timers(),
        })
    }
}

/// Integers may arrive as JSON numbers or as digit strings (shell `curl` payloads).
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
