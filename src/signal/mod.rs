//! Signal protocol: asynchronous completion messages correlated back to tasks.
//!
//! - `kinds`: closed set of domain signal kinds and their payload codec
//! - `service`: register / deliver / resolve / consume, plus wake-ups
//! - `callback`: outbound HTTP delivery of a signal to a URL
//! - `routes`: inbound HTTP endpoint remote work posts signals to

pub mod callback;
pub mod kinds;
pub mod routes;
pub mod service;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

pub use callback::CallbackClient;
pub use kinds::DomainSignal;
pub use routes::signal_routes;
pub use service::{ConsumedSignal, Delivery, SignalEvent, SignalService};

use crate::error::SignalError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Complete,
    Data,
    Terminate,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Data => "data",
            Self::Terminate => "terminate",
        }
    }
}

impl std::str::FromStr for SignalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "complete" => Ok(Self::Complete),
            "data" => Ok(Self::Data),
            "terminate" => Ok(Self::Terminate),
            other => Err(format!("unknown signal type '{other}'")),
        }
    }
}

/// Stored envelope correlating an asynchronous message to a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub id: i64,
    /// Public handle used in callback URLs.
    pub uuid: Uuid,
    /// Task the signal is addressed to.
    pub object_id: i64,
    pub signal_type: SignalType,
    /// Unset until the payload has been delivered.
    pub sent_time: Option<DateTime<Utc>>,
    /// Unset until consumed; set exactly once.
    pub consumed_time: Option<DateTime<Utc>>,
    /// Correlation key of the process the payload reports on.
    pub process_id: Option<String>,
    /// Domain payload, tagged with `classId`.
    pub data: Value,
}

impl Signal {
    pub fn is_sent(&self) -> bool {
        self.sent_time.is_some()
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed_time.is_some()
    }

    /// Resolve the domain kind carried in `data`.
    pub fn domain(&self) -> Result<DomainSignal, SignalError> {
        DomainSignal::from_object(&self.data)
    }

    /// JSON object form: envelope fields merged over the domain payload.
    pub fn to_object(&self) -> Value {
        let mut obj = match &self.data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        obj.insert("id".into(), json!(self.id));
        obj.insert("uuid".into(), json!(self.uuid.to_string()));
        obj.insert("objectId".into(), json!(self.object_id));
        obj.insert("type".into(), json!(self.signal_type.as_str()));
        obj.insert(
            "sentTime".into(),
            json!(self.sent_time.map(|t| t.timestamp()).unwrap_or(0)),
        );
        obj.insert(
            "consumedTime".into(),
            json!(self.consumed_time.map(|t| t.timestamp()).unwrap_or(0)),
        );
        Value::Object(obj)
    }
}

/// Parameters for storing a new signal.
#[derive(Debug, Clone)]
pub struct NewSignal {
    pub object_id: i64,
    pub signal_type: SignalType,
    pub process_id: Option<String>,
    pub data: Value,
    /// Store as already delivered (local senders) rather than awaiting a callback.
    pub sent: bool,
}
