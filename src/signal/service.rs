//! Signal service: register, deliver, resolve and consume signals.
//!
//! Delivery stores the payload against a pre-registered envelope, wakes the
//! addressed task and broadcasts a `SignalEvent` for in-process waiters.
//! Consumption is the only place a signal's side effects are applied, and
//! it is guarded by a compare-and-set on `consumed_time`.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SignalError};
use crate::signal::kinds::DomainSignal;
use crate::signal::{NewSignal, Signal, SignalType};
use crate::store::Database;

const EVENT_CAPACITY: usize = 256;

/// Broadcast whenever a signal is delivered or sent.
#[derive(Debug, Clone)]
pub struct SignalEvent {
    pub task_id: i64,
    pub signal_id: i64,
    pub signal_type: SignalType,
    pub process_id: Option<String>,
    pub domain: Option<DomainSignal>,
}

/// Outcome of an inbound delivery.
#[derive(Debug, Clone)]
pub enum Delivery {
    Accepted(Signal),
    /// The envelope already carried a payload; nothing changed.
    Duplicate(Signal),
}

/// A signal consumed by this caller.
#[derive(Debug, Clone)]
pub struct ConsumedSignal {
    pub signal: Signal,
    /// `None` for envelopes without a domain payload (e.g. terminate).
    pub domain: Option<DomainSignal>,
}

pub struct SignalService {
    db: Arc<dyn Database>,
    base_url: String,
    events: broadcast::Sender<SignalEvent>,
}

impl SignalService {
    /// `base_url` is the public address of the inbound signal routes.
    pub fn new(db: Arc<dyn Database>, base_url: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            base_url: base_url.into(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SignalEvent> {
        self.events.subscribe()
    }

    /// Create an empty envelope that remote work will deliver to later.
    pub async fn register(&self, task_id: i64, signal_type: SignalType) -> Result<Signal> {
        let signal = self
            .db
            .insert_signal(
                &NewSignal {
                    object_id: task_id,
                    signal_type,
                    process_id: None,
                    data: Value::Null,
                    sent: false,
                },
                Utc::now(),
            )
            .await?;
        debug!(task_id, signal_id = signal.id, uuid = %signal.uuid, "Signal registered");
        Ok(signal)
    }

    /// URL remote work posts the envelope's payload to.
    pub fn callback_url(&self, signal: &Signal) -> String {
        format!(
            "{}/signals/{}",
            self.base_url.trim_end_matches('/'),
            signal.uuid
        )
    }

    /// Attach an inbound payload to a registered envelope.
    ///
    /// Malformed payloads are rejected before anything is stored. Repeat
    /// deliveries are reported as `Duplicate` and change nothing.
    pub async fn deliver(&self, uuid: Uuid, payload: &Value) -> Result<Delivery> {
        let signal = self.resolve(uuid).await?;
        let domain = match DomainSignal::from_object(payload) {
            Ok(domain) => domain,
            Err(e) => {
                warn!(uuid = %uuid, task_id = signal.object_id, error = %e, "Malformed signal payload");
                return Err(e.into());
            }
        };
        let process_id = domain.process_key();

        let accepted = self
            .db
            .record_delivery(uuid, &domain.to_object(), Some(&process_id), Utc::now())
            .await?;
        if !accepted {
            debug!(uuid = %uuid, process_id = %process_id, "Duplicate signal delivery ignored");
            return Ok(Delivery::Duplicate(signal));
        }

        let signal = self.resolve(uuid).await?;
        info!(
            task_id = signal.object_id,
            signal_id = signal.id,
            kind = domain.class_id(),
            process_id = %process_id,
            "Signal delivered"
        );
        self.announce(&signal, Some(domain)).await?;
        Ok(Delivery::Accepted(signal))
    }

    /// Store an already-delivered signal for a task in one step.
    pub async fn send(
        &self,
        task_id: i64,
        signal_type: SignalType,
        domain: Option<&DomainSignal>,
    ) -> Result<Signal> {
        let signal = self
            .db
            .insert_signal(
                &NewSignal {
                    object_id: task_id,
                    signal_type,
                    process_id: domain.map(DomainSignal::process_key),
                    data: domain.map_or(Value::Object(Default::default()), DomainSignal::to_object),
                    sent: true,
                },
                Utc::now(),
            )
            .await?;
        debug!(task_id, signal_id = signal.id, signal_type = signal_type.as_str(), "Signal sent");
        self.announce(&signal, domain.cloned()).await?;
        Ok(signal)
    }

    async fn announce(&self, signal: &Signal, domain: Option<DomainSignal>) -> Result<()> {
        self.db.wake_task(signal.object_id, Utc::now()).await?;
        // No subscribers is fine.
        let _ = self.events.send(SignalEvent {
            task_id: signal.object_id,
            signal_id: signal.id,
            signal_type: signal.signal_type,
            process_id: signal.process_id.clone(),
            domain,
        });
        Ok(())
    }

    pub async fn resolve(&self, uuid: Uuid) -> Result<Signal> {
        self.db
            .get_signal_by_uuid(uuid)
            .await?
            .ok_or_else(|| SignalError::NotFound(uuid.to_string()).into())
    }

    /// Consume a delivered signal.
    ///
    /// Returns `None` if it was already consumed. The first consumer also
    /// records the correlated process result, once per process id.
    pub async fn consume(&self, signal: &Signal) -> Result<Option<ConsumedSignal>> {
        if !signal.is_sent() {
            return Err(SignalError::NotFound(format!("{} (not delivered)", signal.uuid)).into());
        }
        let now = Utc::now();
        if !self.db.consume_signal(signal.id, now).await? {
            debug!(signal_id = signal.id, "Signal already consumed");
            return Ok(None);
        }

        let domain = match signal.signal_type {
            SignalType::Terminate => None,
            _ => match signal.domain() {
                Ok(domain) => Some(domain),
                Err(e) => {
                    warn!(signal_id = signal.id, error = %e, "Stored signal payload unreadable");
                    None
                }
            },
        };

        if let Some(domain) = domain.as_ref().filter(|d| d.report().is_some()) {
            let recorded = self
                .db
                .record_process_result(
                    &domain.process_key(),
                    signal.object_id,
                    &domain.to_object(),
                    now,
                )
                .await?;
            if !recorded {
                debug!(process_id = %domain.process_key(), "Process result already recorded");
            }
        }

        let mut consumed = signal.clone();
        consumed.consumed_time = Some(now);
        Ok(Some(ConsumedSignal {
            signal: consumed,
            domain,
        }))
    }

    /// Consume every delivered, unconsumed signal addressed to a task.
    pub async fn consume_pending(&self, task_id: i64) -> Result<Vec<ConsumedSignal>> {
        let mut consumed = Vec::new();
        for signal in self.db.pending_signals(task_id).await? {
            if let Some(c) = self.consume(&signal).await? {
                consumed.push(c);
            }
        }
        Ok(consumed)
    }

    /// Return consumed signals to the pending set.
    ///
    /// Used when the step they were consumed for never finished. Consuming
    /// them again is safe: the process result is recorded once per process id.
    pub async fn restore(&self, consumed: &[ConsumedSignal]) -> Result<()> {
        for c in consumed {
            self.db.restore_signal(c.signal.id).await?;
            debug!(task_id = c.signal.object_id, signal_id = c.signal.id, "Signal restored");
        }
        Ok(())
    }

    /// Stored result for a process id, if one was recorded.
    pub async fn process_result(&self, process_id: &str) -> Result<Option<Value>> {
        Ok(self.db.get_process_result(process_id).await?)
    }
}
