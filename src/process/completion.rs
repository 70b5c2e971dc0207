//! Process completion from two sources: a correlated signal or the
//! backend's own status.
//!
//! `check_completion` makes one pass over both and is what step-driven
//! workflows call. `wait_for_completion` runs the same checks in a
//! background task and resolves a channel with whichever fires first.
//! Neither caller needs to know which path fired.

use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::error::ProcessError;
use crate::process::handle::{ProcessHandle, ProcessResult};
use crate::signal::SignalEvent;
use crate::signal::kinds::DomainSignal;

/// Result from the first signal correlated with the handle's process.
pub fn correlated_result<'a>(
    handle: &mut ProcessHandle,
    signals: impl IntoIterator<Item = &'a DomainSignal>,
) -> Option<ProcessResult> {
    let process_id = handle.unique_process_id()?;
    for domain in signals {
        let key = domain.process_key();
        if key == process_id {
            debug!(process_id = %process_id, "Completion via signal");
            return Some(handle.result_from_signal(domain));
        }
        debug!(process_id = %process_id, key = %key, "Ignoring uncorrelated signal");
    }
    None
}

/// Result if the backend reports the process stopped, else `None`.
///
/// A process that stopped without ever starting is force-failed.
pub async fn polled_result(handle: &mut ProcessHandle) -> Result<Option<ProcessResult>, ProcessError> {
    if handle.launch_failed().await? {
        return Ok(Some(handle.force_fail("process stopped before it started")));
    }
    if !handle.has_stopped().await? {
        return Ok(None);
    }
    debug!(process_id = ?handle.unique_process_id(), "Completion via poll");
    Ok(Some(match handle.result().cloned() {
        Some(result) => result,
        None => handle.force_fail("process stopped without a result"),
    }))
}

/// One check of both paths. A correlated signal wins over polling.
pub async fn check_completion<'a>(
    handle: &mut ProcessHandle,
    signals: impl IntoIterator<Item = &'a DomainSignal>,
) -> Result<Option<ProcessResult>, ProcessError> {
    if let Some(result) = correlated_result(handle, signals) {
        return Ok(Some(result));
    }
    polled_result(handle).await
}

/// Resolve with the process's result once it stops or its completion signal
/// arrives. Dropping the receiver stops the watcher.
pub fn wait_for_completion(
    mut handle: ProcessHandle,
    mut events: broadcast::Receiver<SignalEvent>,
    poll_interval: Duration,
) -> oneshot::Receiver<ProcessResult> {
    let (mut tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let Some(process_id) = handle.unique_process_id() else {
            let _ = tx.send(handle.force_fail("process was never launched"));
            return;
        };

        let mut ticker = tokio::time::interval(poll_interval);
        let mut listening = true;

        let result = loop {
            tokio::select! {
                _ = tx.closed() => {
                    debug!(process_id = %process_id, "Completion receiver dropped");
                    return;
                }
                event = events.recv(), if listening => match event {
                    Ok(event) if event.process_id.as_deref() == Some(process_id.as_str()) => {
                        if let Some(result) = correlated_result(&mut handle, event.domain.as_ref()) {
                            break result;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(process_id = %process_id, skipped, "Signal listener lagged; relying on polls");
                    }
                    Err(RecvError::Closed) => listening = false,
                },
                _ = ticker.tick() => match polled_result(&mut handle).await {
                    Ok(Some(result)) => break result,
                    Ok(None) => {}
                    Err(e) => warn!(process_id = %process_id, error = %e, "Status poll failed"),
                },
            }
        };

        let _ = tx.send(result);
    });

    rx
}
