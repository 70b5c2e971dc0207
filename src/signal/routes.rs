//! Inbound HTTP endpoints for signal delivery.
//!
//! - `POST /signals/{uuid}`: remote work delivers a completion payload
//! - `GET /health`

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tower_http::trace::TraceLayer;
use tracing::error;
use uuid::Uuid;

use crate::error::{Error, SignalError};
use crate::signal::service::{Delivery, SignalService};

/// Build the signal routes.
pub fn signal_routes(service: Arc<SignalService>) -> Router {
    Router::new()
        .route("/signals/{uuid}", post(deliver_signal))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "wip-runtime"
    }))
}

/// POST /signals/{uuid}
///
/// 202 on first delivery, 200 on a repeat, 400 for malformed payloads,
/// 404 for unknown envelopes.
async fn deliver_signal(
    State(service): State<Arc<SignalService>>,
    Path(uuid): Path<String>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let Ok(uuid) = Uuid::parse_str(&uuid) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Signal {uuid} not found")})),
        );
    };

    match service.deliver(uuid, &payload).await {
        Ok(Delivery::Accepted(signal)) => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted", "id": signal.id, "signal": signal.to_object()})),
        ),
        Ok(Delivery::Duplicate(signal)) => (
            StatusCode::OK,
            Json(json!({"status": "duplicate", "id": signal.id})),
        ),
        Err(Error::Signal(e @ (SignalError::InvalidArgument { .. } | SignalError::UnknownKind(_)))) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        ),
        Err(Error::Signal(e @ SignalError::NotFound(_))) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()})))
        }
        Err(e) => {
            error!(uuid = %uuid, error = %e, "Signal delivery failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
        }
    }
}
