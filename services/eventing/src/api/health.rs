//! Health check endpoints.
//!
//! These endpoints are used by load balancers and orchestration systems
//! to determine if the node is healthy and ready to receive traffic.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;

use crate::state::AppState;

const SERVICE: &str = "eventing";

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// Service status: "ok" or "degraded".
    pub status: String,

    /// Service name.
    pub service: String,

    /// Service version.
    pub version: String,

    /// Current timestamp (ISO 8601).
    pub timestamp: String,

    /// Detailed component health, on readiness only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<ComponentHealth>,
}

/// Component health details.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentHealth {
    /// Event store reachability.
    pub event_store: ComponentStatus,

    /// Whether this node holds a token range in the current membership view.
    pub membership: ComponentStatus,
}

/// Individual component status.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ComponentStatus {
    /// Status: "ok", "degraded", or "unavailable".
    pub status: String,

    /// Why the component is not ok.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ComponentStatus {
    fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            message: None,
        }
    }

    fn failing(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.into()),
        }
    }
}

/// Create health check routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
}

/// Liveness: returns 200 while the process serves requests. Dependencies
/// are not checked.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: None,
    })
}

/// Readiness: the event store must answer. A node without a token range can
/// still stage and forward events, so membership only degrades the status.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let store = match state.db() {
        Some(db) => match db.health_check().await {
            Ok(()) => ComponentStatus::ok(),
            Err(e) => ComponentStatus::failing("unavailable", e.to_string()),
        },
        None => match state.store().counts().await {
            Ok(_) => ComponentStatus::ok(),
            Err(e) => ComponentStatus::failing("unavailable", e.to_string()),
        },
    };
    let store_ok = store.status == "ok";

    let partitioner = state.partitioner();
    let view = partitioner.view();
    let membership = match partitioner.local_range() {
        Some(_) if view.is_complete() => ComponentStatus::ok(),
        Some(_) => ComponentStatus::failing(
            "degraded",
            format!("view {} has unowned tokens", view.version),
        ),
        None => ComponentStatus::failing(
            "degraded",
            format!("node {} owns no tokens in view {}", partitioner.local_node_id(), view.version),
        ),
    };
    let all_ok = store_ok && membership.status == "ok";

    let response = HealthResponse {
        status: if all_ok { "ok" } else { "degraded" }.to_string(),
        service: SERVICE.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        components: Some(ComponentHealth {
            event_store: store,
            membership,
        }),
    };

    if store_ok {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}
