//! Node-to-node event ingestion.
//!
//! A node that stages an event for a token it does not own forwards the
//! whole record here. The receiver accepts it only while it owns the token,
//! and acknowledges only after the record is durably staged.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde::Serialize;
use sgw_events::{Event, EventStatus};
use sgw_id::EventId;

use crate::api::authz;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::partition::PartitionError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub id: EventId,
    /// False when the event was already held by this node.
    pub created: bool,
}

/// Accept a forwarded event.
///
/// POST /v1/internal/events
pub async fn ingest_event(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(mut event): Json<Event>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.clone();
    authz::require_internal(&state, &ctx)?;

    let partitioner = state.partitioner();
    match partitioner.owner_of(event.token) {
        Ok(owner) if owner.is_local => {}
        Ok(owner) => {
            let err = stale_ownership(event.token, Some(&owner.node_id));
            return Err(err.with_request_id(request_id));
        }
        Err(PartitionError::UnknownNode { .. }) => {
            return Err(stale_ownership(event.token, None).with_request_id(request_id));
        }
        Err(e) => {
            let err = ApiError::bad_request("invalid_token", e.to_string());
            return Err(err.with_request_id(request_id));
        }
    }

    // The sender's attempt counts as done; this node starts a fresh one.
    event.status = EventStatus::Staged;
    event.next_attempt_at = Utc::now();
    event.forwarded_to = None;

    let id = event.id;
    let source = event.source_node_id.clone();
    let created = state.store().ingest(event).await.map_err(|e| {
        tracing::error!(
            error = %e,
            request_id = %request_id,
            event_id = %id,
            "Failed to stage forwarded event"
        );
        ApiError::service_unavailable("store_unavailable", "Failed to stage event")
            .with_request_id(request_id.clone())
    })?;

    if created {
        tracing::info!(event_id = %id, source = %source, "Accepted forwarded event");
    } else {
        tracing::debug!(event_id = %id, source = %source, "Forwarded event already held");
    }

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(IngestResponse { id, created })))
}

fn stale_ownership(token: u32, owner: Option<&str>) -> ApiError {
    let detail = match owner {
        Some(owner) => format!("token {token} is owned by {owner}"),
        None => format!("token {token} has no owner in the current view"),
    };
    ApiError::conflict("stale_ownership", detail).with_retry_after_seconds(1)
}
