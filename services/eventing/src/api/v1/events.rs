//! Operator endpoints for inspecting and cancelling events held by this node.

use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use sgw_events::{Event, EventStatus};
use sgw_id::EventId;

use crate::api::authz;
use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::db::{DbError, StatusCounts};
use crate::delivery::DeliveryStatsSnapshot;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

/// Query parameters for listing events.
#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    /// Status to list. Defaults to `failed`.
    pub status: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct EventsResponse {
    pub items: Vec<Event>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub node_id: String,
    pub counts: StatusCounts,
    pub delivery: DeliveryStatsSnapshot,
}

fn parse_event_id(raw: &str, request_id: &str) -> Result<EventId, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::bad_request("invalid_event_id", "Invalid event ID format")
            .with_request_id(request_id.to_string())
    })
}

fn store_error(err: DbError, request_id: &str, what: &str) -> ApiError {
    tracing::error!(
        error = %err,
        request_id = %request_id,
        operation = what,
        "Event store request failed",
    );
    ApiError::service_unavailable("store_unavailable", format!("Failed to {what}"))
        .with_request_id(request_id.to_string())
}

/// GET /v1/events/{event_id}
pub async fn get_event(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.clone();
    authz::require_internal(&state, &ctx)?;
    let id = parse_event_id(&event_id, &request_id)?;

    let event = state
        .store()
        .get(id)
        .await
        .map_err(|e| store_error(e, &request_id, "load event"))?
        .ok_or_else(|| {
            ApiError::not_found("event_not_found", format!("Event {id} is not held by this node"))
                .with_request_id(request_id.clone())
        })?;

    Ok(Json(event))
}

/// GET /v1/events?status=failed&limit=50
pub async fn list_events(
    State(state): State<AppState>,
    ctx: RequestContext,
    Query(query): Query<ListEventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.clone();
    authz::require_internal(&state, &ctx)?;

    let status: EventStatus = match query.status.as_deref() {
        Some(raw) => raw.parse().map_err(|_| {
            ApiError::bad_request("invalid_status", format!("Unknown event status {raw}"))
                .with_request_id(request_id.clone())
        })?,
        None => EventStatus::Failed,
    };
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    let items = state
        .store()
        .list_by_status(status, limit)
        .await
        .map_err(|e| store_error(e, &request_id, "list events"))?;

    Ok(Json(EventsResponse { items }))
}

/// Cancel an event that has not started.
///
/// POST /v1/events/{event_id}/cancel
pub async fn cancel_event(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.clone();
    authz::require_internal(&state, &ctx)?;
    let id = parse_event_id(&event_id, &request_id)?;

    match state.store().cancel(id).await {
        Ok(()) => {}
        Err(DbError::NotFound(_)) => {
            let detail = format!("Event {id} is not held by this node");
            return Err(ApiError::not_found("event_not_found", detail).with_request_id(request_id));
        }
        Err(DbError::InvalidTransition { from, .. }) => {
            return Err(
                ApiError::conflict("event_not_cancellable", format!("Event {id} is {from}"))
                    .with_request_id(request_id),
            );
        }
        Err(e) => return Err(store_error(e, &request_id, "cancel event")),
    }
    tracing::info!(event_id = %id, request_id = %request_id, "Cancelled event");

    let event = state
        .store()
        .get(id)
        .await
        .map_err(|e| store_error(e, &request_id, "load event"))?;
    Ok(Json(event))
}

/// GET /v1/events/stats
pub async fn get_stats(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.clone();
    authz::require_internal(&state, &ctx)?;

    let counts = state
        .store()
        .counts()
        .await
        .map_err(|e| store_error(e, &request_id, "count events"))?;

    Ok(Json(StatsResponse {
        node_id: state.partitioner().local_node_id().to_string(),
        counts,
        delivery: state.delivery().stats(),
    }))
}

/// The membership view this node routes with.
///
/// GET /v1/cluster/view
pub async fn get_cluster_view(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    authz::require_internal(&state, &ctx)?;
    let view = state.partitioner().view();
    Ok(Json(view.as_ref().clone()))
}
