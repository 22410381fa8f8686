//! API v1 routes.

mod eventing;
mod events;
mod internal;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        // Node-to-node forwarding: /v1/internal/events
        .route("/internal/events", post(internal::ingest_event))
        // Client and CRUD pipeline entry points
        .route("/api/{project}/eventing/queue", post(eventing::queue_event))
        .route("/api/{project}/eventing/mutations", post(eventing::report_mutation))
        .route(
            "/admin/projects/{project}/eventing/rules",
            get(eventing::get_rules).put(eventing::replace_rules),
        )
        // Operator inspection
        .route("/events", get(events::list_events))
        .route("/events/stats", get(events::get_stats))
        .route("/events/{event_id}", get(events::get_event))
        .route("/events/{event_id}/cancel", post(events::cancel_event))
        .route("/cluster/view", get(events::get_cluster_view))
}
