//! HTTP API handlers and routing.

mod authz;
pub mod error;
mod health;
mod request_context;
mod v1;

use axum::http::{HeaderName, HeaderValue, Request};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub use request_context::REQUEST_ID_HEADER;

/// Assigns `req_` ids to requests that arrive without one.
#[derive(Clone, Copy, Default)]
struct MakeSgwRequestId;

impl MakeRequestId for MakeSgwRequestId {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        let id = sgw_id::RequestId::new().to_string();
        HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        // Health endpoints (no auth required)
        .merge(health::routes())
        // API v1 routes
        .nest("/v1", v1::routes())
        // Middleware
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeSgwRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
        // Application state
        .with_state(state)
}
