//! Authorization helpers.
//!
//! Node-to-node and operator routes require the cluster's internal
//! credential. Client routes pass the caller's token to the auth module.

use sgw_events::PostProcess;

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::collab::{AuthError, EventingOp};
use crate::state::AppState;

/// Maps an auth module error onto an HTTP error.
pub fn auth_error(err: AuthError, request_id: &str) -> ApiError {
    match err {
        AuthError::Denied(reason) => ApiError::forbidden("forbidden", reason),
        AuthError::InvalidToken(_) => {
            ApiError::unauthorized("invalid_token", "Invalid or expired token")
        }
        AuthError::Mint(reason) => {
            tracing::error!(error = %reason, request_id = %request_id, "Auth module failed");
            ApiError::service_unavailable(
                "auth_unavailable",
                "Authorization is temporarily unavailable",
            )
        }
    }
    .with_request_id(request_id.to_string())
}

pub fn require_internal(state: &AppState, ctx: &RequestContext) -> Result<(), ApiError> {
    let token = ctx.bearer()?;
    state
        .authorizer()
        .verify_internal(token)
        .map_err(|e| auth_error(e, &ctx.request_id))
}

pub async fn require_eventing_op(
    state: &AppState,
    ctx: &RequestContext,
    op: EventingOp<'_>,
) -> Result<PostProcess, ApiError> {
    let token = ctx.bearer()?;
    state
        .authorizer()
        .authorize_caller(token, op)
        .await
        .map_err(|e| auth_error(e, &ctx.request_id))
}
