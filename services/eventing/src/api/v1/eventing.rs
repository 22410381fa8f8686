//! Project-scoped eventing endpoints: queueing custom events, reporting
//! committed mutations and managing rules.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sgw_events::{EventingRule, QueueEventRequest, RulesSnapshot};
use sgw_id::EventId;

use crate::api::authz;
use crate::api::error::{ApiError, FieldError};
use crate::api::request_context::RequestContext;
use crate::collab::EventingOp;
use crate::rules::RulesError;
use crate::state::AppState;
use crate::trigger::Mutation;

#[derive(Debug, Serialize)]
pub struct QueueEventResponse {
    /// One id per rule the event was queued for.
    pub event_ids: Vec<EventId>,
}

/// Queue a custom event.
///
/// POST /v1/api/{project}/eventing/queue
///
/// With `rule` set the event runs that rule's action. Without it one event
/// is staged for every rule whose event type equals the request's type.
pub async fn queue_event(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(project): Path<String>,
    Json(req): Json<QueueEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.clone();
    let snapshot = state.registry().snapshot(&project);

    let rules: Vec<&EventingRule> = match req.rule.as_deref() {
        Some(rule_id) => {
            let rule = snapshot.get(rule_id).ok_or_else(|| {
                ApiError::bad_request("unknown_rule", format!("Rule {rule_id} is not configured"))
                    .with_request_id(request_id.clone())
            })?;
            vec![rule]
        }
        None => snapshot
            .rules
            .values()
            .filter(|rule| rule.event_type == req.event_type)
            .collect(),
    };
    if rules.is_empty() {
        return Err(ApiError::bad_request(
            "no_matching_rule",
            format!("No rule handles event type {}", req.event_type),
        )
        .with_request_id(request_id));
    }

    for rule in &rules {
        let op = EventingOp {
            project: &project,
            event_type: &req.event_type,
            rule: Some(*rule),
        };
        authz::require_eventing_op(&state, &ctx, op).await?;
    }

    let rule_ids: Vec<String> = rules.iter().map(|rule| rule.id.clone()).collect();
    let new = req
        .into_new_event(&project, Utc::now())
        .map_err(|e| {
            ApiError::bad_request("invalid_event", e.to_string())
                .with_request_id(request_id.clone())
        })?;

    let mut event_ids = Vec::with_capacity(rule_ids.len());
    for rule_id in rule_ids {
        let event = state.store().stage(new.clone().rule(rule_id)).await.map_err(|e| {
            tracing::error!(
                error = %e,
                request_id = %request_id,
                project = %project,
                "Failed to stage queued event"
            );
            ApiError::service_unavailable("store_unavailable", "Failed to stage event")
                .with_request_id(request_id.clone())
        })?;
        tracing::info!(
            event_id = %event.id,
            project = %project,
            event_type = %event.event_type,
            token = event.token,
            "Queued custom event"
        );
        event_ids.push(event.id);
    }

    Ok((StatusCode::CREATED, Json(QueueEventResponse { event_ids })))
}

#[derive(Debug, Serialize)]
pub struct MutationResponse {
    pub staged: Vec<EventId>,
}

/// Report a committed mutation from the CRUD pipeline.
///
/// POST /v1/api/{project}/eventing/mutations
///
/// Staging failures are logged and never fail the mutation; the response
/// lists the events that were staged.
pub async fn report_mutation(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(project): Path<String>,
    Json(mutation): Json<Mutation>,
) -> Result<impl IntoResponse, ApiError> {
    authz::require_internal(&state, &ctx)?;

    let staged = state.hook().on_committed(&project, &mutation).await;
    Ok((StatusCode::ACCEPTED, Json(MutationResponse { staged })))
}

#[derive(Debug, Deserialize)]
pub struct ReplaceRulesRequest {
    pub rules: Vec<EventingRule>,
}

#[derive(Debug, Serialize)]
pub struct RulesResponse {
    pub project: String,
    pub version: u64,
    pub rules: Vec<EventingRule>,
}

impl From<&RulesSnapshot> for RulesResponse {
    fn from(snapshot: &RulesSnapshot) -> Self {
        Self {
            project: snapshot.project.clone(),
            version: snapshot.version,
            rules: snapshot.rules.values().cloned().collect(),
        }
    }
}

/// Current rules of a project.
///
/// GET /v1/admin/projects/{project}/eventing/rules
pub async fn get_rules(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(project): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    authz::require_internal(&state, &ctx)?;

    let snapshot = state.registry().snapshot(&project);
    Ok(Json(RulesResponse::from(snapshot.as_ref())))
}

/// Replace every rule of a project.
///
/// PUT /v1/admin/projects/{project}/eventing/rules
pub async fn replace_rules(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(project): Path<String>,
    Json(req): Json<ReplaceRulesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let request_id = ctx.request_id.clone();
    authz::require_internal(&state, &ctx)?;

    let snapshot = state.registry().replace(&project, req.rules).map_err(|e| {
        let field = match &e {
            RulesError::Invalid(sgw_events::EventError::InvalidRule { rule, .. }) => {
                format!("rules.{rule}")
            }
            RulesError::DuplicateRule(rule) => format!("rules.{rule}"),
            _ => "rules".to_string(),
        };
        ApiError::bad_request("invalid_rules", "Rules were rejected")
            .with_details(vec![FieldError::new(field, e.to_string())])
            .with_request_id(request_id.clone())
    })?;

    Ok(Json(RulesResponse::from(snapshot.as_ref())))
}
