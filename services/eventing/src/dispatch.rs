//! Executing one event: locally when this node owns its token, otherwise by
//! forwarding the record to the owner.
//!
//! The dispatcher never changes an event's status. It reports what happened
//! and the delivery manager records it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;
use serde_json::{Map, Value};
use sgw_events::{CrudOp, Event, EventingRule, RuleAction, RulesSnapshot};
use sgw_id::EventId;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::authz::{Authorizer, ServiceCredential};
use crate::collab::{
    AuthError, BatchOp, CollabError, CrudCollaborator, CrudTarget, InternalClient, EVENT_ID_FIELD,
};
use crate::partition::{Owner, TokenPartitioner};

/// Path on every node that accepts forwarded events.
pub const INGEST_PATH: &str = "/v1/internal/events";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The action ran on this node.
    Executed,
    /// The owning node durably accepted the event.
    Forwarded { node_id: String },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Worth another attempt: network trouble, a non-2xx answer, an unknown
    /// or stale owner, a timeout.
    #[error("{0}")]
    Transient(String),

    /// Authorization denied the action.
    #[error("not authorised: {0}")]
    Rejected(String),

    /// The event can never succeed as configured.
    #[error("{0}")]
    Permanent(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transient(_))
    }
}

impl From<CollabError> for DispatchError {
    fn from(e: CollabError) -> Self {
        if e.is_retryable() {
            DispatchError::Transient(e.to_string())
        } else {
            DispatchError::Permanent(e.to_string())
        }
    }
}

impl From<AuthError> for DispatchError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Denied(reason) => DispatchError::Rejected(reason),
            other => DispatchError::Transient(other.to_string()),
        }
    }
}

/// Body sent to webhooks and functions.
#[derive(Debug, Serialize)]
pub struct CloudEvent<'a> {
    pub specversion: &'static str,
    pub id: EventId,
    #[serde(rename = "type")]
    pub event_type: &'a str,
    pub source: String,
    pub time: DateTime<Utc>,
    pub project: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<&'a str>,
    pub data: Value,
}

impl<'a> CloudEvent<'a> {
    pub fn new(event: &'a Event, data: Value) -> Self {
        Self {
            specversion: "1.0",
            id: event.id,
            event_type: &event.event_type,
            source: format!("sgw://{}/{}", event.source_node_id, event.project),
            time: event.created_at,
            project: &event.project,
            rule: event.rule.as_deref(),
            data,
        }
    }
}

pub struct Dispatcher {
    partitioner: Arc<TokenPartitioner>,
    authorizer: Arc<Authorizer>,
    crud: Arc<dyn CrudCollaborator>,
    http: InternalClient,
    functions_url: String,
}

impl Dispatcher {
    pub fn new(
        partitioner: Arc<TokenPartitioner>,
        authorizer: Arc<Authorizer>,
        crud: Arc<dyn CrudCollaborator>,
        http: InternalClient,
        functions_url: &str,
    ) -> Self {
        Self {
            partitioner,
            authorizer,
            crud,
            http,
            functions_url: functions_url.trim_end_matches('/').to_string(),
        }
    }

    /// Runs or forwards one attempt of `event`.
    #[instrument(skip(self, rules, event), fields(event_id = %event.id, token = event.token))]
    pub async fn dispatch(
        &self,
        rules: &RulesSnapshot,
        event: &Event,
    ) -> Result<DispatchOutcome, DispatchError> {
        let owner = self
            .partitioner
            .owner_of(event.token)
            .map_err(|e| DispatchError::Transient(e.to_string()))?;

        if owner.is_local {
            self.execute(rules, event).await?;
            Ok(DispatchOutcome::Executed)
        } else {
            self.forward(&owner, event).await
        }
    }

    async fn execute(&self, rules: &RulesSnapshot, event: &Event) -> Result<(), DispatchError> {
        let rule_id = event
            .rule
            .as_deref()
            .ok_or_else(|| DispatchError::Permanent("event has no rule to run".to_string()))?;
        let rule = rules
            .get(rule_id)
            .ok_or_else(|| DispatchError::Permanent(format!("rule {rule_id} no longer exists")))?;

        let credential = self.authorizer.service_credential().await?;
        let post_process = self.authorizer.authorize(&credential, event, Some(rule)).await?;

        let mut payload = event.payload.clone();
        post_process
            .apply(&mut payload)
            .map_err(|e| DispatchError::Permanent(e.to_string()))?;

        debug!(rule = %rule.id, action = %rule.action.kind(), "Executing action");
        match &rule.action {
            RuleAction::InvokeWebhook { url } => {
                self.post_event(url, &credential, event, payload).await
            }
            RuleAction::InvokeFunction { service, function } => {
                let url = format!(
                    "{}/v1/api/{}/services/{}/{}",
                    self.functions_url, event.project, service, function
                );
                self.post_event(&url, &credential, event, payload).await
            }
            RuleAction::InvokeCrud { .. } => self.run_crud(rule, &credential, event, payload).await,
        }
    }

    async fn post_event(
        &self,
        url: &str,
        credential: &ServiceCredential,
        event: &Event,
        payload: Value,
    ) -> Result<(), DispatchError> {
        let body = serde_json::to_value(CloudEvent::new(event, payload))
            .map_err(|e| DispatchError::Permanent(e.to_string()))?;
        self.http
            .make_http_request(
                Method::POST,
                url,
                Some(credential.as_str()),
                Some(event.id),
                Some(&body),
            )
            .await
            .map_err(|e| DispatchError::Transient(e.to_string()))?;
        Ok(())
    }

    async fn run_crud(
        &self,
        rule: &EventingRule,
        credential: &ServiceCredential,
        event: &Event,
        payload: Value,
    ) -> Result<(), DispatchError> {
        let RuleAction::InvokeCrud { db, collection, op } = &rule.action else {
            return Ok(());
        };
        let target = CrudTarget {
            project: &event.project,
            db,
            collection,
        };
        let token = credential.as_str();
        let doc = match payload.get("doc") {
            Some(doc) if !doc.is_null() => doc.clone(),
            _ => payload.clone(),
        };

        match op {
            // A redelivery after an unacknowledged success must not insert
            // a row twice, so every created document is tagged and looked up
            // before it is written.
            CrudOp::Create => match doc {
                Value::Array(docs) => {
                    let mut ops = Vec::with_capacity(docs.len());
                    for (i, doc) in docs.into_iter().enumerate() {
                        let tag = format!("{}:{i}", event.id);
                        if self.already_created(target, token, &tag).await? {
                            continue;
                        }
                        ops.push(BatchOp::Create {
                            collection: collection.clone(),
                            doc: tag_with_event(doc, &tag),
                        });
                    }
                    if ops.is_empty() {
                        debug!("Event already applied to target collection");
                        return Ok(());
                    }
                    self.crud.batch(&event.project, db, token, ops).await?;
                }
                doc => {
                    let tag = event.id.to_string();
                    if self.already_created(target, token, &tag).await? {
                        debug!("Event already applied to target collection");
                        return Ok(());
                    }
                    self.crud.internal_create(target, token, tag_with_event(doc, &tag)).await?;
                }
            },
            CrudOp::Update => {
                let find = event_find(&payload)?;
                let update = serde_json::json!({ "$set": doc });
                self.crud.internal_update(target, token, find, update).await?;
            }
            CrudOp::Delete => {
                let find = event_find(&payload)?;
                self.crud.delete(target, token, find).await?;
            }
        }
        Ok(())
    }

    async fn already_created(
        &self,
        target: CrudTarget<'_>,
        token: &str,
        tag: &str,
    ) -> Result<bool, DispatchError> {
        let mut find = Map::new();
        find.insert(EVENT_ID_FIELD.to_string(), Value::String(tag.to_string()));
        Ok(!self.crud.read(target, token, find).await?.is_empty())
    }

    async fn forward(
        &self,
        owner: &Owner,
        event: &Event,
    ) -> Result<DispatchOutcome, DispatchError> {
        let credential = self.authorizer.internal_credential().await?;
        let url = format!("{}{}", owner.url.trim_end_matches('/'), INGEST_PATH);
        let body =
            serde_json::to_value(event).map_err(|e| DispatchError::Permanent(e.to_string()))?;

        debug!(owner = %owner.node_id, "Forwarding event to owner");
        match self
            .http
            .make_http_request(
                Method::POST,
                &url,
                Some(credential.as_str()),
                Some(event.id),
                Some(&body),
            )
            .await
        {
            Ok(_) => Ok(DispatchOutcome::Forwarded {
                node_id: owner.node_id.clone(),
            }),
            Err(e) if e.status() == Some(409) => Err(DispatchError::Transient(format!(
                "stale ownership: {} does not own token {}",
                owner.node_id, event.token
            ))),
            Err(e) => Err(DispatchError::Transient(e.to_string())),
        }
    }
}

fn tag_with_event(doc: Value, tag: &str) -> Value {
    match doc {
        Value::Object(mut fields) => {
            fields.insert(EVENT_ID_FIELD.to_string(), Value::String(tag.to_string()));
            Value::Object(fields)
        }
        other => other,
    }
}

fn event_find(payload: &Value) -> Result<Map<String, Value>, DispatchError> {
    match payload.get("find") {
        Some(Value::Object(find)) if !find.is_empty() => Ok(find.clone()),
        _ => Err(DispatchError::Permanent(
            "crud update and delete need a find in the event payload".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn auth_errors_map_to_dispatch_errors() {
        assert!(matches!(
            DispatchError::from(AuthError::Denied("no".to_string())),
            DispatchError::Rejected(_)
        ));
        assert!(DispatchError::from(AuthError::Mint("down".to_string())).is_retryable());
    }

    #[test]
    fn crud_errors_keep_their_retryability() {
        assert!(DispatchError::from(CollabError::Unavailable("x".to_string())).is_retryable());
        assert!(!DispatchError::from(CollabError::Invalid("x".to_string())).is_retryable());
    }

    #[test]
    fn tagging_only_touches_objects() {
        assert_eq!(tag_with_event(json!({"a": 1}), "evt_1"), json!({"a": 1, "_event_id": "evt_1"}));
        assert_eq!(tag_with_event(json!(5), "evt_1"), json!(5));
    }

    #[test]
    fn find_is_required_for_keyed_crud() {
        assert!(event_find(&json!({"find": {"id": 1}})).is_ok());
        assert!(event_find(&json!({"find": {}})).is_err());
        assert!(event_find(&json!({"doc": {}})).is_err());
    }
}
