//! The event record and the inputs that create one.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sgw_id::EventId;

use crate::{EventError, EventStatus, TokenSpace};

/// A durable unit of eventing work.
///
/// The same record is what a node stores, what it forwards to the owning
/// node, and what operators inspect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    /// Project (tenant) the event belongs to.
    pub project: String,

    /// Name of the rule whose action runs for this event. Custom events
    /// queued without a rule have nothing to execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    /// `DB_INSERT`, `DB_UPDATE`, `DB_DELETE` or a custom type.
    pub event_type: String,

    pub payload: serde_json::Value,

    /// Partition key. Never rewritten after staging.
    pub token: u32,

    pub status: EventStatus,

    /// Number of failed attempts so far.
    pub retries: u32,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Earliest time the next attempt may start.
    pub next_attempt_at: DateTime<Utc>,

    /// Node that staged the event first.
    pub source_node_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Node this copy was handed to. A forwarded copy is finished here but
    /// can be taken back if ownership of its token returns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarded_to: Option<String>,
}

impl Event {
    /// Builds a freshly staged record from its inputs.
    pub fn staged(
        new: NewEvent,
        space: &TokenSpace,
        source_node_id: &str,
        now: DateTime<Utc>,
    ) -> Self {
        let id = EventId::new();
        let routing_key = new.routing_key.unwrap_or_else(|| id.to_string());
        Self {
            id,
            project: new.project,
            rule: new.rule,
            event_type: new.event_type,
            payload: new.payload,
            token: space.token_for(&routing_key),
            status: EventStatus::Staged,
            retries: 0,
            created_at: now,
            last_attempt_at: None,
            next_attempt_at: new.run_at.filter(|at| *at > now).unwrap_or(now),
            source_node_id: source_node_id.to_string(),
            last_error: None,
            forwarded_to: None,
        }
    }

    /// Moves the record to `next`, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, next: EventStatus) -> Result<(), EventError> {
        self.status = self.status.transition(next)?;
        Ok(())
    }

    /// True for a copy this node handed off to another owner.
    pub fn is_handed_off(&self) -> bool {
        self.status == EventStatus::Processed && self.forwarded_to.is_some()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EventStatus::Staged && self.next_attempt_at <= now
    }
}

/// Input for staging an event.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub project: String,
    pub rule: Option<String>,
    pub event_type: String,
    pub payload: serde_json::Value,
    /// Key hashed into the token. Events sharing a key share a token and are
    /// processed one at a time in creation order. Defaults to the event id.
    pub routing_key: Option<String>,
    /// Do not dispatch before this instant.
    pub run_at: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub fn new(
        project: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            project: project.into(),
            rule: None,
            event_type: event_type.into(),
            payload,
            routing_key: None,
            run_at: None,
        }
    }

    pub fn rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    pub fn routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

/// Body of a client request that queues a custom event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(default)]
    pub payload: serde_json::Value,

    /// Rule whose action should run for the event.
    #[serde(default)]
    pub rule: Option<String>,

    #[serde(default)]
    pub routing_key: Option<String>,

    /// Relative delay before the first attempt.
    #[serde(default)]
    pub delay_secs: Option<u64>,

    /// Absolute time of the first attempt. Takes precedence over `delay_secs`.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl QueueEventRequest {
    pub fn into_new_event(self, project: &str, now: DateTime<Utc>) -> Result<NewEvent, EventError> {
        if self.event_type.trim().is_empty() {
            return Err(EventError::InvalidPayload("event type is required".to_string()));
        }

        let run_at = match (self.timestamp, self.delay_secs) {
            (Some(ts), _) => Some(ts),
            (None, Some(secs)) => {
                let secs = i64::try_from(secs).map_err(|_| {
                    EventError::InvalidPayload("delay_secs out of range".to_string())
                })?;
                Some(now + Duration::seconds(secs))
            }
            (None, None) => None,
        };

        Ok(NewEvent {
            project: project.to_string(),
            rule: self.rule,
            event_type: self.event_type,
            payload: self.payload,
            routing_key: self.routing_key,
            run_at,
        })
    }
}
