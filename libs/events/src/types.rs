//! Event type names and lifecycle enums.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::EventError;

// =============================================================================
// Event Type Constants
// =============================================================================

/// Event types raised by database mutations. Any other string is a custom
/// event type queued by a caller.
pub mod event_types {
    pub const DB_INSERT: &str = "DB_INSERT";
    pub const DB_UPDATE: &str = "DB_UPDATE";
    pub const DB_DELETE: &str = "DB_DELETE";

    /// Returns true for the types produced by the trigger evaluator.
    pub fn is_db_event(event_type: &str) -> bool {
        matches!(event_type, DB_INSERT | DB_UPDATE | DB_DELETE)
    }
}

// =============================================================================
// Status
// =============================================================================

/// Lifecycle status of an event.
///
/// ```text
/// staged ──► processing ──► processed
///   │            │
///   │            ├──► staged      (retryable failure, retries += 1)
///   │            └──► failed      (ceiling reached or rejected)
///   └──► cancelled
/// ```
///
/// `processed`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Staged,
    Processing,
    Processed,
    Failed,
    Cancelled,
}

impl EventStatus {
    pub const ALL: [EventStatus; 5] = [
        EventStatus::Staged,
        EventStatus::Processing,
        EventStatus::Processed,
        EventStatus::Failed,
        EventStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Staged => "staged",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
            EventStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Processed | EventStatus::Failed | EventStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        use EventStatus::*;
        matches!(
            (self, next),
            (Staged, Processing)
                | (Staged, Cancelled)
                | (Processing, Processed)
                | (Processing, Staged)
                | (Processing, Failed)
        )
    }

    /// Checks a transition, returning the target status when allowed.
    pub fn transition(&self, next: EventStatus) -> Result<EventStatus, EventError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EventError::InvalidTransition {
                from: *self,
                to: next,
            })
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EventError::UnknownStatus(s.to_string()))
    }
}

// =============================================================================
// Mutations and actions
// =============================================================================

/// The kind of database mutation a trigger reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    /// The event type staged for this mutation.
    pub fn event_type(&self) -> &'static str {
        match self {
            MutationKind::Create => event_types::DB_INSERT,
            MutationKind::Update => event_types::DB_UPDATE,
            MutationKind::Delete => event_types::DB_DELETE,
        }
    }

    /// Whether a rule's configured event type selects this mutation.
    ///
    /// Rules may use either the event type (`DB_INSERT`) or the mutation name
    /// (`create`).
    pub fn matches(&self, rule_event_type: &str) -> bool {
        rule_event_type == self.event_type() || rule_event_type.eq_ignore_ascii_case(self.as_str())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::Create => "create",
            MutationKind::Update => "update",
            MutationKind::Delete => "delete",
        }
    }

    /// Update and delete identify their rows through a find clause.
    pub fn is_find(&self) -> bool {
        !matches!(self, MutationKind::Create)
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification of a rule action, used by authorization policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Crud,
    Webhook,
    Function,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActionKind::Crud => "crud",
            ActionKind::Webhook => "webhook",
            ActionKind::Function => "function",
        };
        f.write_str(s)
    }
}
