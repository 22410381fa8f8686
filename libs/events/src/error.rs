//! Error types for the event data model.

use thiserror::Error;

use crate::EventStatus;

/// Errors raised while validating or transforming model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// A status change that the lifecycle does not allow.
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: EventStatus, to: EventStatus },

    #[error("unknown event status: {0}")]
    UnknownStatus(String),

    /// A rule that cannot be executed as configured.
    #[error("invalid eventing rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    #[error("invalid token range [{start}, {end})")]
    InvalidRange { start: u32, end: u32 },

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}
