//! Database error types.

use sgw_events::EventStatus;
use sgw_id::EventId;
use thiserror::Error;

/// Event store errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error(
        "migration directory not found; tried {tried}. Last error: {last_error}. \
         Run from repo root or services/eventing."
    )]
    MigrationDirNotFound { tried: String, last_error: String },

    /// No event with this id is held by this node.
    #[error("event not found: {0}")]
    NotFound(EventId),

    /// The event is not in a status that allows the requested change.
    /// Returned when a conditional claim loses a race.
    #[error("event {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: EventId,
        from: EventStatus,
        to: EventStatus,
    },

    /// A stored row could not be turned back into an event.
    #[error("corrupt event row {id}: {reason}")]
    Corrupt { id: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Lost claims and missing rows are expected under concurrency; everything
    /// else points at the backend.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::InvalidTransition { .. } | DbError::NotFound(_))
    }
}
