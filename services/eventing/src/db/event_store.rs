//! The event store contract shared by every backend.
//!
//! The store is the only shared state between delivery workers. Every status
//! change is a conditional update on the current status, so two workers racing
//! for the same event cannot both win the claim.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sgw_events::{Event, EventStatus, NewEvent};
use sgw_id::EventId;

use super::DbError;

/// How a failed attempt is accounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    /// Total failed attempts allowed. The attempt that brings `retries` to
    /// this value moves the event to `failed`.
    pub max_retries: u32,

    /// Delay before the next attempt when another one is allowed.
    pub backoff: Duration,
}

/// Number of held events per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub staged: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    pub fn add(&mut self, status: EventStatus, n: u64) {
        let slot = match status {
            EventStatus::Staged => &mut self.staged,
            EventStatus::Processing => &mut self.processing,
            EventStatus::Processed => &mut self.processed,
            EventStatus::Failed => &mut self.failed,
            EventStatus::Cancelled => &mut self.cancelled,
        };
        *slot += n;
    }

    pub fn total(&self) -> u64 {
        self.staged + self.processing + self.processed + self.failed + self.cancelled
    }
}

/// Durable record of events held by this node.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Assigns an id and token and writes the event as `staged`.
    async fn stage(&self, new: NewEvent) -> Result<Event, DbError>;

    /// Stages a record forwarded by another node, keeping its id, token and
    /// source.
    ///
    /// Returns `false` when the id is already held. A copy this node handed
    /// off earlier does not count as held: it is replaced by the incoming
    /// record and staged again.
    async fn ingest(&self, event: Event) -> Result<bool, DbError>;

    async fn get(&self, id: EventId) -> Result<Option<Event>, DbError>;

    /// Claims a staged event for an attempt.
    async fn mark_processing(&self, id: EventId) -> Result<Event, DbError>;

    async fn mark_processed(&self, id: EventId) -> Result<(), DbError>;

    /// Finishes a processing event that was handed to `node_id`, which now
    /// holds it.
    async fn mark_forwarded(&self, id: EventId, node_id: &str) -> Result<(), DbError>;

    /// Records a failed attempt. Returns whether another attempt will be made.
    async fn mark_failed(&self, id: EventId, reason: &str, plan: RetryPlan)
        -> Result<bool, DbError>;

    /// Moves a processing event straight to `failed`, without retrying.
    async fn mark_rejected(&self, id: EventId, reason: &str) -> Result<(), DbError>;

    /// Cancels an event that has not started.
    async fn cancel(&self, id: EventId) -> Result<(), DbError>;

    /// Events left in `processing` whose attempt started more than
    /// `older_than` ago.
    async fn list_pending(&self, older_than: Duration) -> Result<Vec<Event>, DbError>;

    /// Events ready for an attempt, at most one per token.
    ///
    /// Only the oldest non-terminal event of each token is considered, and it
    /// is returned only when it is staged and due. A token whose head is
    /// processing, or backing off, blocks the events queued behind it.
    async fn list_dispatchable(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<Event>, DbError>;

    async fn list_by_status(&self, status: EventStatus, limit: usize)
        -> Result<Vec<Event>, DbError>;

    async fn counts(&self) -> Result<StatusCounts, DbError>;
}

pub(crate) fn lease_cutoff(now: DateTime<Utc>, older_than: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::MAX);
    now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub(crate) fn retry_at(now: DateTime<Utc>, backoff: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(backoff)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(now)
}
