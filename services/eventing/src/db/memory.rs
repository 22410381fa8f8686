//! In-process event store for single-node development and tests.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sgw_events::{Event, EventStatus, NewEvent, TokenSpace};
use sgw_id::EventId;
use tokio::sync::Mutex;

use super::event_store::{lease_cutoff, retry_at, EventStore, RetryPlan, StatusCounts};
use super::DbError;

/// Event store holding every record in a map behind a mutex.
pub struct MemoryEventStore {
    node_id: String,
    space: TokenSpace,
    events: Mutex<HashMap<EventId, Event>>,
}

impl MemoryEventStore {
    pub fn new(node_id: impl Into<String>, space: TokenSpace) -> Self {
        Self {
            node_id: node_id.into(),
            space,
            events: Mutex::new(HashMap::new()),
        }
    }

    /// Applies `change` to the event if it is currently in `from`.
    async fn update_if<R>(
        &self,
        id: EventId,
        from: EventStatus,
        to: EventStatus,
        change: impl FnOnce(&mut Event) -> R,
    ) -> Result<R, DbError> {
        let mut events = self.events.lock().await;
        let event = events.get_mut(&id).ok_or(DbError::NotFound(id))?;
        if event.status != from {
            return Err(DbError::InvalidTransition {
                id,
                from: event.status,
                to,
            });
        }
        Ok(change(event))
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn stage(&self, new: NewEvent) -> Result<Event, DbError> {
        let event = Event::staged(new, &self.space, &self.node_id, Utc::now());
        self.events.lock().await.insert(event.id, event.clone());
        Ok(event)
    }

    async fn ingest(&self, event: Event) -> Result<bool, DbError> {
        let mut events = self.events.lock().await;
        let held = events.get(&event.id).is_some_and(|held| !held.is_handed_off());
        if held {
            return Ok(false);
        }
        events.insert(event.id, event);
        Ok(true)
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, DbError> {
        Ok(self.events.lock().await.get(&id).cloned())
    }

    async fn mark_processing(&self, id: EventId) -> Result<Event, DbError> {
        self.update_if(id, EventStatus::Staged, EventStatus::Processing, |event| {
            event.status = EventStatus::Processing;
            event.last_attempt_at = Some(Utc::now());
            event.clone()
        })
        .await
    }

    async fn mark_processed(&self, id: EventId) -> Result<(), DbError> {
        self.update_if(id, EventStatus::Processing, EventStatus::Processed, |event| {
            event.status = EventStatus::Processed;
            event.last_error = None;
        })
        .await
    }

    async fn mark_forwarded(&self, id: EventId, node_id: &str) -> Result<(), DbError> {
        self.update_if(id, EventStatus::Processing, EventStatus::Processed, |event| {
            event.status = EventStatus::Processed;
            event.last_error = None;
            event.forwarded_to = Some(node_id.to_string());
        })
        .await
    }

    async fn mark_failed(
        &self,
        id: EventId,
        reason: &str,
        plan: RetryPlan,
    ) -> Result<bool, DbError> {
        self.update_if(id, EventStatus::Processing, EventStatus::Staged, |event| {
            event.retries += 1;
            event.last_error = Some(reason.to_string());
            if event.retries >= plan.max_retries {
                event.status = EventStatus::Failed;
                false
            } else {
                event.status = EventStatus::Staged;
                event.next_attempt_at = retry_at(Utc::now(), plan.backoff);
                true
            }
        })
        .await
    }

    async fn mark_rejected(&self, id: EventId, reason: &str) -> Result<(), DbError> {
        self.update_if(id, EventStatus::Processing, EventStatus::Failed, |event| {
            event.status = EventStatus::Failed;
            event.last_error = Some(reason.to_string());
        })
        .await
    }

    async fn cancel(&self, id: EventId) -> Result<(), DbError> {
        self.update_if(id, EventStatus::Staged, EventStatus::Cancelled, |event| {
            event.status = EventStatus::Cancelled;
        })
        .await
    }

    async fn list_pending(&self, older_than: Duration) -> Result<Vec<Event>, DbError> {
        let cutoff = lease_cutoff(Utc::now(), older_than);
        let events = self.events.lock().await;
        let mut pending: Vec<Event> = events
            .values()
            .filter(|e| e.status == EventStatus::Processing)
            .filter(|e| e.last_attempt_at.is_some_and(|at| at < cutoff))
            .cloned()
            .collect();
        pending.sort_by_key(|e| e.last_attempt_at);
        Ok(pending)
    }

    async fn list_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, DbError> {
        let events = self.events.lock().await;

        let mut heads: BTreeMap<u32, &Event> = BTreeMap::new();
        for event in events.values().filter(|e| !e.status.is_terminal()) {
            heads
                .entry(event.token)
                .and_modify(|head| {
                    if (event.created_at, event.id) < (head.created_at, head.id) {
                        *head = event;
                    }
                })
                .or_insert(event);
        }

        let mut due: Vec<Event> = heads
            .into_values()
            .filter(|head| head.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.next_attempt_at, e.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<Event>, DbError> {
        let events = self.events.lock().await;
        let mut matching: Vec<Event> =
            events.values().filter(|e| e.status == status).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn counts(&self) -> Result<StatusCounts, DbError> {
        let mut counts = StatusCounts::default();
        for event in self.events.lock().await.values() {
            counts.add(event.status, 1);
        }
        Ok(counts)
    }
}
