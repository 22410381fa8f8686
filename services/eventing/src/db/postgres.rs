//! Postgres-backed event store.
//!
//! Rows are scoped by the id of the node holding them, so several nodes can
//! share one database without seeing each other's queues.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sgw_events::{Event, EventStatus, NewEvent, TokenSpace};
use sgw_id::EventId;
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tracing::debug;

use super::event_store::{lease_cutoff, retry_at, EventStore, RetryPlan, StatusCounts};
use super::DbError;

const COLUMNS: &str = "id, project, rule, event_type, payload, token, status, retries, \
     created_at, last_attempt_at, next_attempt_at, source_node_id, last_error, forwarded_to";

/// Plain insert; a held id is left alone.
const KEEP_HELD: &str = "ON CONFLICT (holder_node_id, id) DO NOTHING";

/// Insert that also takes back a copy this node handed off.
const RESTAGE_HANDED_OFF: &str = r#"
    ON CONFLICT (holder_node_id, id) DO UPDATE SET
        project = EXCLUDED.project,
        rule = EXCLUDED.rule,
        event_type = EXCLUDED.event_type,
        payload = EXCLUDED.payload,
        token = EXCLUDED.token,
        status = EXCLUDED.status,
        retries = EXCLUDED.retries,
        created_at = EXCLUDED.created_at,
        last_attempt_at = EXCLUDED.last_attempt_at,
        next_attempt_at = EXCLUDED.next_attempt_at,
        source_node_id = EXCLUDED.source_node_id,
        last_error = EXCLUDED.last_error,
        forwarded_to = NULL
    WHERE eventing_events.status = 'processed' AND eventing_events.forwarded_to IS NOT NULL
"#;

/// A row from the `eventing_events` table.
#[derive(Debug, Clone)]
struct EventRow {
    id: String,
    project: String,
    rule: Option<String>,
    event_type: String,
    payload: serde_json::Value,
    token: i32,
    status: String,
    retries: i32,
    created_at: DateTime<Utc>,
    last_attempt_at: Option<DateTime<Utc>>,
    next_attempt_at: DateTime<Utc>,
    source_node_id: String,
    last_error: Option<String>,
    forwarded_to: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            project: row.try_get("project")?,
            rule: row.try_get("rule")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            token: row.try_get("token")?,
            status: row.try_get("status")?,
            retries: row.try_get("retries")?,
            created_at: row.try_get("created_at")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            next_attempt_at: row.try_get("next_attempt_at")?,
            source_node_id: row.try_get("source_node_id")?,
            last_error: row.try_get("last_error")?,
            forwarded_to: row.try_get("forwarded_to")?,
        })
    }
}

impl TryFrom<EventRow> for Event {
    type Error = DbError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        let corrupt = |reason: String| DbError::Corrupt {
            id: row.id.clone(),
            reason,
        };
        let id = row.id.parse::<EventId>().map_err(|e| corrupt(e.to_string()))?;
        let status = row
            .status
            .parse::<EventStatus>()
            .map_err(|e| corrupt(e.to_string()))?;
        let token = u32::try_from(row.token)
            .map_err(|_| corrupt(format!("negative token {}", row.token)))?;
        let retries = u32::try_from(row.retries)
            .map_err(|_| corrupt(format!("negative retries {}", row.retries)))?;

        Ok(Event {
            id,
            project: row.project,
            rule: row.rule,
            event_type: row.event_type,
            payload: row.payload,
            token,
            status,
            retries,
            created_at: row.created_at,
            last_attempt_at: row.last_attempt_at,
            next_attempt_at: row.next_attempt_at,
            source_node_id: row.source_node_id,
            last_error: row.last_error,
            forwarded_to: row.forwarded_to,
        })
    }
}

fn to_events(rows: Vec<EventRow>) -> Result<Vec<Event>, DbError> {
    rows.into_iter().map(Event::try_from).collect()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Event store backed by the `eventing_events` table.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
    node_id: String,
    space: TokenSpace,
}

impl PgEventStore {
    pub fn new(pool: PgPool, node_id: impl Into<String>, space: TokenSpace) -> Self {
        Self {
            pool,
            node_id: node_id.into(),
            space,
        }
    }

    /// Writes `event` under this node. `on_conflict` decides what happens to
    /// a row already held under the same id.
    async fn insert(&self, event: &Event, on_conflict: &str) -> Result<bool, DbError> {
        let sql = format!(
            r#"
            INSERT INTO eventing_events (
                holder_node_id, id, project, rule, event_type, payload, token,
                status, retries, created_at, last_attempt_at, next_attempt_at,
                source_node_id, last_error, forwarded_to
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            {on_conflict}
            "#
        );
        let result = sqlx::query(&sql)
        .bind(&self.node_id)
        .bind(event.id.to_string())
        .bind(&event.project)
        .bind(&event.rule)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.token as i32)
        .bind(event.status.as_str())
        .bind(event.retries as i32)
        .bind(event.created_at)
        .bind(event.last_attempt_at)
        .bind(event.next_attempt_at)
        .bind(&event.source_node_id)
        .bind(&event.last_error)
        .bind(&event.forwarded_to)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Ok(result.rows_affected() == 1)
    }

    /// Explains why a conditional update matched no row.
    async fn transition_error(&self, id: EventId, to: EventStatus) -> DbError {
        match self.get(id).await {
            Ok(Some(current)) => DbError::InvalidTransition {
                id,
                from: current.status,
                to,
            },
            Ok(None) => DbError::NotFound(id),
            Err(e) => e,
        }
    }

    /// Runs a conditional status update. `$1` is the holder, `$2` the id and
    /// `$3`, when given, `value`.
    async fn conditional_update(
        &self,
        sql: &str,
        id: EventId,
        to: EventStatus,
        value: Option<&str>,
    ) -> Result<(), DbError> {
        let mut query = sqlx::query(sql).bind(&self.node_id).bind(id.to_string());
        if let Some(value) = value {
            query = query.bind(value);
        }
        let result = query.execute(&self.pool).await.map_err(DbError::Query)?;
        if result.rows_affected() == 0 {
            return Err(self.transition_error(id, to).await);
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn stage(&self, new: NewEvent) -> Result<Event, DbError> {
        let event = Event::staged(new, &self.space, &self.node_id, Utc::now());
        self.insert(&event, KEEP_HELD).await?;
        debug!(event_id = %event.id, token = event.token, "Staged event");
        Ok(event)
    }

    async fn ingest(&self, event: Event) -> Result<bool, DbError> {
        let stored = self.insert(&event, RESTAGE_HANDED_OFF).await?;
        if stored {
            debug!(event_id = %event.id, source = %event.source_node_id, "Ingested event");
        }
        Ok(stored)
    }

    async fn get(&self, id: EventId) -> Result<Option<Event>, DbError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            "SELECT {COLUMNS} FROM eventing_events WHERE holder_node_id = $1 AND id = $2"
        ))
        .bind(&self.node_id)
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        row.map(Event::try_from).transpose()
    }

    async fn mark_processing(&self, id: EventId) -> Result<Event, DbError> {
        let row = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            UPDATE eventing_events
            SET status = 'processing', last_attempt_at = $3
            WHERE holder_node_id = $1 AND id = $2 AND status = 'staged'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(&self.node_id)
        .bind(id.to_string())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        match row {
            Some(row) => Event::try_from(row),
            None => Err(self.transition_error(id, EventStatus::Processing).await),
        }
    }

    async fn mark_processed(&self, id: EventId) -> Result<(), DbError> {
        self.conditional_update(
            r#"
            UPDATE eventing_events
            SET status = 'processed', last_error = NULL
            WHERE holder_node_id = $1 AND id = $2 AND status = 'processing'
            "#,
            id,
            EventStatus::Processed,
            None,
        )
        .await
    }

    async fn mark_forwarded(&self, id: EventId, node_id: &str) -> Result<(), DbError> {
        self.conditional_update(
            r#"
            UPDATE eventing_events
            SET status = 'processed', last_error = NULL, forwarded_to = $3
            WHERE holder_node_id = $1 AND id = $2 AND status = 'processing'
            "#,
            id,
            EventStatus::Processed,
            Some(node_id),
        )
        .await
    }

    async fn mark_failed(
        &self,
        id: EventId,
        reason: &str,
        plan: RetryPlan,
    ) -> Result<bool, DbError> {
        let now = Utc::now();
        // SET expressions see the pre-update row, so `retries + 1` is the new count.
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE eventing_events
            SET retries = retries + 1,
                last_error = $3,
                status = CASE WHEN retries + 1 >= $4 THEN 'failed' ELSE 'staged' END,
                next_attempt_at = CASE WHEN retries + 1 >= $4 THEN next_attempt_at ELSE $5 END
            WHERE holder_node_id = $1 AND id = $2 AND status = 'processing'
            RETURNING status
            "#,
        )
        .bind(&self.node_id)
        .bind(id.to_string())
        .bind(reason)
        .bind(plan.max_retries as i64)
        .bind(retry_at(now, plan.backoff))
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::Query)?;

        match status {
            Some(status) => Ok(status == EventStatus::Staged.as_str()),
            None => Err(self.transition_error(id, EventStatus::Staged).await),
        }
    }

    async fn mark_rejected(&self, id: EventId, reason: &str) -> Result<(), DbError> {
        self.conditional_update(
            r#"
            UPDATE eventing_events
            SET status = 'failed', last_error = $3
            WHERE holder_node_id = $1 AND id = $2 AND status = 'processing'
            "#,
            id,
            EventStatus::Failed,
            Some(reason),
        )
        .await
    }

    async fn cancel(&self, id: EventId) -> Result<(), DbError> {
        self.conditional_update(
            r#"
            UPDATE eventing_events
            SET status = 'cancelled'
            WHERE holder_node_id = $1 AND id = $2 AND status = 'staged'
            "#,
            id,
            EventStatus::Cancelled,
            None,
        )
        .await
    }

    async fn list_pending(&self, older_than: Duration) -> Result<Vec<Event>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM eventing_events
            WHERE holder_node_id = $1 AND status = 'processing' AND last_attempt_at < $2
            ORDER BY last_attempt_at
            "#
        ))
        .bind(&self.node_id)
        .bind(lease_cutoff(Utc::now(), older_than))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        to_events(rows)
    }

    async fn list_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Event>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM (
                SELECT DISTINCT ON (token) *
                FROM eventing_events
                WHERE holder_node_id = $1 AND status IN ('staged', 'processing')
                ORDER BY token, created_at, id
            ) heads
            WHERE status = 'staged' AND next_attempt_at <= $2
            ORDER BY next_attempt_at, created_at
            LIMIT $3
            "#
        ))
        .bind(&self.node_id)
        .bind(now)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        to_events(rows)
    }

    async fn list_by_status(
        &self,
        status: EventStatus,
        limit: usize,
    ) -> Result<Vec<Event>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM eventing_events
            WHERE holder_node_id = $1 AND status = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(&self.node_id)
        .bind(status.as_str())
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        to_events(rows)
    }

    async fn counts(&self) -> Result<StatusCounts, DbError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) FROM eventing_events
            WHERE holder_node_id = $1
            GROUP BY status
            "#,
        )
        .bind(&self.node_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        let mut counts = StatusCounts::default();
        for (status, n) in rows {
            let status = status.parse::<EventStatus>().map_err(|e| DbError::Corrupt {
                id: "<counts>".to_string(),
                reason: e.to_string(),
            })?;
            counts.add(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}
