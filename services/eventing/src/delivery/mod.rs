//! Delivery manager: the loop that moves staged events to a final status.
//!
//! Each sweep asks the store for dispatchable events (the head of every
//! token that is due), claims each one and hands it to the dispatcher under
//! a deadline. At most one attempt per token is in flight on this node, and
//! the number of concurrent attempts is bounded by a semaphore.
//!
//! A separate recovery sweep finds attempts that never reported back (the
//! process died, the task was aborted) and counts them as failed attempts,
//! so they are retried and still bounded by the retry ceiling.

mod backoff;
mod stats;

pub use backoff::Backoff;
pub use stats::{DeliveryStats, DeliveryStatsSnapshot};

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sgw_events::{Event, RulesSnapshot};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::db::{DbError, EventStore, RetryPlan};
use crate::dispatch::{DispatchError, DispatchOutcome, Dispatcher};
use crate::rules::RuleRegistry;

/// Configuration for the delivery manager.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Maximum concurrent attempts.
    pub concurrency: usize,

    /// Maximum events fetched per sweep.
    pub batch_size: usize,

    pub poll_interval: Duration,

    /// Failed attempts allowed before an event is failed for good. Rules may
    /// override it.
    pub max_retries: u32,

    pub backoff: Backoff,

    /// Deadline of a single attempt. Rules may override it.
    pub dispatch_timeout: Duration,

    pub recovery_interval: Duration,

    /// How long an attempt may stay in `processing` before the recovery
    /// sweep gives up on it. Must exceed every attempt deadline.
    pub processing_lease: Duration,

    /// How long shutdown waits for in-flight attempts.
    pub shutdown_grace: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            batch_size: 64,
            poll_interval: Duration::from_millis(200),
            max_retries: 3,
            backoff: Backoff::default(),
            dispatch_timeout: Duration::from_secs(10),
            recovery_interval: Duration::from_secs(30),
            processing_lease: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

struct Inner {
    store: Arc<dyn EventStore>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<RuleRegistry>,
    config: DeliveryConfig,
    stats: DeliveryStats,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<u32>>,
}

impl Inner {
    fn in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<u32>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn retry_plan(&self, rules: &RulesSnapshot, event: &Event) -> RetryPlan {
        let rule = event.rule.as_deref().and_then(|id| rules.get(id));
        RetryPlan {
            max_retries: rule.and_then(|r| r.retries).unwrap_or(self.config.max_retries),
            backoff: self.config.backoff.delay(event.retries),
        }
    }

    fn attempt_timeout(&self, rules: &RulesSnapshot, event: &Event) -> Duration {
        event
            .rule
            .as_deref()
            .and_then(|id| rules.get(id))
            .and_then(|r| r.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.config.dispatch_timeout)
    }
}

/// Marks a token busy for as long as it is held.
struct TokenClaim {
    inner: Arc<Inner>,
    token: u32,
}

impl TokenClaim {
    fn acquire(inner: &Arc<Inner>, token: u32) -> Option<Self> {
        inner.in_flight().insert(token).then(|| Self {
            inner: inner.clone(),
            token,
        })
    }
}

impl Drop for TokenClaim {
    fn drop(&mut self) {
        self.inner.in_flight().remove(&self.token);
    }
}

/// Owns every status transition after staging.
#[derive(Clone)]
pub struct DeliveryManager {
    inner: Arc<Inner>,
}

impl DeliveryManager {
    pub fn new(
        store: Arc<dyn EventStore>,
        dispatcher: Arc<Dispatcher>,
        registry: Arc<RuleRegistry>,
        config: DeliveryConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                dispatcher,
                registry,
                config,
                stats: DeliveryStats::default(),
                permits,
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn stats(&self) -> DeliveryStatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Run until the shutdown signal is received, then drain in-flight
    /// attempts for up to the configured grace period.
    #[instrument(skip(self, shutdown), name = "delivery_manager")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let config = &self.inner.config;
        info!(
            concurrency = config.concurrency,
            max_retries = config.max_retries,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            "Starting delivery manager"
        );

        let mut poll = tokio::time::interval(config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut recovery = tokio::time::interval(config.recovery_interval);
        recovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.sweep(&mut tasks).await {
                        warn!(error = %e, "Delivery sweep failed");
                    }
                }
                _ = recovery.tick() => {
                    match self.recover_once().await {
                        Ok(0) => {}
                        Ok(recovered) => info!(recovered, "Recovered abandoned attempts"),
                        Err(e) => warn!(error = %e, "Recovery sweep failed"),
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Delivery attempt panicked");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(
                            in_flight = tasks.len(),
                            "Shutdown signal received, draining delivery attempts",
                        );
                        break;
                    }
                }
            }
        }

        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            // Aborted attempts stay in `processing` until the next recovery sweep.
            warn!(abandoned = tasks.len(), "Delivery attempts did not finish in time");
            tasks.abort_all();
        }
        info!("Delivery manager stopped");
    }

    /// Runs one sweep and waits for every attempt it started. Returns the
    /// number of attempts started.
    pub async fn run_once(&self) -> Result<usize, DbError> {
        let mut tasks = JoinSet::new();
        let started = self.sweep(&mut tasks).await?;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Delivery attempt panicked");
            }
        }
        Ok(started)
    }

    async fn sweep(&self, tasks: &mut JoinSet<()>) -> Result<usize, DbError> {
        if self.inner.permits.available_permits() == 0 {
            return Ok(0);
        }

        let due = self
            .inner
            .store
            .list_dispatchable(Utc::now(), self.inner.config.batch_size)
            .await?;

        let mut started = 0;
        for event in due {
            let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(claim) = TokenClaim::acquire(&self.inner, event.token) else {
                continue;
            };
            let inner = self.inner.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let _claim = claim;
                attempt(&inner, event).await;
            });
            started += 1;
        }

        if started > 0 {
            debug!(started, "Started delivery attempts");
        }
        Ok(started)
    }

    /// Fails attempts whose lease ran out. Returns how many were found.
    pub async fn recover_once(&self) -> Result<usize, DbError> {
        let inner = &self.inner;
        let stuck = inner.store.list_pending(inner.config.processing_lease).await?;

        let mut recovered = 0;
        for event in stuck {
            if inner.in_flight().contains(&event.token) {
                continue;
            }
            let rules = inner.registry.snapshot(&event.project);
            let plan = inner.retry_plan(&rules, &event);
            match inner.store.mark_failed(event.id, "dispatch lease expired", plan).await {
                Ok(retry) => {
                    recovered += 1;
                    inner.stats.recovered();
                    if retry {
                        inner.stats.retried();
                    } else {
                        inner.stats.failed();
                    }
                    warn!(
                        event_id = %event.id,
                        token = event.token,
                        retry,
                        "Recovered abandoned attempt",
                    );
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }
}

/// One attempt: claim, dispatch under a deadline, record the outcome.
async fn attempt(inner: &Inner, event: Event) {
    let event = match inner.store.mark_processing(event.id).await {
        Ok(event) => event,
        Err(e) if e.is_conflict() => {
            debug!(event_id = %event.id, error = %e, "Event claimed elsewhere");
            return;
        }
        Err(e) => {
            warn!(event_id = %event.id, error = %e, "Failed to claim event");
            return;
        }
    };
    inner.stats.dispatched();

    let rules = inner.registry.snapshot(&event.project);
    let deadline = inner.attempt_timeout(&rules, &event);
    let dispatch = inner.dispatcher.dispatch(&rules, &event);
    let result = match tokio::time::timeout(deadline, dispatch).await {
        Ok(result) => result,
        Err(_) => Err(DispatchError::Transient(format!(
            "attempt timed out after {}ms",
            deadline.as_millis()
        ))),
    };

    let id = event.id;
    let recorded = match result {
        Ok(DispatchOutcome::Executed) => {
            inner.stats.processed();
            info!(event_id = %id, token = event.token, "Event processed");
            inner.store.mark_processed(id).await
        }
        Ok(DispatchOutcome::Forwarded { node_id }) => {
            inner.stats.forwarded();
            info!(
                event_id = %id,
                token = event.token,
                owner = %node_id,
                "Event forwarded to owner"
            );
            inner.store.mark_forwarded(id, &node_id).await
        }
        Err(e) if e.is_retryable() => {
            let plan = inner.retry_plan(&rules, &event);
            match inner.store.mark_failed(id, &e.to_string(), plan).await {
                Ok(true) => {
                    inner.stats.retried();
                    warn!(
                        event_id = %id,
                        retries = event.retries + 1,
                        backoff_ms = plan.backoff.as_millis() as u64,
                        error = %e,
                        "Event attempt failed, will retry"
                    );
                    Ok(())
                }
                Ok(false) => {
                    inner.stats.failed();
                    error!(
                        event_id = %id,
                        retries = event.retries + 1,
                        error = %e,
                        "Event failed after exhausting retries"
                    );
                    Ok(())
                }
                Err(db) => Err(db),
            }
        }
        Err(e) => {
            inner.stats.failed();
            error!(event_id = %id, error = %e, "Event rejected");
            inner.store.mark_rejected(id, &e.to_string()).await
        }
    };

    if let Err(e) = recorded {
        error!(event_id = %id, error = %e, "Failed to record attempt outcome");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_lease_outlives_attempt_deadline() {
        let config = DeliveryConfig::default();
        assert!(config.processing_lease > config.dispatch_timeout);
        assert!(config.concurrency > 0);
    }
}
