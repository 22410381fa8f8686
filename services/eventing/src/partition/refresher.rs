//! Background loop that keeps the partitioner's view current.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{MembershipSource, TokenPartitioner};

pub struct MembershipRefresher {
    source: Arc<dyn MembershipSource>,
    partitioner: Arc<TokenPartitioner>,
    interval: Duration,
}

impl MembershipRefresher {
    pub fn new(
        source: Arc<dyn MembershipSource>,
        partitioner: Arc<TokenPartitioner>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            partitioner,
            interval,
        }
    }

    /// Fetches one view and applies it. Returns whether the view changed.
    pub async fn refresh_once(&self) -> Result<bool, super::PartitionError> {
        let view = self.source.fetch().await?;
        self.partitioner.apply(view)
    }

    #[instrument(skip(self, shutdown), name = "membership_refresher")]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            node_id = %self.partitioner.local_node_id(),
            interval_ms = self.interval.as_millis() as u64,
            "Starting membership refresher"
        );

        let mut consecutive_failures = 0u32;
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.refresh_once().await {
                        Ok(changed) => {
                            consecutive_failures = 0;
                            if changed {
                                debug!(
                                    version = self.partitioner.view().version,
                                    "Membership view refreshed",
                                );
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            if consecutive_failures <= 3 {
                                warn!(
                                    error = %e,
                                    consecutive_failures,
                                    "Membership refresh failed",
                                );
                            } else {
                                error!(
                                    error = %e,
                                    consecutive_failures,
                                    "Membership refresh failed repeatedly",
                                );
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Membership refresher shutting down");
                        break;
                    }
                }
            }
        }
    }
}
