//! Pickup of requests triggered by other processes.
//!
//! The API layer flags a request with `triggered_at`; this loop claims flagged
//! requests with `SELECT FOR UPDATE SKIP LOCKED` via
//! [`RequestRepo::claim_triggered`] and hands them to the local dispatcher.

use std::time::Duration;

use drover_db::repositories::RequestRepo;
use drover_db::DbPool;
use drover_pipeline::dispatcher::DispatcherHandle;
use tokio_util::sync::CancellationToken;

/// Maximum number of requests claimed per poll.
const CLAIM_BATCH: i64 = 50;

/// Periodically moves triggered requests from the database into the
/// dispatcher queue.
pub struct TriggerPoller {
    pool: DbPool,
    dispatcher: DispatcherHandle,
    poll_interval: Duration,
}

impl TriggerPoller {
    pub fn new(pool: DbPool, dispatcher: DispatcherHandle, poll_interval: Duration) -> Self {
        Self {
            pool,
            dispatcher,
            poll_interval,
        }
    }

    /// Run the poll loop until the cancellation token is triggered.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Trigger poller started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Trigger poller shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "Trigger poll failed");
                    }
                }
            }
        }
    }

    /// Claim triggered requests and queue them. Returns how many were queued.
    pub async fn poll_once(&self) -> Result<usize, sqlx::Error> {
        let claimed = RequestRepo::claim_triggered(&self.pool, CLAIM_BATCH).await?;
        let mut queued = 0;
        for request_id in claimed {
            if self.dispatcher.submit(request_id) {
                tracing::debug!(request_id, "Triggered request queued");
                queued += 1;
            } else {
                tracing::warn!(request_id, "Dispatcher closed, triggered request dropped");
            }
        }
        Ok(queued)
    }
}
