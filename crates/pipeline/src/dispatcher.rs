//! Concurrent scheduling of requests.
//!
//! Request ids enter a work queue through a [`DispatcherHandle`]. The
//! [`Dispatcher`] loop spawns one task per id, bounded by a semaphore of
//! `worker_concurrency` permits. Follow-ups returned by a successful request
//! are pushed back onto the same queue and run as independent requests.

use std::sync::Arc;

use drover_core::types::DbId;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::executor::{Outcome, RequestExecutor};

/// Cloneable handle for submitting request ids to a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    sender: mpsc::UnboundedSender<DbId>,
}

impl DispatcherHandle {
    /// Queue `request_id` for processing.
    ///
    /// Returns `false` if the dispatcher has shut down.
    pub fn submit(&self, request_id: DbId) -> bool {
        self.sender.send(request_id).is_ok()
    }
}

/// Work-queue consumer running requests concurrently.
pub struct Dispatcher {
    executor: Arc<RequestExecutor>,
    semaphore: Arc<Semaphore>,
    receiver: mpsc::UnboundedReceiver<DbId>,
    handle: DispatcherHandle,
}

impl Dispatcher {
    pub fn new(executor: Arc<RequestExecutor>, concurrency: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            receiver,
            handle: DispatcherHandle { sender },
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Consume the queue until `cancel` fires, then wait for in-flight
    /// requests to finish.
    ///
    /// Running processes are not interrupted.
    pub async fn run(mut self, cancel: CancellationToken) {
        let tracker = TaskTracker::new();
        tracing::info!(
            concurrency = self.semaphore.available_permits(),
            "Request dispatcher started",
        );

        loop {
            let request_id = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.receiver.recv() => match next {
                    Some(id) => id,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let executor = Arc::clone(&self.executor);
            let handle = self.handle.clone();
            tracker.spawn(async move {
                let _permit = permit;
                run_one(&executor, &handle, request_id).await;
            });
        }

        self.receiver.close();
        tracker.close();
        tracing::info!(in_flight = tracker.len(), "Request dispatcher shutting down");
        tracker.wait().await;
    }
}

async fn run_one(executor: &RequestExecutor, handle: &DispatcherHandle, request_id: DbId) {
    match executor.process(request_id).await {
        Ok(Outcome::Succeeded { follow_ups }) => {
            for follow_up in follow_ups {
                tracing::debug!(
                    request_id = follow_up.id,
                    parent_request_id = request_id,
                    "Submitting follow-up request",
                );
                if !handle.submit(follow_up.id) {
                    tracing::warn!(
                        request_id = follow_up.id,
                        "Dispatcher closed, follow-up left pending",
                    );
                }
            }
        }
        Ok(Outcome::LockDenied) => {
            tracing::info!(request_id, "Request denied by lock");
        }
        Ok(Outcome::Skipped) | Ok(Outcome::Failed) => {}
        Err(e) => {
            tracing::error!(request_id, error = %e, "Request processing aborted");
        }
    }
}
