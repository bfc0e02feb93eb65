//! Gatekeeping of request execution per target and virtual environment.

use drover_core::locking::{LockAttempt, LockKey, LOCKED_FOR_PROCESSING};
use drover_db::models::request::Request;

use crate::store::{SharedStore, StoreError};

/// Lock operations over the durable request state.
///
/// Holding a lock means being in Scheduled or Running, so locks survive
/// worker restarts and are visible to every worker sharing the database.
#[derive(Clone)]
pub struct LockingService {
    store: SharedStore,
}

impl LockingService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    /// Cheap pre-check; [`lock`](Self::lock) still decides atomically.
    pub async fn is_processing_allowed(&self, request: &Request) -> Result<bool, StoreError> {
        self.store.is_processing_allowed(request).await
    }

    /// Try to take the lock for `request`, moving it to Scheduled.
    pub async fn lock(&self, request: &Request) -> Result<LockAttempt, StoreError> {
        let attempt = self.store.try_lock(request).await?;
        tracing::debug!(
            request_id = request.id,
            lock = %lock_key(request),
            ?attempt,
            "Lock attempt",
        );
        Ok(attempt)
    }

    /// Release the lock of `request`.
    ///
    /// If the request never reached a terminal state it is forced to Failed.
    pub async fn unlock(&self, request: &Request) -> Result<(), StoreError> {
        if self.store.release(request.id).await? {
            tracing::warn!(
                request_id = request.id,
                lock = %lock_key(request),
                "Request released without finalization, marked failed",
            );
        }
        Ok(())
    }

    /// Record that `request` could not run because its lock is taken.
    ///
    /// Overwrites the output with [`LOCKED_FOR_PROCESSING`]; state is kept.
    pub async fn mark_denied(&self, request: &Request) -> Result<(), StoreError> {
        tracing::info!(
            request_id = request.id,
            lock = %lock_key(request),
            "Request rejected, lock held by another request",
        );
        self.store.set_output(request.id, LOCKED_FOR_PROCESSING).await
    }
}

pub fn lock_key(request: &Request) -> LockKey {
    LockKey::new(request.target_id, request.scope())
}
