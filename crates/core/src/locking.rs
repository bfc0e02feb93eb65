//! Lock keys and conflict rules for request processing.
//!
//! A request locks either a whole target (no scope) or one virtual
//! environment on it. The rules here are shared by every store
//! implementation; the atomic check-and-set itself belongs to the store.

use crate::types::DbId;

/// Output written to a request that could not acquire its lock.
///
/// Replaces any previous output; the request's state is left untouched.
pub const LOCKED_FOR_PROCESSING: &str = "Whole environment or the particular virtual environment \
     is now being processed, request cannot be executed!";

/// Result of an atomic lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    /// The request moved from Pending to Scheduled and now holds its lock.
    Acquired,
    /// A conflicting request holds a lock; nothing was changed.
    Denied,
    /// The request was no longer Pending, e.g. another worker took it.
    NotPending,
}

/// What a request locks while it is Scheduled or Running.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub target_id: DbId,
    /// `None` locks the whole target.
    pub scope: Option<String>,
}

impl LockKey {
    pub fn new(target_id: DbId, scope: Option<&str>) -> Self {
        Self {
            target_id,
            scope: scope.map(str::to_string),
        }
    }

    /// Lock covering every scope on `target_id`.
    pub fn whole_target(target_id: DbId) -> Self {
        Self {
            target_id,
            scope: None,
        }
    }

    /// Whether two locks may not be held at the same time.
    ///
    /// - Different targets never conflict.
    /// - A whole-target lock conflicts with every lock on the same target.
    /// - Scoped locks conflict only with the same scope.
    pub fn conflicts_with(&self, other: &LockKey) -> bool {
        if self.target_id != other.target_id {
            return false;
        }
        match (&self.scope, &other.scope) {
            (None, _) | (_, None) => true,
            (Some(a), Some(b)) => a == b,
        }
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "target {}/{scope}", self.target_id),
            None => write!(f, "target {} (whole)", self.target_id),
        }
    }
}

/// Whether `candidate` may be locked while `held` locks are active.
pub fn is_lock_available<'a>(
    candidate: &LockKey,
    held: impl IntoIterator<Item = &'a LockKey>,
) -> bool {
    held.into_iter().all(|lock| !candidate.conflicts_with(lock))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
