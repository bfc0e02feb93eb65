//! Write set produced by a successful `initialize` request.

use drover_core::types::DbId;

use super::request::CreateRequest;

/// Everything an initialization persists, applied in one transaction.
#[derive(Debug, Clone)]
pub struct InitializationPlan {
    pub target_id: DbId,
    /// `None` leaves the stored version untouched.
    pub python_version: Option<String>,
    /// Environments created if they do not exist yet.
    pub ensure_virtual_envs: Vec<String>,
    /// Pending follow-up requests, one per known environment.
    pub follow_ups: Vec<CreateRequest>,
}
