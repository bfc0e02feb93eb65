//! Virtual environments on a target.

use drover_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `virtual_environments` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct VirtualEnv {
    pub id: DbId,
    pub target_id: DbId,
    /// Unique per target.
    pub name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
