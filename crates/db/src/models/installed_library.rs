//! Libraries installed in a virtual environment.

use drover_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `installed_libraries` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct InstalledLibrary {
    pub id: DbId,
    pub virtual_environment_id: DbId,
    pub name: String,
    pub version: String,
    pub created_at: Timestamp,
}

impl InstalledLibrary {
    /// Pip requirement pinning this exact version, e.g. `requests==2.18.4`.
    pub fn requirement(&self) -> String {
        format!("{}=={}", self.name, self.version)
    }
}
