//! Managed host records.

use drover_core::command::TargetAttributes;
use drover_core::types::{DbId, PublicId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `targets` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Target {
    pub id: DbId,
    pub uuid: PublicId,
    pub name: String,
    pub address: String,
    /// OS image name, e.g. `debian-9-x86_64`.
    pub image_name: String,
    pub credential_ref: String,
    pub virtual_envs_dir_path: String,
    /// Filled in by a successful `initialize` request.
    pub python_version: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Target {
    /// Connection attributes handed to the command builder.
    pub fn attributes(&self) -> TargetAttributes {
        TargetAttributes {
            uuid: self.uuid,
            address: self.address.clone(),
            image_name: self.image_name.clone(),
            credential_ref: self.credential_ref.clone(),
            virtual_envs_dir_path: self.virtual_envs_dir_path.clone(),
        }
    }
}

/// DTO for registering a target.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateTarget {
    pub name: String,
    pub address: String,
    pub image_name: String,
    pub credential_ref: String,
    pub virtual_envs_dir_path: String,
}
