//! Repository for the `targets` table.

use drover_core::types::DbId;
use sqlx::{PgConnection, PgPool};

use crate::models::target::{CreateTarget, Target};

/// Column list for `targets` queries.
const COLUMNS: &str = "\
    id, uuid, name, address, image_name, credential_ref, \
    virtual_envs_dir_path, python_version, created_at, updated_at";

/// Provides access to managed hosts.
pub struct TargetRepo;

impl TargetRepo {
    pub async fn create(pool: &PgPool, input: &CreateTarget) -> Result<Target, sqlx::Error> {
        let query = format!(
            "INSERT INTO targets (uuid, name, address, image_name, credential_ref, virtual_envs_dir_path) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, Target>(&query)
            .bind(uuid::Uuid::new_v4())
            .bind(&input.name)
            .bind(&input.address)
            .bind(&input.image_name)
            .bind(&input.credential_ref)
            .bind(&input.virtual_envs_dir_path)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Target>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM targets WHERE id = $1");
        sqlx::query_as::<_, Target>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Record the python version reported by initialization.
    pub async fn set_python_version(
        conn: &mut PgConnection,
        id: DbId,
        version: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE targets SET python_version = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(version)
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
