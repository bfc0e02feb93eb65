//! Repository for the `virtual_environments` table.

use drover_core::types::DbId;
use sqlx::{PgConnection, PgPool};

use crate::models::virtual_env::VirtualEnv;

/// Column list for `virtual_environments` queries.
const COLUMNS: &str = "id, target_id, name, created_at, updated_at";

/// Provides access to the virtual environments of a target.
pub struct VirtualEnvRepo;

impl VirtualEnvRepo {
    /// All environments of a target, ordered by name.
    pub async fn list_for_target(
        pool: &PgPool,
        target_id: DbId,
    ) -> Result<Vec<VirtualEnv>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM virtual_environments WHERE target_id = $1 ORDER BY name ASC"
        );
        sqlx::query_as::<_, VirtualEnv>(&query)
            .bind(target_id)
            .fetch_all(pool)
            .await
    }

    pub async fn find_by_name(
        pool: &PgPool,
        target_id: DbId,
        name: &str,
    ) -> Result<Option<VirtualEnv>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM virtual_environments WHERE target_id = $1 AND name = $2"
        );
        sqlx::query_as::<_, VirtualEnv>(&query)
            .bind(target_id)
            .bind(name)
            .fetch_optional(pool)
            .await
    }

    /// Return the named environment, creating it if absent.
    pub async fn ensure(
        conn: &mut PgConnection,
        target_id: DbId,
        name: &str,
    ) -> Result<VirtualEnv, sqlx::Error> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let query = format!(
            "INSERT INTO virtual_environments (target_id, name) \
             VALUES ($1, $2) \
             ON CONFLICT (target_id, name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, VirtualEnv>(&query)
            .bind(target_id)
            .bind(name)
            .fetch_one(conn)
            .await
    }

    /// Make the target's environment set equal to `names`.
    ///
    /// Environments not listed are deleted together with their libraries;
    /// listed ones that are missing are created. Runs in one transaction.
    pub async fn replace_for_target(
        pool: &PgPool,
        target_id: DbId,
        names: &[String],
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query(
            "DELETE FROM virtual_environments \
             WHERE target_id = $1 AND NOT (name = ANY($2::TEXT[]))",
        )
        .bind(target_id)
        .bind(names)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO virtual_environments (target_id, name) \
             SELECT $1, n FROM UNNEST($2::TEXT[]) AS n \
             ON CONFLICT (target_id, name) DO NOTHING",
        )
        .bind(target_id)
        .bind(names)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete one environment and its libraries.
    ///
    /// Returns `true` if a row was removed.
    pub async fn delete_by_name(
        pool: &PgPool,
        target_id: DbId,
        name: &str,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM virtual_environments WHERE target_id = $1 AND name = $2")
                .bind(target_id)
                .bind(name)
                .execute(pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete every environment of a target. Returns the number removed.
    pub async fn delete_for_target(pool: &PgPool, target_id: DbId) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM virtual_environments WHERE target_id = $1")
            .bind(target_id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected())
    }
}
