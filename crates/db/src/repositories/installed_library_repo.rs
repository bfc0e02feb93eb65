//! Repository for the `installed_libraries` table.

use drover_core::markers::InstalledLibraryInfo;
use drover_core::types::DbId;
use sqlx::PgPool;

use crate::models::installed_library::InstalledLibrary;
use crate::repositories::VirtualEnvRepo;

/// Column list for `installed_libraries` queries.
const COLUMNS: &str = "id, virtual_environment_id, name, version, created_at";

/// Provides access to libraries installed in virtual environments.
pub struct InstalledLibraryRepo;

impl InstalledLibraryRepo {
    pub async fn list_for_env(
        pool: &PgPool,
        virtual_environment_id: DbId,
    ) -> Result<Vec<InstalledLibrary>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM installed_libraries \
             WHERE virtual_environment_id = $1 \
             ORDER BY name ASC"
        );
        sqlx::query_as::<_, InstalledLibrary>(&query)
            .bind(virtual_environment_id)
            .fetch_all(pool)
            .await
    }

    /// Make the library set of `env_name` equal to `libraries`.
    ///
    /// The environment is created if absent. Inserts are sent in chunks of
    /// `batch_size` rows. Runs in one transaction.
    pub async fn replace_for_env(
        pool: &PgPool,
        target_id: DbId,
        env_name: &str,
        libraries: &[InstalledLibraryInfo],
        batch_size: usize,
    ) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;

        let env = VirtualEnvRepo::ensure(&mut *tx, target_id, env_name).await?;

        sqlx::query("DELETE FROM installed_libraries WHERE virtual_environment_id = $1")
            .bind(env.id)
            .execute(&mut *tx)
            .await?;

        for chunk in libraries.chunks(batch_size.max(1)) {
            let names: Vec<&str> = chunk.iter().map(|l| l.name.as_str()).collect();
            let versions: Vec<&str> = chunk.iter().map(|l| l.version.as_str()).collect();
            sqlx::query(
                "INSERT INTO installed_libraries (virtual_environment_id, name, version) \
                 SELECT $1, * FROM UNNEST($2::TEXT[], $3::TEXT[])",
            )
            .bind(env.id)
            .bind(&names)
            .bind(&versions)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
