//! Persistence seams of the pipeline.
//!
//! The executor and handlers only talk to [`RequestStore`] and
//! [`InventoryStore`]. [`PgStore`] implements both on top of the
//! `drover-db` repositories.

use std::sync::Arc;

use async_trait::async_trait;
use drover_core::locking::LockAttempt;
use drover_core::markers::InstalledLibraryInfo;
use drover_core::request::RequestState;
use drover_core::types::DbId;
use drover_db::models::initialization::InitializationPlan;
use drover_db::models::installed_library::InstalledLibrary;
use drover_db::models::request::{CreateRequest, Request};
use drover_db::models::target::Target;
use drover_db::models::virtual_env::VirtualEnv;
use drover_db::repositories::{InstalledLibraryRepo, RequestRepo, TargetRepo, VirtualEnvRepo};
use drover_db::DbPool;

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: DbId },
}

/// Request rows and their lock state.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn find_request(&self, id: DbId) -> Result<Option<Request>, StoreError>;

    async fn create_request(&self, input: &CreateRequest) -> Result<Request, StoreError>;

    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Request>, StoreError>;

    /// Durably append `chunk` to the request's output.
    async fn append_output(&self, id: DbId, chunk: &str) -> Result<(), StoreError>;

    async fn set_output(&self, id: DbId, output: &str) -> Result<(), StoreError>;

    /// Compare-and-set state move; `false` if the request was not in `from`.
    async fn transition(
        &self,
        id: DbId,
        from: RequestState,
        to: RequestState,
    ) -> Result<bool, StoreError>;

    async fn is_processing_allowed(&self, request: &Request) -> Result<bool, StoreError>;

    /// Atomic Pending to Scheduled move guarded by the conflict rules.
    async fn try_lock(&self, request: &Request) -> Result<LockAttempt, StoreError>;

    /// Force a request still holding its lock to Failed.
    async fn release(&self, id: DbId) -> Result<bool, StoreError>;

    async fn mark_triggered(&self, id: DbId) -> Result<bool, StoreError>;
}

/// Targets, virtual environments and installed libraries.
#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn find_target(&self, id: DbId) -> Result<Option<Target>, StoreError>;

    async fn list_virtual_envs(&self, target_id: DbId) -> Result<Vec<VirtualEnv>, StoreError>;

    async fn list_installed_libraries(
        &self,
        virtual_env_id: DbId,
    ) -> Result<Vec<InstalledLibrary>, StoreError>;

    /// Replace the library set of one environment, creating it if absent.
    async fn replace_installed_libraries(
        &self,
        target_id: DbId,
        env_name: &str,
        libraries: &[InstalledLibraryInfo],
    ) -> Result<(), StoreError>;

    /// Replace the target's environment set by name.
    async fn replace_virtual_envs(&self, target_id: DbId, names: &[String])
        -> Result<(), StoreError>;

    async fn delete_virtual_env(&self, target_id: DbId, name: &str) -> Result<bool, StoreError>;

    async fn delete_all_virtual_envs(&self, target_id: DbId) -> Result<u64, StoreError>;

    /// Apply `plan` in one transaction and return the created follow-ups.
    ///
    /// Follow-ups are created already triggered so a worker picks them up
    /// even if they never reach the in-memory queue.
    async fn apply_initialization(
        &self,
        plan: &InitializationPlan,
    ) -> Result<Vec<Request>, StoreError>;
}

/// Everything the executor needs from persistence.
pub trait Store: RequestStore + InventoryStore {}

impl<T: RequestStore + InventoryStore> Store for T {}

pub type SharedStore = Arc<dyn Store>;

// ---------------------------------------------------------------------------
// PostgreSQL
// ---------------------------------------------------------------------------

/// [`Store`] backed by PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
    sync_batch_size: usize,
}

impl PgStore {
    pub fn new(pool: DbPool, sync_batch_size: usize) -> Self {
        Self {
            pool,
            sync_batch_size,
        }
    }
}

#[async_trait]
impl RequestStore for PgStore {
    async fn find_request(&self, id: DbId) -> Result<Option<Request>, StoreError> {
        Ok(RequestRepo::find_by_id(&self.pool, id).await?)
    }

    async fn create_request(&self, input: &CreateRequest) -> Result<Request, StoreError> {
        Ok(RequestRepo::create(&self.pool, input).await?)
    }

    async fn list_children(&self, parent_id: DbId) -> Result<Vec<Request>, StoreError> {
        Ok(RequestRepo::list_children(&self.pool, parent_id).await?)
    }

    async fn append_output(&self, id: DbId, chunk: &str) -> Result<(), StoreError> {
        Ok(RequestRepo::append_output(&self.pool, id, chunk).await?)
    }

    async fn set_output(&self, id: DbId, output: &str) -> Result<(), StoreError> {
        Ok(RequestRepo::set_output(&self.pool, id, output).await?)
    }

    async fn transition(
        &self,
        id: DbId,
        from: RequestState,
        to: RequestState,
    ) -> Result<bool, StoreError> {
        Ok(RequestRepo::transition(&self.pool, id, from, to).await?)
    }

    async fn is_processing_allowed(&self, request: &Request) -> Result<bool, StoreError> {
        Ok(RequestRepo::is_processing_allowed(&self.pool, request).await?)
    }

    async fn try_lock(&self, request: &Request) -> Result<LockAttempt, StoreError> {
        Ok(RequestRepo::try_lock(&self.pool, request).await?)
    }

    async fn release(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(RequestRepo::release(&self.pool, id).await?)
    }

    async fn mark_triggered(&self, id: DbId) -> Result<bool, StoreError> {
        Ok(RequestRepo::mark_triggered(&self.pool, id).await?)
    }
}

#[async_trait]
impl InventoryStore for PgStore {
    async fn find_target(&self, id: DbId) -> Result<Option<Target>, StoreError> {
        Ok(TargetRepo::find_by_id(&self.pool, id).await?)
    }

    async fn list_virtual_envs(&self, target_id: DbId) -> Result<Vec<VirtualEnv>, StoreError> {
        Ok(VirtualEnvRepo::list_for_target(&self.pool, target_id).await?)
    }

    async fn list_installed_libraries(
        &self,
        virtual_env_id: DbId,
    ) -> Result<Vec<InstalledLibrary>, StoreError> {
        Ok(InstalledLibraryRepo::list_for_env(&self.pool, virtual_env_id).await?)
    }

    async fn replace_installed_libraries(
        &self,
        target_id: DbId,
        env_name: &str,
        libraries: &[InstalledLibraryInfo],
    ) -> Result<(), StoreError> {
        Ok(InstalledLibraryRepo::replace_for_env(
            &self.pool,
            target_id,
            env_name,
            libraries,
            self.sync_batch_size,
        )
        .await?)
    }

    async fn replace_virtual_envs(
        &self,
        target_id: DbId,
        names: &[String],
    ) -> Result<(), StoreError> {
        Ok(VirtualEnvRepo::replace_for_target(&self.pool, target_id, names).await?)
    }

    async fn delete_virtual_env(&self, target_id: DbId, name: &str) -> Result<bool, StoreError> {
        Ok(VirtualEnvRepo::delete_by_name(&self.pool, target_id, name).await?)
    }

    async fn delete_all_virtual_envs(&self, target_id: DbId) -> Result<u64, StoreError> {
        Ok(VirtualEnvRepo::delete_for_target(&self.pool, target_id).await?)
    }

    async fn apply_initialization(
        &self,
        plan: &InitializationPlan,
    ) -> Result<Vec<Request>, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(version) = &plan.python_version {
            if !TargetRepo::set_python_version(&mut *tx, plan.target_id, version).await? {
                return Err(StoreError::NotFound {
                    entity: "target",
                    id: plan.target_id,
                });
            }
        }

        for name in &plan.ensure_virtual_envs {
            VirtualEnvRepo::ensure(&mut *tx, plan.target_id, name).await?;
        }

        let mut created = Vec::with_capacity(plan.follow_ups.len());
        for follow_up in &plan.follow_ups {
            created.push(RequestRepo::create_triggered_with(&mut *tx, follow_up).await?);
        }

        tx.commit().await?;
        Ok(created)
    }
}
