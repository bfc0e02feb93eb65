//! Repository for the `requests` table.
//!
//! Lock state lives in the request rows themselves: a request in Scheduled
//! or Running holds the lock for its `(target_id, scope_name)` key.
//! [`RequestRepo::try_lock`] is the only path from Pending to Scheduled and
//! serializes per target with a transaction-scoped advisory lock.

use drover_core::locking::LockAttempt;
use drover_core::request::RequestState;
use drover_core::types::DbId;
use sqlx::{PgConnection, PgPool};

use crate::models::request::{CreateRequest, Request, RequestListQuery};

/// Column list for `requests` queries.
const COLUMNS: &str = "\
    id, uuid, target_id, scope_name, kind, state_id, output, payload, \
    parent_request_id, triggered_at, created_at, updated_at";

/// Maximum page size for request listing.
const MAX_LIMIT: i64 = 100;

/// Default page size for request listing.
const DEFAULT_LIMIT: i64 = 50;

/// Whether another in-flight request on the same target conflicts with
/// `$2`'s key. `$5` is the candidate scope; NULL means whole target.
const CONFLICT_EXISTS: &str = "\
    SELECT EXISTS ( \
        SELECT 1 FROM requests \
        WHERE target_id = $1 AND id <> $2 AND state_id IN ($3, $4) \
          AND ($5::TEXT IS NULL OR scope_name IS NULL OR scope_name = $5) \
    )";

/// Provides persistence and lock transitions for requests.
pub struct RequestRepo;

impl RequestRepo {
    /// Insert a new pending request.
    pub async fn create(pool: &PgPool, input: &CreateRequest) -> Result<Request, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        Self::insert(&mut *conn, input, false).await
    }

    /// Insert a new pending request already flagged for worker pickup.
    ///
    /// Used for follow-ups, so they survive a worker stopping before its
    /// in-memory queue reaches them.
    pub async fn create_triggered_with(
        conn: &mut PgConnection,
        input: &CreateRequest,
    ) -> Result<Request, sqlx::Error> {
        Self::insert(conn, input, true).await
    }

    async fn insert(
        conn: &mut PgConnection,
        input: &CreateRequest,
        triggered: bool,
    ) -> Result<Request, sqlx::Error> {
        let query = format!(
            "INSERT INTO requests \
                 (uuid, target_id, scope_name, kind, state_id, payload, parent_request_id, triggered_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, CASE WHEN $8 THEN NOW() END) \
             RETURNING {COLUMNS}"
        );
        let payload = if input.payload.is_null() {
            serde_json::json!({})
        } else {
            input.payload.clone()
        };
        sqlx::query_as::<_, Request>(&query)
            .bind(uuid::Uuid::new_v4())
            .bind(input.target_id)
            .bind(&input.scope_name)
            .bind(input.kind.as_str())
            .bind(RequestState::Pending.id())
            .bind(payload)
            .bind(input.parent_request_id)
            .bind(triggered)
            .fetch_one(conn)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<Request>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM requests WHERE id = $1");
        sqlx::query_as::<_, Request>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn find_by_uuid(
        pool: &PgPool,
        uuid: uuid::Uuid,
    ) -> Result<Option<Request>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM requests WHERE uuid = $1");
        sqlx::query_as::<_, Request>(&query)
            .bind(uuid)
            .fetch_optional(pool)
            .await
    }

    /// Requests created as follow-ups or retries of `parent_id`, oldest first.
    pub async fn list_children(
        pool: &PgPool,
        parent_id: DbId,
    ) -> Result<Vec<Request>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM requests WHERE parent_request_id = $1 ORDER BY id ASC"
        );
        sqlx::query_as::<_, Request>(&query)
            .bind(parent_id)
            .fetch_all(pool)
            .await
    }

    /// List requests with optional filters, newest first.
    pub async fn list(
        pool: &PgPool,
        params: &RequestListQuery,
    ) -> Result<Vec<Request>, sqlx::Error> {
        let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let offset = params.offset.unwrap_or(0).max(0);
        let query = format!(
            "SELECT {COLUMNS} FROM requests \
             WHERE ($1::BIGINT IS NULL OR target_id = $1) \
               AND ($2::SMALLINT IS NULL OR state_id = $2) \
             ORDER BY created_at DESC, id DESC \
             LIMIT $3 OFFSET $4"
        );
        sqlx::query_as::<_, Request>(&query)
            .bind(params.target_id)
            .bind(params.state_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
    }

    /// Append `chunk` to the request's output.
    pub async fn append_output(pool: &PgPool, id: DbId, chunk: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE requests SET output = output || $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(chunk)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Replace the request's output.
    pub async fn set_output(pool: &PgPool, id: DbId, output: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE requests SET output = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(output)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Move the request from `from` to `to`.
    ///
    /// Returns `false` if the request was not in `from` or the state machine
    /// forbids the move.
    pub async fn transition(
        pool: &PgPool,
        id: DbId,
        from: RequestState,
        to: RequestState,
    ) -> Result<bool, sqlx::Error> {
        if !from.can_transition_to(to) {
            return Ok(false);
        }
        let result = sqlx::query(
            "UPDATE requests SET state_id = $3, updated_at = NOW() \
             WHERE id = $1 AND state_id = $2",
        )
        .bind(id)
        .bind(from.id())
        .bind(to.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether no other request holds a lock conflicting with `request`.
    pub async fn is_processing_allowed(
        pool: &PgPool,
        request: &Request,
    ) -> Result<bool, sqlx::Error> {
        let mut conn = pool.acquire().await?;
        let conflict = Self::conflict_exists(&mut *conn, request).await?;
        Ok(!conflict)
    }

    /// Atomically move `request` from Pending to Scheduled if no conflicting
    /// lock is held.
    pub async fn try_lock(pool: &PgPool, request: &Request) -> Result<LockAttempt, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(request.target_id)
            .execute(&mut *tx)
            .await?;

        if Self::conflict_exists(&mut *tx, request).await? {
            tx.rollback().await?;
            return Ok(LockAttempt::Denied);
        }

        let result = sqlx::query(
            "UPDATE requests SET state_id = $3, triggered_at = NULL, updated_at = NOW() \
             WHERE id = $1 AND state_id = $2",
        )
        .bind(request.id)
        .bind(RequestState::Pending.id())
        .bind(RequestState::Scheduled.id())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(LockAttempt::NotPending);
        }

        tx.commit().await?;
        Ok(LockAttempt::Acquired)
    }

    /// Release whatever lock the request still holds.
    ///
    /// A request still in Scheduled or Running was not finalized and is
    /// forced to Failed. Returns `true` if that happened.
    pub async fn release(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests SET state_id = $2, updated_at = NOW() \
             WHERE id = $1 AND state_id IN ($3, $4)",
        )
        .bind(id)
        .bind(RequestState::Failed.id())
        .bind(RequestState::Scheduled.id())
        .bind(RequestState::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Flag a pending request for pickup by a worker.
    ///
    /// Returns `false` if the request is not Pending.
    pub async fn mark_triggered(pool: &PgPool, id: DbId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests SET triggered_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND state_id = $2",
        )
        .bind(id)
        .bind(RequestState::Pending.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim up to `limit` triggered pending requests, oldest trigger first.
    ///
    /// Uses `SELECT FOR UPDATE SKIP LOCKED` so concurrent workers never claim
    /// the same request. Claiming clears `triggered_at`.
    pub async fn claim_triggered(pool: &PgPool, limit: i64) -> Result<Vec<DbId>, sqlx::Error> {
        sqlx::query_scalar::<_, DbId>(
            "UPDATE requests SET triggered_at = NULL, updated_at = NOW() \
             WHERE id IN ( \
                 SELECT id FROM requests \
                 WHERE triggered_at IS NOT NULL AND state_id = $1 \
                 ORDER BY triggered_at ASC \
                 LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id",
        )
        .bind(RequestState::Pending.id())
        .bind(limit)
        .fetch_all(pool)
        .await
    }

    /// Fail every request left in Scheduled or Running.
    ///
    /// Called once at worker startup, before any request is dispatched, to
    /// release locks held by a worker that died mid-run.
    pub async fn fail_abandoned(pool: &PgPool) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE requests SET state_id = $1, updated_at = NOW() \
             WHERE state_id IN ($2, $3)",
        )
        .bind(RequestState::Failed.id())
        .bind(RequestState::Scheduled.id())
        .bind(RequestState::Running.id())
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn conflict_exists(
        conn: &mut PgConnection,
        request: &Request,
    ) -> Result<bool, sqlx::Error> {
        let [scheduled, running] = RequestState::LOCKING;
        sqlx::query_scalar::<_, bool>(CONFLICT_EXISTS)
            .bind(request.target_id)
            .bind(request.id)
            .bind(scheduled.id())
            .bind(running.id())
            .bind(request.scope())
            .fetch_one(conn)
            .await
    }
}
