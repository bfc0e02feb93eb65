//! Request entity model and DTOs.

use drover_core::error::CoreError;
use drover_core::request::{RequestKind, RequestPayload, RequestState};
use drover_core::types::{DbId, PublicId, Timestamp};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A row from the `requests` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Request {
    pub id: DbId,
    pub uuid: PublicId,
    pub target_id: DbId,
    /// Virtual environment the request is limited to; `None` for
    /// whole-target kinds.
    pub scope_name: Option<String>,
    pub kind: String,
    pub state_id: i16,
    pub output: String,
    pub payload: serde_json::Value,
    pub parent_request_id: Option<DbId>,
    pub triggered_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Request {
    pub fn kind(&self) -> Result<RequestKind, CoreError> {
        self.kind.parse()
    }

    pub fn state(&self) -> Result<RequestState, CoreError> {
        RequestState::from_id(self.state_id).ok_or_else(|| {
            CoreError::Internal(format!(
                "Request {} has unknown state id {}",
                self.id, self.state_id
            ))
        })
    }

    /// Typed payload for this request's kind.
    pub fn parsed_payload(&self) -> Result<RequestPayload, CoreError> {
        RequestPayload::parse(self.kind()?, &self.payload)
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope_name.as_deref()
    }
}

/// DTO for creating a pending request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateRequest {
    pub target_id: DbId,
    pub kind: RequestKind,
    pub scope_name: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub parent_request_id: Option<DbId>,
}

/// Query parameters for listing requests.
#[derive(Debug, Default, Deserialize)]
pub struct RequestListQuery {
    pub target_id: Option<DbId>,
    pub state_id: Option<i16>,
    /// Maximum number of results. Defaults to 50, capped at 100.
    pub limit: Option<i64>,
    /// Number of results to skip. Defaults to 0.
    pub offset: Option<i64>,
}
