use drover_core::command::CommandError;
use drover_core::error::CoreError;
use drover_core::process::ProcessError;
use drover_core::types::DbId;

use crate::store::StoreError;

/// Everything that can go wrong while executing one request.
///
/// The executor turns each of these into a Failed request; none is retried.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Failed to process extracted information: {0}")]
    Extraction(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Target {0} not found")]
    TargetNotFound(DbId),

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

/// Errors returned to the API layer by [`RequestService`](crate::service::RequestService).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Invalid(#[from] CoreError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
