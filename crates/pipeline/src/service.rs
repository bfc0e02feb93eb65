//! Entry points for the API layer.

use drover_core::error::CoreError;
use drover_core::request::{validate_payload, validate_scope, RequestPayload, RequestState};
use drover_core::types::DbId;
use drover_db::models::request::{CreateRequest, Request};

use crate::dispatcher::DispatcherHandle;
use crate::error::ServiceError;
use crate::store::SharedStore;

/// Creates, triggers and inspects requests.
///
/// With a [`DispatcherHandle`] attached, triggered requests are queued in
/// this process. Without one, triggering only flags the request and a worker
/// polling the database picks it up.
#[derive(Clone)]
pub struct RequestService {
    store: SharedStore,
    dispatcher: Option<DispatcherHandle>,
}

impl RequestService {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            dispatcher: None,
        }
    }

    pub fn with_dispatcher(mut self, handle: DispatcherHandle) -> Self {
        self.dispatcher = Some(handle);
        self
    }

    /// Validate and store a new Pending request.
    pub async fn create(&self, input: &CreateRequest) -> Result<Request, ServiceError> {
        validate_scope(input.kind, input.scope_name.as_deref())?;
        let payload = RequestPayload::parse(input.kind, &input.payload)?;
        validate_payload(&payload)?;

        if self.store.find_target(input.target_id).await?.is_none() {
            return Err(CoreError::NotFound {
                entity: "target",
                id: input.target_id,
            }
            .into());
        }
        if let Some(parent_id) = input.parent_request_id {
            self.find(parent_id).await?;
        }

        let request = self.store.create_request(input).await?;
        tracing::info!(
            request_id = request.id,
            kind = %input.kind,
            target_id = input.target_id,
            scope = input.scope_name.as_deref(),
            "Request created",
        );
        Ok(request)
    }

    /// Schedule a Pending request for execution.
    ///
    /// Returns `false` without side effects if the request is not Pending.
    pub async fn trigger(&self, request_id: DbId) -> Result<bool, ServiceError> {
        let request = self.find(request_id).await?;
        if request.state()? != RequestState::Pending {
            return Ok(false);
        }

        if let Some(dispatcher) = &self.dispatcher {
            if dispatcher.submit(request_id) {
                tracing::info!(request_id, "Request queued");
                return Ok(true);
            }
        }

        let marked = self.store.mark_triggered(request_id).await?;
        if marked {
            tracing::info!(request_id, "Request flagged for worker pickup");
        }
        Ok(marked)
    }

    pub async fn find(&self, request_id: DbId) -> Result<Request, ServiceError> {
        self.store
            .find_request(request_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound {
                    entity: "request",
                    id: request_id,
                }
                .into()
            })
    }

    /// Create a new Pending request repeating a failed one.
    ///
    /// The new request copies kind, scope and payload and points to the
    /// original through `parent_request_id`. Only failed requests can be
    /// retried.
    pub async fn retry(&self, request_id: DbId) -> Result<Request, ServiceError> {
        let original = self.find(request_id).await?;
        if original.state()? != RequestState::Failed {
            return Err(CoreError::Conflict(format!(
                "Request {request_id} is {} and cannot be retried",
                original.state()?
            ))
            .into());
        }

        let retry = self
            .store
            .create_request(&CreateRequest {
                target_id: original.target_id,
                kind: original.kind()?,
                scope_name: original.scope_name.clone(),
                payload: original.payload.clone(),
                parent_request_id: Some(original.id),
            })
            .await?;
        tracing::info!(
            original_request_id = original.id,
            new_request_id = retry.id,
            "Request retried",
        );
        Ok(retry)
    }

    pub async fn list_children(&self, request_id: DbId) -> Result<Vec<Request>, ServiceError> {
        self.find(request_id).await?;
        Ok(self.store.list_children(request_id).await?)
    }
}
