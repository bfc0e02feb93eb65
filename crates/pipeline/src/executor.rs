//! Execution of a single request.
//!
//! [`RequestExecutor::process`] drives one request through the full
//! lifecycle: lock, build the command, stream the playbook's output into the
//! request, reconcile the extracted facts and release the lock. Every
//! execution error ends as a Failed request; only persistence failures
//! escape as `Err`.

use drover_core::command::{CommandBuilder, CommandRequest};
use drover_core::config::ExecutionConfig;
use drover_core::locking::LockAttempt;
use drover_core::markers::PostProcessor;
use drover_core::process::{ProcessError, ProcessRunner};
use drover_core::request::RequestState;
use drover_core::types::DbId;
use drover_db::models::request::Request;

use crate::error::ExecutionError;
use crate::handlers;
use crate::locking::LockingService;
use crate::store::{SharedStore, StoreError};

/// How a call to [`RequestExecutor::process`] ended.
#[derive(Debug)]
pub enum Outcome {
    /// The request was not Pending; nothing was done.
    Skipped,
    /// A conflicting request holds the lock; output was set to the lock
    /// sentinel and the request stays Pending.
    LockDenied,
    /// The playbook succeeded and its results were persisted.
    Succeeded { follow_ups: Vec<Request> },
    /// The request ended in Failed.
    Failed,
}

/// Runs requests one at a time; share it behind an `Arc` to run many.
pub struct RequestExecutor {
    store: SharedStore,
    locking: LockingService,
    builder: CommandBuilder,
    runner: ProcessRunner,
}

impl RequestExecutor {
    pub fn new(store: SharedStore, config: &ExecutionConfig) -> Self {
        Self {
            locking: LockingService::new(store.clone()),
            builder: CommandBuilder::new(config.playbook.clone()),
            runner: ProcessRunner::new(config.timeout),
            store,
        }
    }

    /// Load and process the request with the given id.
    pub async fn process(&self, request_id: DbId) -> Result<Outcome, StoreError> {
        let request = self
            .store
            .find_request(request_id)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "request",
                id: request_id,
            })?;
        self.process_request(&request).await
    }

    /// Process an already loaded request.
    pub async fn process_request(&self, request: &Request) -> Result<Outcome, StoreError> {
        match request.state() {
            Ok(RequestState::Pending) => {}
            Ok(state) => {
                tracing::debug!(request_id = request.id, %state, "Request not pending, skipped");
                return Ok(Outcome::Skipped);
            }
            Err(e) => {
                tracing::warn!(request_id = request.id, error = %e, "Request skipped");
                return Ok(Outcome::Skipped);
            }
        }

        if !self.locking.is_processing_allowed(request).await? {
            self.locking.mark_denied(request).await?;
            return Ok(Outcome::LockDenied);
        }

        match self.locking.lock(request).await? {
            LockAttempt::Acquired => {}
            LockAttempt::Denied => {
                self.locking.mark_denied(request).await?;
                return Ok(Outcome::LockDenied);
            }
            LockAttempt::NotPending => return Ok(Outcome::Skipped),
        }

        let outcome = self.run_locked(request).await;
        let released = self.locking.unlock(request).await;
        let outcome = outcome?;
        released?;
        Ok(outcome)
    }

    async fn run_locked(&self, request: &Request) -> Result<Outcome, StoreError> {
        match self.execute(request).await {
            Ok(follow_ups) => {
                let finished = self
                    .store
                    .transition(request.id, RequestState::Running, RequestState::Succeeded)
                    .await?;
                if !finished {
                    tracing::warn!(request_id = request.id, "Request left Running before completion");
                    return Ok(Outcome::Failed);
                }
                tracing::info!(
                    request_id = request.id,
                    kind = %request.kind,
                    target_id = request.target_id,
                    follow_ups = follow_ups.len(),
                    "Request succeeded",
                );
                Ok(Outcome::Succeeded { follow_ups })
            }
            Err(ExecutionError::Store(e)) => Err(e),
            Err(err) => {
                self.record_failure(request, &err).await?;
                Ok(Outcome::Failed)
            }
        }
    }

    async fn execute(&self, request: &Request) -> Result<Vec<Request>, ExecutionError> {
        let kind = request.kind()?;
        let payload = request.parsed_payload()?;
        let target = self
            .store
            .find_target(request.target_id)
            .await?
            .ok_or(ExecutionError::TargetNotFound(request.target_id))?;

        let spec = self.builder.build(
            CommandRequest {
                kind,
                scope_name: request.scope(),
                payload: &payload,
            },
            &target.attributes(),
        )?;

        self.store
            .transition(request.id, RequestState::Scheduled, RequestState::Running)
            .await?;
        tracing::debug!(
            request_id = request.id,
            %kind,
            target_id = request.target_id,
            scope = request.scope(),
            command = %spec.display_line(),
            "Running playbook",
        );

        let mut processor = PostProcessor::for_kind(kind);
        let mut lines = self.runner.run(&spec)?;
        while let Some(line) = lines.next_line().await? {
            self.store
                .append_output(request.id, &format!("{line}\n"))
                .await?;
            processor.post_process_line(&line);
        }

        handlers::handle(self.store.as_ref(), request, kind, processor.into_extracted()).await
    }

    /// Mark the request Failed and append the error message when the output
    /// does not already explain it.
    async fn record_failure(
        &self,
        request: &Request,
        err: &ExecutionError,
    ) -> Result<(), StoreError> {
        match err {
            ExecutionError::Process(ProcessError::Failed { exit_code, .. }) => {
                tracing::warn!(
                    request_id = request.id,
                    kind = %request.kind,
                    exit_code,
                    "Playbook failed",
                );
            }
            other => {
                tracing::error!(request_id = request.id, kind = %request.kind, error = %other, "Request failed");
                self.store
                    .append_output(request.id, &format!("{other}\n"))
                    .await?;
            }
        }

        for from in [RequestState::Running, RequestState::Scheduled] {
            if self
                .store
                .transition(request.id, from, RequestState::Failed)
                .await?
            {
                break;
            }
        }
        Ok(())
    }
}
