//! Durable checkpoint manager for workflow executions.
//!
//! Wraps an `ExecutionRepository` with the operations the runner performs
//! after every step attempt. Each checkpoint is persisted before the
//! in-memory execution moves forward, so a crash never loses a completed
//! step and never records progress that was not made.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use modelgate_types::error::RepositoryError;
use modelgate_types::execution::{CheckpointStatus, StepCheckpoint, WorkflowExecution};
use modelgate_types::failure::StepFailure;
use modelgate_types::job::JobStatus;
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::ExecutionRepository;

/// Manages durable checkpoints for workflow executions.
///
/// Generic over `R: ExecutionRepository` so it works with any storage
/// backend (SQLite, in-memory, etc.).
pub struct CheckpointManager<R: ExecutionRepository> {
    repo: Arc<R>,
}

impl<R: ExecutionRepository> CheckpointManager<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }

    /// Create the execution record for a job starting at step 0.
    pub async fn begin(
        &self,
        job_id: Uuid,
        total_steps: u32,
        input: Value,
    ) -> Result<WorkflowExecution, CheckpointError> {
        let execution = WorkflowExecution::new(job_id, total_steps, input);
        self.repo.create_execution(&execution).await?;
        tracing::debug!(job_id = %job_id, total_steps, "execution created");
        Ok(execution)
    }

    pub async fn load(&self, job_id: Uuid) -> Result<Option<WorkflowExecution>, CheckpointError> {
        Ok(self.repo.get_execution(job_id).await?)
    }

    /// Load an execution that must exist.
    pub async fn restore(&self, job_id: Uuid) -> Result<WorkflowExecution, CheckpointError> {
        self.load(job_id)
            .await?
            .ok_or(CheckpointError::ExecutionNotFound(job_id))
    }

    /// Persist a `completed` checkpoint for `current_step` and advance.
    pub async fn record_success(
        &self,
        execution: &mut WorkflowExecution,
        step_name: &str,
        started_at: DateTime<Utc>,
        output: Value,
    ) -> Result<(), CheckpointError> {
        let step_index = execution.current_step;
        let checkpoint = StepCheckpoint {
            step_index,
            step_name: step_name.to_string(),
            status: CheckpointStatus::Completed,
            output: Some(output),
            error: None,
            started_at,
            completed_at: Utc::now(),
        };
        self.repo.save_checkpoint(execution.job_id, &checkpoint).await?;

        execution.checkpoints.insert(step_index, checkpoint);
        execution.current_step += 1;
        execution.updated_at = Utc::now();
        self.repo.update_execution(execution).await?;

        tracing::debug!(job_id = %execution.job_id, step = step_index, "checkpointed step complete");
        Ok(())
    }

    /// Persist a failed checkpoint for `current_step`.
    ///
    /// Retryable failures bump `retry_count` and park the execution as
    /// `pending_retry`; hard failures mark it `failed`. `current_step` stays
    /// on the failed step so a resume re-runs exactly that step.
    pub async fn record_failure(
        &self,
        execution: &mut WorkflowExecution,
        step_name: &str,
        started_at: DateTime<Utc>,
        failure: StepFailure,
    ) -> Result<CheckpointStatus, CheckpointError> {
        let step_index = execution.current_step;
        let retryable = failure.class.is_retryable();
        let status = if retryable {
            CheckpointStatus::FailedRetryable
        } else {
            CheckpointStatus::FailedHard
        };
        let checkpoint = StepCheckpoint {
            step_index,
            step_name: step_name.to_string(),
            status,
            output: None,
            error: Some(failure.clone()),
            started_at,
            completed_at: Utc::now(),
        };
        self.repo.save_checkpoint(execution.job_id, &checkpoint).await?;

        execution.checkpoints.insert(step_index, checkpoint);
        execution.last_failure = Some(failure);
        if retryable {
            execution.retry_count += 1;
            execution.status = JobStatus::PendingRetry;
        } else {
            execution.status = JobStatus::Failed;
        }
        execution.updated_at = Utc::now();
        self.repo.update_execution(execution).await?;

        tracing::debug!(
            job_id = %execution.job_id,
            step = step_index,
            status = %status,
            retry_count = execution.retry_count,
            "checkpointed step failure"
        );
        Ok(status)
    }

    /// Persist a status change on the execution header.
    pub async fn set_status(
        &self,
        execution: &mut WorkflowExecution,
        status: JobStatus,
    ) -> Result<(), CheckpointError> {
        execution.status = status;
        execution.updated_at = Utc::now();
        self.repo.update_execution(execution).await?;
        Ok(())
    }

    /// Park the execution after an interruption that was not the step's
    /// fault. No checkpoint is written and `retry_count` is untouched.
    pub async fn park_interrupted(
        &self,
        execution: &mut WorkflowExecution,
        failure: StepFailure,
    ) -> Result<(), CheckpointError> {
        execution.last_failure = Some(failure);
        self.set_status(execution, JobStatus::PendingRetry).await
    }
}

/// Errors from checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("workflow execution not found: {0}")]
    ExecutionNotFound(Uuid),
}
