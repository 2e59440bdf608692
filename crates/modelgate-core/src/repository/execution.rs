//! Workflow execution repository trait definition.

use modelgate_types::error::RepositoryError;
use modelgate_types::execution::{StepCheckpoint, WorkflowExecution};
use uuid::Uuid;

/// Repository trait for workflow executions and their checkpoints.
pub trait ExecutionRepository: Send + Sync {
    /// Insert a new execution. `Conflict` if one already exists for the job.
    fn create_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Execution header plus all checkpoints.
    fn get_execution(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowExecution>, RepositoryError>> + Send;

    /// Update the header fields (`current_step`, `status`, `retry_count`,
    /// `last_failure`, `updated_at`). Checkpoints are not touched.
    fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Upsert the checkpoint for `(job_id, checkpoint.step_index)`.
    ///
    /// Must return `Conflict` if a `completed` checkpoint already exists at
    /// that index: completed checkpoints are immutable.
    fn save_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint: &StepCheckpoint,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
