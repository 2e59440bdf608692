//! Job repository trait definition.

use modelgate_types::error::RepositoryError;
use modelgate_types::job::{Job, JobStatus};
use uuid::Uuid;

/// Filter criteria for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by lifecycle status.
    pub status: Option<JobStatus>,
    /// Maximum number of results.
    pub limit: Option<i64>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }
}

/// Repository trait for job persistence.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait JobRepository: Send + Sync {
    /// Insert a new job.
    fn create_job(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_job(
        &self,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<Job>, RepositoryError>> + Send;

    /// Overwrite a job's mutable fields. `NotFound` if the job does not exist.
    fn update_job(
        &self,
        job: &Job,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// List jobs oldest first.
    fn list_jobs(
        &self,
        filter: &JobFilter,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;

    /// Queued jobs in FIFO order: `queued_at`, then `created_at`.
    fn list_queued_jobs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Job>, RepositoryError>> + Send;
}
