//! Queue event log trait definition.

use modelgate_types::error::RepositoryError;
use modelgate_types::event::QueueEvent;
use uuid::Uuid;

/// Append-only audit log of admission decisions.
///
/// Never read by control flow.
pub trait EventLog: Send + Sync {
    fn append_event(
        &self,
        event: &QueueEvent,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Events for one job, oldest first.
    fn events_for_job(
        &self,
        job_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<QueueEvent>, RepositoryError>> + Send;

    /// Most recent events across all jobs, newest first.
    fn recent_events(
        &self,
        limit: i64,
    ) -> impl std::future::Future<Output = Result<Vec<QueueEvent>, RepositoryError>> + Send;
}
