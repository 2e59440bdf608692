//! Admission gate over the shared [`ActiveState`].
//!
//! The coordinator is the only writer of the active set and of the queue
//! event log. Callers of one coordinator are serialized by an async mutex;
//! coordinators in different processes are kept honest by compare-and-swap
//! on the active-state version. No lock is ever held while a step runs.

pub mod reconcile;

use std::sync::Arc;

use chrono::Utc;
use modelgate_types::admission::{ActiveJob, ActiveState, Admission, AdmissionMode};
use modelgate_types::error::RepositoryError;
use modelgate_types::event::{JobEvent, QueueEvent, QueueEventType};
use modelgate_types::job::{Job, JobKind, JobStatus};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::event::EventBus;
use crate::repository::Store;

pub use reconcile::ReconcileReport;

/// Compare-and-swap attempts before giving up on a contended active state.
const MAX_CAS_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("store error: {0}")]
    Store(#[from] RepositoryError),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("active state contended: gave up after {0} compare-and-swap attempts")]
    Contention(usize),
}

/// What `cancel` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had not started and is now `cancelled`.
    Cancelled,
    /// The job is running; its runner must be signalled.
    Running,
    /// Nothing to do: the job already reached this terminal status.
    AlreadyFinished(JobStatus),
}

pub struct ConflictCoordinator<S: Store> {
    store: Arc<S>,
    mode: AdmissionMode,
    lock: Mutex<()>,
    bus: EventBus,
}

impl<S: Store> ConflictCoordinator<S> {
    pub fn new(store: Arc<S>, mode: AdmissionMode, bus: EventBus) -> Self {
        Self {
            store,
            mode,
            lock: Mutex::new(()),
            bus,
        }
    }

    pub fn mode(&self) -> AdmissionMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist a freshly submitted job and log `queued`.
    pub async fn enqueue(&self, job: &Job) -> Result<(), CoordinatorError> {
        self.store.create_job(job).await?;
        self.log(QueueEvent::new(
            job.id,
            job.kind,
            QueueEventType::Queued,
            job.required_models.clone(),
        ))
        .await?;
        tracing::info!(job_id = %job.id, pipeline = %job.pipeline, "job accepted");
        Ok(())
    }

    /// Decide whether `job_id` may start now.
    ///
    /// On admission the job becomes `running` and its models are reserved.
    /// On conflict it becomes `queued` with `blocked_by` and
    /// `conflict_reason` set. Already-active and terminal jobs are rejected
    /// without touching the job record.
    pub async fn try_start(
        &self,
        job_id: Uuid,
        kind: JobKind,
        required_models: &[String],
    ) -> Result<Admission, CoordinatorError> {
        let _guard = self.lock.lock().await;
        let (admission, _) = self.try_start_locked(job_id, kind, required_models).await?;
        Ok(admission)
    }

    /// Release `job_id`'s models and admit every queued job that now fits.
    ///
    /// Returns the admitted jobs; the caller is responsible for running them.
    pub async fn on_finish(&self, job_id: Uuid, kind: JobKind) -> Result<Vec<Job>, CoordinatorError> {
        let _guard = self.lock.lock().await;
        self.release_locked(job_id, kind, serde_json::Value::Null).await?;
        self.promote_locked().await
    }

    /// Release `job_id`'s models without promoting anything.
    ///
    /// Used while shutting down, when nothing may be launched.
    pub async fn release(&self, job_id: Uuid, kind: JobKind) -> Result<(), CoordinatorError> {
        let _guard = self.lock.lock().await;
        self.release_locked(job_id, kind, serde_json::json!({ "promote": false }))
            .await?;
        Ok(())
    }

    /// Admit whatever queued jobs fit the current active set.
    pub async fn promote_queued(&self) -> Result<Vec<Job>, CoordinatorError> {
        let _guard = self.lock.lock().await;
        self.promote_locked().await
    }

    /// Cancel a job that has not started. Running jobs are reported back so
    /// the caller can signal their runner.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, CoordinatorError> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(CoordinatorError::JobNotFound(job_id))?;

        match job.status {
            JobStatus::Pending | JobStatus::Queued | JobStatus::PendingRetry => {
                self.mark_cancelled_locked(&mut job).await?;
                Ok(CancelOutcome::Cancelled)
            }
            JobStatus::Running => Ok(CancelOutcome::Running),
            status => Ok(CancelOutcome::AlreadyFinished(status)),
        }
    }

    /// Runner acknowledgement of a cancellation: mark the job `cancelled`,
    /// release its models and promote queued jobs.
    pub async fn on_cancelled(&self, job_id: Uuid) -> Result<Vec<Job>, CoordinatorError> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(CoordinatorError::JobNotFound(job_id))?;
        self.mark_cancelled_locked(&mut job).await?;
        self.release_locked(job_id, job.kind, serde_json::json!({ "cancelled": true }))
            .await?;
        self.promote_locked().await
    }

    /// Force a job to `failed` (retry ceiling reached) and log `skipped`.
    pub async fn force_fail(&self, job_id: Uuid, reason: &str) -> Result<(), CoordinatorError> {
        let _guard = self.lock.lock().await;
        let mut job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or(CoordinatorError::JobNotFound(job_id))?;
        if job.status.is_terminal() {
            return Ok(());
        }

        job.status = JobStatus::Failed;
        job.error = Some(reason.to_string());
        clear_queue_info(&mut job);
        job.updated_at = Utc::now();
        self.store.update_job(&job).await?;

        if let Some(mut execution) = self.store.get_execution(job_id).await? {
            execution.status = JobStatus::Failed;
            execution.updated_at = job.updated_at;
            self.store.update_execution(&execution).await?;
        }

        self.log(
            QueueEvent::new(job_id, job.kind, QueueEventType::Skipped, job.required_models.clone())
                .with_conflict(None, reason),
        )
        .await?;
        self.bus.publish(JobEvent::Failed {
            job_id,
            error: reason.to_string(),
        });
        tracing::warn!(job_id = %job_id, reason, "job forced to failed");
        Ok(())
    }

    /// Append an audit entry on behalf of another component.
    pub async fn record(&self, event: QueueEvent) -> Result<(), CoordinatorError> {
        self.log(event).await
    }

    // -----------------------------------------------------------------------
    // Critical-section helpers. Callers must hold `self.lock`.
    // -----------------------------------------------------------------------

    async fn try_start_locked(
        &self,
        job_id: Uuid,
        kind: JobKind,
        required_models: &[String],
    ) -> Result<(Admission, Job), CoordinatorError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut job = self
                .store
                .get_job(job_id)
                .await?
                .ok_or(CoordinatorError::JobNotFound(job_id))?;
            let state = self.store.load_active().await?;

            if state.contains(job_id) || job.status.is_terminal() {
                let reason = if state.contains(job_id) {
                    format!("job {job_id} is already active")
                } else {
                    format!("job {job_id} is already {}", job.status)
                };
                self.log(
                    QueueEvent::new(job_id, kind, QueueEventType::Skipped, required_models.to_vec())
                        .with_conflict(None, reason.clone()),
                )
                .await?;
                tracing::warn!(job_id = %job_id, %reason, "admission skipped");
                return Ok((
                    Admission::Rejected {
                        blocked_by: None,
                        reason,
                    },
                    job,
                ));
            }

            if let Some((blocked_by, reason)) = self.find_conflict(&state, required_models) {
                // Another process may have admitted the job since it was read.
                job = self
                    .store
                    .get_job(job_id)
                    .await?
                    .ok_or(CoordinatorError::JobNotFound(job_id))?;
                if job.status == JobStatus::Running || job.status.is_terminal() {
                    tracing::debug!(job_id = %job_id, status = %job.status, "job moved on, not queueing");
                    return Ok((
                        Admission::Rejected {
                            blocked_by: Some(blocked_by),
                            reason,
                        },
                        job,
                    ));
                }

                job.status = JobStatus::Queued;
                job.blocked_by = Some(blocked_by);
                job.conflict_reason = Some(reason.clone());
                job.queued_at = job.queued_at.or_else(|| Some(Utc::now()));
                job.updated_at = Utc::now();
                self.store.update_job(&job).await?;

                self.log(
                    QueueEvent::new(job_id, kind, QueueEventType::Blocked, required_models.to_vec())
                        .with_conflict(Some(blocked_by), reason.clone()),
                )
                .await?;
                self.bus.publish(JobEvent::Blocked {
                    job_id,
                    blocked_by: Some(blocked_by),
                    reason: reason.clone(),
                });
                tracing::info!(job_id = %job_id, blocked_by = %blocked_by, %reason, "job queued");
                return Ok((
                    Admission::Rejected {
                        blocked_by: Some(blocked_by),
                        reason,
                    },
                    job,
                ));
            }

            let mut next = state.clone();
            next.insert(ActiveJob {
                job_id,
                kind,
                models: required_models.to_vec(),
                started_at: Utc::now(),
            });
            if !self
                .store
                .compare_and_swap_active(state.version, &next)
                .await?
            {
                tracing::debug!(job_id = %job_id, version = state.version, "active state moved, retrying");
                continue;
            }

            job.status = JobStatus::Running;
            clear_queue_info(&mut job);
            job.updated_at = Utc::now();
            self.store.update_job(&job).await?;

            self.log(QueueEvent::new(
                job_id,
                kind,
                QueueEventType::Started,
                required_models.to_vec(),
            ))
            .await?;
            self.bus.publish(JobEvent::Admitted {
                job_id,
                models: required_models.to_vec(),
            });
            tracing::info!(job_id = %job_id, models = ?required_models, "job admitted");
            return Ok((Admission::Admitted, job));
        }

        tracing::error!(job_id = %job_id, "admission gave up on contended active state");
        Err(CoordinatorError::Contention(MAX_CAS_ATTEMPTS))
    }

    /// The active job standing in the way, with a human-readable reason.
    fn find_conflict(&self, state: &ActiveState, required: &[String]) -> Option<(Uuid, String)> {
        if let Some((model, holder)) = state.first_conflict(required) {
            return Some((holder.job_id, format!("{model} in use by {}", holder.job_id)));
        }
        if self.mode == AdmissionMode::SingleFlight {
            if let Some(holder) = state.jobs.first() {
                return Some((
                    holder.job_id,
                    format!(
                        "job queue busy: {} job {} is currently running",
                        holder.kind, holder.job_id
                    ),
                ));
            }
        }
        None
    }

    /// Remove `job_id` from the active set (if present) and log `completed`.
    async fn release_locked(
        &self,
        job_id: Uuid,
        kind: JobKind,
        metadata: serde_json::Value,
    ) -> Result<Option<ActiveJob>, CoordinatorError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let state = self.store.load_active().await?;
            let mut next = state.clone();
            let Some(removed) = next.remove(job_id) else {
                tracing::debug!(job_id = %job_id, "release of inactive job");
                self.log(
                    QueueEvent::new(job_id, kind, QueueEventType::Completed, Vec::new())
                        .with_metadata(metadata),
                )
                .await?;
                return Ok(None);
            };

            if !self
                .store
                .compare_and_swap_active(state.version, &next)
                .await?
            {
                continue;
            }

            self.log(
                QueueEvent::new(job_id, kind, QueueEventType::Completed, removed.models.clone())
                    .with_metadata(metadata),
            )
            .await?;
            tracing::info!(job_id = %job_id, models = ?removed.models, "job released");
            return Ok(Some(removed));
        }
        Err(CoordinatorError::Contention(MAX_CAS_ATTEMPTS))
    }

    /// Scan queued jobs FIFO and admit every one that fits.
    async fn promote_locked(&self) -> Result<Vec<Job>, CoordinatorError> {
        let mut promoted = Vec::new();
        for queued in self.store.list_queued_jobs().await? {
            let state = self.store.load_active().await?;
            if self.mode == AdmissionMode::SingleFlight && !state.is_empty() {
                break;
            }
            if state.first_conflict(&queued.required_models).is_some() {
                continue;
            }

            let (admission, job) = self
                .try_start_locked(queued.id, queued.kind, &queued.required_models)
                .await?;
            if admission.is_admitted() {
                promoted.push(job);
            }
        }
        if !promoted.is_empty() {
            tracing::info!(count = promoted.len(), "promoted queued jobs");
        }
        Ok(promoted)
    }

    async fn mark_cancelled_locked(&self, job: &mut Job) -> Result<(), CoordinatorError> {
        job.status = JobStatus::Cancelled;
        clear_queue_info(job);
        job.updated_at = Utc::now();
        self.store.update_job(job).await?;

        if let Some(mut execution) = self.store.get_execution(job.id).await? {
            execution.status = JobStatus::Cancelled;
            execution.updated_at = job.updated_at;
            self.store.update_execution(&execution).await?;
        }

        self.log(QueueEvent::new(
            job.id,
            job.kind,
            QueueEventType::Cancelled,
            job.required_models.clone(),
        ))
        .await?;
        self.bus.publish(JobEvent::Cancelled { job_id: job.id });
        tracing::info!(job_id = %job.id, "job cancelled");
        Ok(())
    }

    async fn log(&self, event: QueueEvent) -> Result<(), CoordinatorError> {
        self.store.append_event(&event).await.map_err(|e| {
            tracing::error!(job_id = %event.job_id, error = %e, "failed to append queue event");
            CoordinatorError::Store(e)
        })
    }
}

fn clear_queue_info(job: &mut Job) {
    job.blocked_by = None;
    job.conflict_reason = None;
    job.queued_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryStore;
    use crate::repository::{ActiveStateStore, EventLog, JobRepository};
    use chrono::Duration;
    use serde_json::json;

    fn coordinator(mode: AdmissionMode) -> (Arc<InMemoryStore>, ConflictCoordinator<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let coordinator = ConflictCoordinator::new(store.clone(), mode, EventBus::default());
        (store, coordinator)
    }

    async fn submit(coordinator: &ConflictCoordinator<InMemoryStore>, models: &[&str]) -> Job {
        let job = Job::new(
            JobKind::Workflow,
            "t2v",
            models.iter().map(|m| m.to_string()).collect(),
            json!({}),
        );
        coordinator.enqueue(&job).await.unwrap();
        job
    }

    async fn start(coordinator: &ConflictCoordinator<InMemoryStore>, job: &Job) -> Admission {
        coordinator
            .try_start(job.id, job.kind, &job.required_models)
            .await
            .unwrap()
    }

    async fn event_types(store: &InMemoryStore, job_id: Uuid) -> Vec<QueueEventType> {
        store
            .events_for_job(job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }

    #[tokio::test]
    async fn empty_active_set_admits() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let job = submit(&coordinator, &["gen-x"]).await;

        assert!(start(&coordinator, &job).await.is_admitted());

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        let active = store.load_active().await.unwrap();
        assert!(active.contains(job.id));
        assert_eq!(
            event_types(&store, job.id).await,
            vec![QueueEventType::Queued, QueueEventType::Started]
        );
    }

    #[tokio::test]
    async fn shared_model_blocks_second_job() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["gen-x", "upscaler"]).await;

        assert!(start(&coordinator, &a).await.is_admitted());
        let decision = start(&coordinator, &b).await;

        assert_eq!(decision.blocked_by(), Some(a.id));
        assert_eq!(decision.reason(), Some(format!("gen-x in use by {}", a.id).as_str()));

        let stored = store.get_job(b.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.blocked_by, Some(a.id));
        assert!(stored.queued_at.is_some());
        assert_eq!(
            event_types(&store, b.id).await,
            vec![QueueEventType::Queued, QueueEventType::Blocked]
        );
    }

    #[tokio::test]
    async fn conflict_does_not_requeue_job_admitted_elsewhere() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let holder = submit(&coordinator, &["gen-x"]).await;
        assert!(start(&coordinator, &holder).await.is_admitted());

        // Another coordinator already marked this job running.
        let mut job = submit(&coordinator, &["gen-x"]).await;
        job.status = JobStatus::Running;
        store.update_job(&job).await.unwrap();

        let decision = start(&coordinator, &job).await;
        assert!(!decision.is_admitted());

        let stored = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert!(stored.blocked_by.is_none());
        assert!(stored.queued_at.is_none());
        assert_eq!(event_types(&store, job.id).await, vec![QueueEventType::Queued]);
    }

    #[tokio::test]
    async fn disjoint_models_run_in_parallel_when_partitioned() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["upscaler"]).await;

        assert!(start(&coordinator, &a).await.is_admitted());
        assert!(start(&coordinator, &b).await.is_admitted());
        assert_eq!(store.load_active().await.unwrap().jobs.len(), 2);
    }

    #[tokio::test]
    async fn single_flight_rejects_disjoint_job() {
        let (_store, coordinator) = coordinator(AdmissionMode::SingleFlight);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["upscaler"]).await;

        assert!(start(&coordinator, &a).await.is_admitted());
        let decision = start(&coordinator, &b).await;
        assert_eq!(decision.blocked_by(), Some(a.id));
        assert_eq!(
            decision.reason(),
            Some(format!("job queue busy: workflow job {} is currently running", a.id).as_str())
        );
    }

    #[tokio::test]
    async fn active_job_is_skipped_without_touching_record() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        assert!(start(&coordinator, &a).await.is_admitted());
        let before = store.get_job(a.id).await.unwrap().unwrap();

        let decision = start(&coordinator, &a).await;
        assert!(!decision.is_admitted());
        assert!(decision.blocked_by().is_none());

        let after = store.get_job(a.id).await.unwrap().unwrap();
        assert_eq!(after.updated_at, before.updated_at);
        assert_eq!(after.status, JobStatus::Running);
        assert_eq!(
            event_types(&store, a.id).await.last(),
            Some(&QueueEventType::Skipped)
        );
    }

    #[tokio::test]
    async fn terminal_job_is_rejected() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        coordinator.cancel(a.id).await.unwrap();

        let decision = start(&coordinator, &a).await;
        assert!(!decision.is_admitted());
        assert!(store.load_active().await.unwrap().is_empty());
        assert_eq!(
            store.get_job(a.id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn requeue_keeps_original_queued_at() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["gen-x"]).await;
        start(&coordinator, &a).await;
        start(&coordinator, &b).await;
        let first = store.get_job(b.id).await.unwrap().unwrap().queued_at;

        start(&coordinator, &b).await;
        let second = store.get_job(b.id).await.unwrap().unwrap().queued_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn on_finish_promotes_fifo_and_disjoint() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x", "upscaler"]).await;
        let b = submit(&coordinator, &["gen-x"]).await;
        let c = submit(&coordinator, &["gen-x"]).await;
        let d = submit(&coordinator, &["upscaler"]).await;
        start(&coordinator, &a).await;
        for job in [&b, &c, &d] {
            assert!(!start(&coordinator, job).await.is_admitted());
        }

        let promoted = coordinator.on_finish(a.id, a.kind).await.unwrap();
        let ids: Vec<Uuid> = promoted.iter().map(|j| j.id).collect();
        // b is first in line for gen-x; c still conflicts with b; d is disjoint.
        assert_eq!(ids, vec![b.id, d.id]);

        let c_stored = store.get_job(c.id).await.unwrap().unwrap();
        assert_eq!(c_stored.status, JobStatus::Queued);
        let promoted_b = store.get_job(b.id).await.unwrap().unwrap();
        assert!(promoted_b.blocked_by.is_none());
        assert!(promoted_b.queued_at.is_none());
    }

    #[tokio::test]
    async fn fifo_order_follows_queued_at() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["gen-x"]).await;
        let c = submit(&coordinator, &["gen-x"]).await;
        start(&coordinator, &a).await;
        start(&coordinator, &c).await;
        start(&coordinator, &b).await;

        // c queued first, so it is promoted ahead of b despite being created later.
        let promoted = coordinator.on_finish(a.id, a.kind).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, c.id);
        assert_eq!(
            store.get_job(b.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn single_flight_promotes_only_one() {
        let (_store, coordinator) = coordinator(AdmissionMode::SingleFlight);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["upscaler"]).await;
        let c = submit(&coordinator, &["motion"]).await;
        start(&coordinator, &a).await;
        start(&coordinator, &b).await;
        start(&coordinator, &c).await;

        let promoted = coordinator.on_finish(a.id, a.kind).await.unwrap();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].id, b.id);
    }

    #[tokio::test]
    async fn release_does_not_promote() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["gen-x"]).await;
        start(&coordinator, &a).await;
        start(&coordinator, &b).await;

        coordinator.release(a.id, a.kind).await.unwrap();
        assert!(store.load_active().await.unwrap().is_empty());
        assert_eq!(
            store.get_job(b.id).await.unwrap().unwrap().status,
            JobStatus::Queued
        );

        let promoted = coordinator.promote_queued().await.unwrap();
        assert_eq!(promoted[0].id, b.id);
    }

    #[tokio::test]
    async fn cancel_pending_and_running() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["gen-x"]).await;
        start(&coordinator, &a).await;
        start(&coordinator, &b).await;

        assert_eq!(coordinator.cancel(b.id).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(coordinator.cancel(a.id).await.unwrap(), CancelOutcome::Running);
        assert_eq!(
            coordinator.cancel(b.id).await.unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
        );

        let cancelled = store.get_job(b.id).await.unwrap().unwrap();
        assert!(cancelled.blocked_by.is_none());
        assert_eq!(
            event_types(&store, b.id).await.last(),
            Some(&QueueEventType::Cancelled)
        );

        // Runner acknowledges: a is released and nothing is left to promote.
        let promoted = coordinator.on_cancelled(a.id).await.unwrap();
        assert!(promoted.is_empty());
        assert!(store.load_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_job_is_an_error() {
        let (_store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let err = coordinator
            .try_start(Uuid::now_v7(), JobKind::Simple, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn store_outage_fails_closed() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        store.set_unavailable(true);

        let err = start_err(&coordinator, &a).await;
        assert!(matches!(err, CoordinatorError::Store(RepositoryError::Connection)));

        store.set_unavailable(false);
        assert!(store.load_active().await.unwrap().is_empty());
    }

    async fn start_err(coordinator: &ConflictCoordinator<InMemoryStore>, job: &Job) -> CoordinatorError {
        coordinator
            .try_start(job.id, job.kind, &job.required_models)
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn force_fail_marks_failed_and_logs_skipped() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;

        coordinator.force_fail(a.id, "retry limit reached").await.unwrap();
        let stored = store.get_job(a.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("retry limit reached"));
        assert_eq!(
            event_types(&store, a.id).await.last(),
            Some(&QueueEventType::Skipped)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_coordinators_never_double_admit() {
        let store = Arc::new(InMemoryStore::new());
        let mut jobs = Vec::new();
        let seed = ConflictCoordinator::new(store.clone(), AdmissionMode::Partitioned, EventBus::default());
        for _ in 0..8 {
            let job = Job::new(JobKind::Simple, "gen", vec!["gen-x".to_string()], json!({}));
            seed.enqueue(&job).await.unwrap();
            jobs.push(job);
        }

        let mut handles = Vec::new();
        for job in jobs {
            // Each task has its own coordinator (own mutex), sharing only the store.
            let coordinator =
                ConflictCoordinator::new(store.clone(), AdmissionMode::Partitioned, EventBus::default());
            handles.push(tokio::spawn(async move {
                coordinator
                    .try_start(job.id, job.kind, &job.required_models)
                    .await
                    .unwrap()
                    .is_admitted()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(store.load_active().await.unwrap().jobs.len(), 1);
    }

    #[tokio::test]
    async fn blocked_job_queued_at_is_recent() {
        let (store, coordinator) = coordinator(AdmissionMode::Partitioned);
        let a = submit(&coordinator, &["gen-x"]).await;
        let b = submit(&coordinator, &["gen-x"]).await;
        start(&coordinator, &a).await;
        start(&coordinator, &b).await;
        let queued_at = store.get_job(b.id).await.unwrap().unwrap().queued_at.unwrap();
        assert!(Utc::now() - queued_at < Duration::seconds(5));
    }
}
