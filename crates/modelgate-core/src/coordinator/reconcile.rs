//! Reconciliation of the active set against job records.
//!
//! A process that dies mid-run leaves its job `running` and its models
//! reserved. Reconciliation releases entries whose job is gone or finished
//! and recovers jobs nobody has touched for `stale_after_secs`.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use modelgate_types::config::{ReconcileConfig, ReconcilePolicy};
use modelgate_types::failure::{FailureClass, RetryableSubtype, StepFailure};
use modelgate_types::job::{Job, JobStatus};
use serde::Serialize;
use uuid::Uuid;

use super::{ConflictCoordinator, CoordinatorError};
use crate::repository::{JobFilter, Store};

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Active entries dropped because their job was missing or terminal.
    pub released: Vec<Uuid>,
    /// Orphaned jobs parked as `pending_retry`.
    pub requeued: Vec<Uuid>,
    /// Orphaned jobs marked `failed`.
    pub failed: Vec<Uuid>,
    /// Queued jobs admitted into the freed capacity.
    pub promoted: Vec<Uuid>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
            && self.requeued.is_empty()
            && self.failed.is_empty()
            && self.promoted.is_empty()
    }
}

impl<S: Store> ConflictCoordinator<S> {
    /// Repair the active set as of `now`.
    ///
    /// `owned` lists jobs this process is currently running; they are never
    /// treated as orphaned regardless of age.
    pub async fn reconcile(
        &self,
        now: DateTime<Utc>,
        owned: &HashSet<Uuid>,
        config: &ReconcileConfig,
    ) -> Result<ReconcileReport, CoordinatorError> {
        let _guard = self.lock.lock().await;
        let stale_after = Duration::seconds(config.stale_after_secs as i64);
        let mut report = ReconcileReport::default();

        let state = self.store.load_active().await?;
        for entry in &state.jobs {
            match self.store.get_job(entry.job_id).await? {
                None => {
                    tracing::warn!(job_id = %entry.job_id, "releasing active entry for missing job");
                    self.release_locked(entry.job_id, entry.kind, serde_json::json!({ "reconciled": "missing" }))
                        .await?;
                    report.released.push(entry.job_id);
                }
                Some(job) if job.status.is_terminal() => {
                    tracing::warn!(job_id = %job.id, status = %job.status, "releasing active entry for finished job");
                    self.release_locked(job.id, job.kind, serde_json::json!({ "reconciled": "terminal" }))
                        .await?;
                    report.released.push(job.id);
                }
                Some(job) => {
                    if !self.is_orphan(&job, now, owned, stale_after).await? {
                        continue;
                    }
                    self.recover_orphan_locked(job.clone(), now, config.policy, &mut report)
                        .await?;
                    self.release_locked(job.id, job.kind, serde_json::json!({ "reconciled": "orphan" }))
                        .await?;
                }
            }
        }

        // Running jobs whose active entry was lost (or never written).
        let running = self
            .store
            .list_jobs(&JobFilter::with_status(JobStatus::Running))
            .await?;
        for job in running {
            if state.contains(job.id) || !self.is_orphan(&job, now, owned, stale_after).await? {
                continue;
            }
            self.recover_orphan_locked(job, now, config.policy, &mut report)
                .await?;
        }

        report.promoted = self
            .promote_locked()
            .await?
            .into_iter()
            .map(|j| j.id)
            .collect();

        if !report.is_empty() {
            tracing::info!(
                released = report.released.len(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                promoted = report.promoted.len(),
                "reconciliation repaired state"
            );
        }
        Ok(report)
    }

    async fn recover_orphan_locked(
        &self,
        mut job: Job,
        now: DateTime<Utc>,
        policy: ReconcilePolicy,
        report: &mut ReconcileReport,
    ) -> Result<(), CoordinatorError> {
        let mut execution = self.store.get_execution(job.id).await?;

        match policy {
            ReconcilePolicy::Requeue => {
                job.status = JobStatus::PendingRetry;
                if let Some(execution) = execution.as_mut() {
                    execution.status = JobStatus::PendingRetry;
                    execution.last_failure = Some(StepFailure {
                        class: FailureClass::Retryable {
                            subtype: RetryableSubtype::Unavailable,
                            earliest_retry_at: None,
                        },
                        message: "runner lost before the step finished".to_string(),
                        model: None,
                        provider: None,
                        occurred_at: now,
                    });
                }
                report.requeued.push(job.id);
                tracing::warn!(job_id = %job.id, "orphaned job requeued");
            }
            ReconcilePolicy::Fail => {
                let reason = format!(
                    "orphaned: no progress since {}",
                    job.updated_at.to_rfc3339()
                );
                job.status = JobStatus::Failed;
                job.error = Some(reason);
                if let Some(execution) = execution.as_mut() {
                    execution.status = JobStatus::Failed;
                }
                report.failed.push(job.id);
                tracing::warn!(job_id = %job.id, "orphaned job failed");
            }
        }

        job.updated_at = now;
        self.store.update_job(&job).await?;
        if let Some(mut execution) = execution {
            execution.updated_at = now;
            self.store.update_execution(&execution).await?;
        }
        Ok(())
    }

    /// A job is orphaned when no process owns it here and neither the job
    /// record nor its execution has moved for `stale_after`. Runners only
    /// touch the execution between steps, so both timestamps count.
    async fn is_orphan(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        owned: &HashSet<Uuid>,
        stale_after: Duration,
    ) -> Result<bool, CoordinatorError> {
        if owned.contains(&job.id) || now - job.updated_at < stale_after {
            return Ok(false);
        }
        let last_progress = match self.store.get_execution(job.id).await? {
            Some(execution) => execution.updated_at.max(job.updated_at),
            None => job.updated_at,
        };
        Ok(now - last_progress >= stale_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use modelgate_types::admission::{ActiveJob, AdmissionMode};
    use modelgate_types::execution::WorkflowExecution;
    use modelgate_types::job::JobKind;
    use serde_json::json;

    use crate::event::EventBus;
    use crate::repository::memory::InMemoryStore;
    use crate::repository::{ActiveStateStore, ExecutionRepository, JobRepository};
    use crate::workflow::checkpoint::CheckpointManager;

    fn setup() -> (Arc<InMemoryStore>, ConflictCoordinator<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let coordinator =
            ConflictCoordinator::new(store.clone(), AdmissionMode::Partitioned, EventBus::default());
        (store, coordinator)
    }

    fn config(policy: ReconcilePolicy) -> ReconcileConfig {
        ReconcileConfig {
            stale_after_secs: 60,
            policy,
        }
    }

    async fn admitted_job(
        store: &InMemoryStore,
        coordinator: &ConflictCoordinator<InMemoryStore>,
        model: &str,
    ) -> Job {
        let job = Job::new(JobKind::Workflow, "t2v", vec![model.to_string()], json!({}));
        coordinator.enqueue(&job).await.unwrap();
        assert!(coordinator
            .try_start(job.id, job.kind, &job.required_models)
            .await
            .unwrap()
            .is_admitted());
        store.get_job(job.id).await.unwrap().unwrap()
    }

    /// Backdate the job record and, if present, its execution.
    async fn age(store: &InMemoryStore, job_id: Uuid, secs: i64) {
        let at = Utc::now() - Duration::seconds(secs);
        let mut job = store.get_job(job_id).await.unwrap().unwrap();
        job.updated_at = at;
        store.update_job(&job).await.unwrap();
        if let Some(mut execution) = store.get_execution(job_id).await.unwrap() {
            execution.updated_at = at;
            store.update_execution(&execution).await.unwrap();
        }
    }

    #[tokio::test]
    async fn releases_entries_for_missing_and_terminal_jobs() {
        let (store, coordinator) = setup();
        let finished = admitted_job(&store, &coordinator, "gen-x").await;
        let mut record = finished.clone();
        record.status = JobStatus::Completed;
        store.update_job(&record).await.unwrap();

        // An active entry with no job record at all.
        let ghost = Uuid::now_v7();
        let mut state = store.load_active().await.unwrap();
        let version = state.version;
        state.insert(ActiveJob {
            job_id: ghost,
            kind: JobKind::Simple,
            models: vec!["upscaler".to_string()],
            started_at: Utc::now(),
        });
        assert!(store.compare_and_swap_active(version, &state).await.unwrap());

        let report = coordinator
            .reconcile(Utc::now(), &HashSet::new(), &config(ReconcilePolicy::Requeue))
            .await
            .unwrap();
        assert_eq!(report.released.len(), 2);
        assert!(report.released.contains(&ghost));
        assert!(store.load_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_running_job_is_requeued_and_releases_models() {
        let (store, coordinator) = setup();
        let orphan = admitted_job(&store, &coordinator, "gen-x").await;
        store
            .create_execution(&WorkflowExecution::new(orphan.id, 3, json!({})))
            .await
            .unwrap();
        age(&store, orphan.id, 600).await;

        let waiting = Job::new(JobKind::Workflow, "t2v", vec!["gen-x".to_string()], json!({}));
        coordinator.enqueue(&waiting).await.unwrap();
        coordinator
            .try_start(waiting.id, waiting.kind, &waiting.required_models)
            .await
            .unwrap();

        let report = coordinator
            .reconcile(Utc::now(), &HashSet::new(), &config(ReconcilePolicy::Requeue))
            .await
            .unwrap();

        assert_eq!(report.requeued, vec![orphan.id]);
        assert_eq!(report.promoted, vec![waiting.id]);

        let stored = store.get_job(orphan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::PendingRetry);
        let execution = store.get_execution(orphan.id).await.unwrap().unwrap();
        assert_eq!(execution.status, JobStatus::PendingRetry);
        assert_eq!(
            execution.last_failure.unwrap().subtype(),
            Some(RetryableSubtype::Unavailable)
        );
    }

    #[tokio::test]
    async fn job_with_recent_checkpoint_is_not_orphaned() {
        let (store, coordinator) = setup();
        let running = admitted_job(&store, &coordinator, "gen-x").await;
        age(&store, running.id, 600).await;

        // A runner in another process is still advancing the execution.
        let checkpoints = CheckpointManager::new(store.clone());
        let mut execution = checkpoints.begin(running.id, 3, json!({})).await.unwrap();
        checkpoints
            .record_success(&mut execution, "generate", Utc::now(), json!({"frames": 24}))
            .await
            .unwrap();

        let waiting = Job::new(JobKind::Workflow, "t2v", vec!["gen-x".to_string()], json!({}));
        coordinator.enqueue(&waiting).await.unwrap();
        coordinator
            .try_start(waiting.id, waiting.kind, &waiting.required_models)
            .await
            .unwrap();

        let report = coordinator
            .reconcile(Utc::now(), &HashSet::new(), &config(ReconcilePolicy::Requeue))
            .await
            .unwrap();

        assert!(report.is_empty());
        let stored = store.get_job(running.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        let active = store.load_active().await.unwrap();
        assert!(active.contains(running.id));
        assert!(!active.contains(waiting.id));
        let waiting = store.get_job(waiting.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Queued);
        assert_eq!(waiting.blocked_by, Some(running.id));
    }

    #[tokio::test]
    async fn fail_policy_marks_orphan_failed() {
        let (store, coordinator) = setup();
        let orphan = admitted_job(&store, &coordinator, "gen-x").await;
        age(&store, orphan.id, 600).await;

        let report = coordinator
            .reconcile(Utc::now(), &HashSet::new(), &config(ReconcilePolicy::Fail))
            .await
            .unwrap();
        assert_eq!(report.failed, vec![orphan.id]);
        let stored = store.get_job(orphan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.unwrap().starts_with("orphaned"));
        assert!(store.load_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn owned_and_fresh_jobs_are_left_alone() {
        let (store, coordinator) = setup();
        let owned_job = admitted_job(&store, &coordinator, "gen-x").await;
        let fresh_job = admitted_job(&store, &coordinator, "upscaler").await;
        age(&store, owned_job.id, 600).await;

        let owned: HashSet<Uuid> = [owned_job.id].into_iter().collect();
        let report = coordinator
            .reconcile(Utc::now(), &owned, &config(ReconcilePolicy::Requeue))
            .await
            .unwrap();

        assert!(report.is_empty());
        let active = store.load_active().await.unwrap();
        assert!(active.contains(owned_job.id));
        assert!(active.contains(fresh_job.id));
    }

    #[tokio::test]
    async fn running_job_without_active_entry_is_recovered() {
        let (store, coordinator) = setup();
        let mut job = Job::new(JobKind::Simple, "gen", vec!["gen-x".to_string()], json!({}));
        job.status = JobStatus::Running;
        job.updated_at = Utc::now() - Duration::seconds(600);
        store.create_job(&job).await.unwrap();

        let report = coordinator
            .reconcile(Utc::now(), &HashSet::new(), &config(ReconcilePolicy::Requeue))
            .await
            .unwrap();
        assert_eq!(report.requeued, vec![job.id]);
        assert!(report.released.is_empty());
    }
}
