//! In-memory implementations of the storage ports.
//!
//! Serves tests and single-process embedding. `set_unavailable(true)` makes
//! every call fail with `RepositoryError::Connection`, which is how the
//! fail-closed paths are exercised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use modelgate_types::admission::ActiveState;
use modelgate_types::error::RepositoryError;
use modelgate_types::event::QueueEvent;
use modelgate_types::execution::{CheckpointStatus, StepCheckpoint, WorkflowExecution};
use modelgate_types::job::{Job, JobStatus};
use uuid::Uuid;

use super::{ActiveStateStore, EventLog, ExecutionRepository, JobFilter, JobRepository};
use crate::provider::{CredentialProvider, QuotaProvider};

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, Job>,
    active: ActiveState,
    events: Vec<QueueEvent>,
    executions: HashMap<Uuid, WorkflowExecution>,
}

/// Process-local store implementing every repository port.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, RepositoryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        self.tables
            .lock()
            .map_err(|e| RepositoryError::Query(format!("store lock poisoned: {e}")))
    }
}

impl JobRepository for InMemoryStore {
    async fn create_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(RepositoryError::Conflict(format!("job {} already exists", job.id)));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, RepositoryError> {
        Ok(self.tables()?.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        match tables.jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, RepositoryError> {
        let tables = self.tables()?;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }

    async fn list_queued_jobs(&self) -> Result<Vec<Job>, RepositoryError> {
        let tables = self.tables()?;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            a.queued_at
                .cmp(&b.queued_at)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }
}

impl ActiveStateStore for InMemoryStore {
    async fn load_active(&self) -> Result<ActiveState, RepositoryError> {
        Ok(self.tables()?.active.clone())
    }

    async fn compare_and_swap_active(
        &self,
        expected_version: u64,
        next: &ActiveState,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables()?;
        if tables.active.version != expected_version {
            return Ok(false);
        }
        tables.active = ActiveState {
            jobs: next.jobs.clone(),
            version: expected_version + 1,
        };
        Ok(true)
    }
}

impl EventLog for InMemoryStore {
    async fn append_event(&self, event: &QueueEvent) -> Result<(), RepositoryError> {
        self.tables()?.events.push(event.clone());
        Ok(())
    }

    async fn events_for_job(&self, job_id: Uuid) -> Result<Vec<QueueEvent>, RepositoryError> {
        Ok(self
            .tables()?
            .events
            .iter()
            .filter(|e| e.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn recent_events(&self, limit: i64) -> Result<Vec<QueueEvent>, RepositoryError> {
        Ok(self
            .tables()?
            .events
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

impl ExecutionRepository for InMemoryStore {
    async fn create_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        if tables.executions.contains_key(&execution.job_id) {
            return Err(RepositoryError::Conflict(format!(
                "execution for job {} already exists",
                execution.job_id
            )));
        }
        tables.executions.insert(execution.job_id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, job_id: Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.tables()?.executions.get(&job_id).cloned())
    }

    async fn update_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        let existing = tables
            .executions
            .get_mut(&execution.job_id)
            .ok_or(RepositoryError::NotFound)?;
        existing.total_steps = execution.total_steps;
        existing.current_step = execution.current_step;
        existing.status = execution.status;
        existing.retry_count = execution.retry_count;
        existing.last_failure = execution.last_failure.clone();
        existing.updated_at = execution.updated_at;
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        job_id: Uuid,
        checkpoint: &StepCheckpoint,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables()?;
        let execution = tables
            .executions
            .get_mut(&job_id)
            .ok_or(RepositoryError::NotFound)?;
        let checkpoints: &mut BTreeMap<u32, StepCheckpoint> = &mut execution.checkpoints;
        if checkpoints
            .get(&checkpoint.step_index)
            .is_some_and(|c| c.status == CheckpointStatus::Completed)
        {
            return Err(RepositoryError::Conflict(format!(
                "checkpoint {} of job {job_id} is already completed",
                checkpoint.step_index
            )));
        }
        checkpoints.insert(checkpoint.step_index, checkpoint.clone());
        Ok(())
    }
}

/// In-memory quota table keyed by `provider:model`.
#[derive(Default)]
pub struct InMemoryQuota {
    // key -> (used, limit)
    quotas: Mutex<HashMap<String, (u64, u64)>>,
}

impl InMemoryQuota {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(provider: &str, model: &str) -> String {
        format!("{provider}:{model}")
    }

    pub fn set_limit(&self, provider: &str, model: &str, limit: u64) {
        if let Ok(mut quotas) = self.quotas.lock() {
            let entry = quotas.entry(Self::key(provider, model)).or_insert((0, limit));
            entry.1 = limit;
        }
    }

    pub fn reset(&self, provider: &str, model: &str) {
        if let Ok(mut quotas) = self.quotas.lock() {
            if let Some(entry) = quotas.get_mut(&Self::key(provider, model)) {
                entry.0 = 0;
            }
        }
    }

    pub fn used(&self, provider: &str, model: &str) -> u64 {
        self.quotas
            .lock()
            .ok()
            .and_then(|q| q.get(&Self::key(provider, model)).map(|e| e.0))
            .unwrap_or(0)
    }
}

impl QuotaProvider for InMemoryQuota {
    async fn has_capacity(&self, provider: &str, model: &str) -> Result<bool, RepositoryError> {
        let quotas = self
            .quotas
            .lock()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(quotas
            .get(&Self::key(provider, model))
            .is_none_or(|(used, limit)| used < limit))
    }

    async fn record_usage(&self, provider: &str, model: &str) -> Result<(), RepositoryError> {
        let mut quotas = self
            .quotas
            .lock()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        if let Some(entry) = quotas.get_mut(&Self::key(provider, model)) {
            entry.0 += 1;
        }
        Ok(())
    }
}

/// Fixed set of providers with a valid credential.
#[derive(Default)]
pub struct InMemoryCredentials {
    valid: Mutex<HashSet<String>>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_valid(&self, provider: &str, valid: bool) {
        if let Ok(mut set) = self.valid.lock() {
            if valid {
                set.insert(provider.to_string());
            } else {
                set.remove(provider);
            }
        }
    }
}

impl CredentialProvider for InMemoryCredentials {
    async fn has_valid_credential(&self, provider: &str) -> Result<bool, RepositoryError> {
        let set = self
            .valid
            .lock()
            .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(set.contains(provider))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use modelgate_types::admission::ActiveJob;
    use modelgate_types::job::JobKind;
    use serde_json::json;

    fn job(models: &[&str]) -> Job {
        Job::new(
            JobKind::Workflow,
            "t2v",
            models.iter().map(|m| m.to_string()).collect(),
            json!({}),
        )
    }

    fn checkpoint(step_index: u32, status: CheckpointStatus) -> StepCheckpoint {
        let now = Utc::now();
        StepCheckpoint {
            step_index,
            step_name: format!("s{step_index}"),
            status,
            output: Some(json!(step_index)),
            error: None,
            started_at: now,
            completed_at: now,
        }
    }

    #[tokio::test]
    async fn cas_rejects_stale_version() {
        let store = InMemoryStore::new();
        let mut next = ActiveState::default();
        next.insert(ActiveJob {
            job_id: Uuid::now_v7(),
            kind: JobKind::Simple,
            models: vec!["gen-x".to_string()],
            started_at: Utc::now(),
        });

        assert!(store.compare_and_swap_active(0, &next).await.unwrap());
        // Second writer still holds version 0.
        assert!(!store.compare_and_swap_active(0, &ActiveState::default()).await.unwrap());

        let current = store.load_active().await.unwrap();
        assert_eq!(current.version, 1);
        assert_eq!(current.jobs.len(), 1);
    }

    #[tokio::test]
    async fn completed_checkpoint_cannot_be_overwritten() {
        let store = InMemoryStore::new();
        let id = Uuid::now_v7();
        store
            .create_execution(&WorkflowExecution::new(id, 2, json!(null)))
            .await
            .unwrap();

        store
            .save_checkpoint(id, &checkpoint(0, CheckpointStatus::FailedRetryable))
            .await
            .unwrap();
        // A failed checkpoint may be replaced by the retry's result.
        store
            .save_checkpoint(id, &checkpoint(0, CheckpointStatus::Completed))
            .await
            .unwrap();

        let err = store
            .save_checkpoint(id, &checkpoint(0, CheckpointStatus::FailedHard))
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn queued_jobs_are_fifo_by_queued_at() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut later = job(&["a"]);
        later.status = JobStatus::Queued;
        later.queued_at = Some(now);
        let mut earlier = job(&["b"]);
        earlier.status = JobStatus::Queued;
        earlier.queued_at = Some(now - Duration::seconds(10));
        store.create_job(&later).await.unwrap();
        store.create_job(&earlier).await.unwrap();
        store.create_job(&job(&["c"])).await.unwrap();

        let queued = store.list_queued_jobs().await.unwrap();
        let ids: Vec<Uuid> = queued.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.load_active().await,
            Err(RepositoryError::Connection)
        ));
        assert!(store.get_job(Uuid::now_v7()).await.is_err());
        store.set_unavailable(false);
        assert!(store.load_active().await.is_ok());
    }

    #[tokio::test]
    async fn update_missing_job_is_not_found() {
        let store = InMemoryStore::new();
        let err = store.update_job(&job(&["a"])).await.unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn quota_tracks_usage_against_limit() {
        let quota = InMemoryQuota::new();
        assert!(quota.has_capacity("acme", "gen-x").await.unwrap());

        quota.set_limit("acme", "gen-x", 1);
        quota.record_usage("acme", "gen-x").await.unwrap();
        assert_eq!(quota.used("acme", "gen-x"), 1);
        assert!(!quota.has_capacity("acme", "gen-x").await.unwrap());

        quota.reset("acme", "gen-x");
        assert!(quota.has_capacity("acme", "gen-x").await.unwrap());
    }
}
