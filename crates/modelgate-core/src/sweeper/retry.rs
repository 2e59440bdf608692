//! Periodic sweep over `pending_retry` jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use modelgate_types::config::SweeperConfig;
use modelgate_types::error::RepositoryError;
use modelgate_types::event::{QueueEvent, QueueEventType};
use modelgate_types::job::{Job, JobStatus};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::conditions::RetryConditions;
use crate::coordinator::{ConflictCoordinator, CoordinatorError};
use crate::repository::{JobFilter, Store};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

/// What a single sweep pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// The pass was skipped because the maintenance flag exists.
    pub maintenance: bool,
    pub examined: usize,
    /// Jobs admitted by this pass; the caller resumes them.
    pub admitted: Vec<Uuid>,
    /// Jobs whose blocking condition has not cleared yet.
    pub not_ready: Vec<Uuid>,
    /// Ready jobs that lost admission to a conflicting job and were queued.
    pub deferred: Vec<Uuid>,
    /// Jobs forced to `failed` at the retry ceiling.
    pub exhausted: Vec<Uuid>,
}

pub struct RetrySweeper<S: Store> {
    store: Arc<S>,
    coordinator: Arc<ConflictCoordinator<S>>,
    conditions: RetryConditions,
    config: SweeperConfig,
}

impl<S: Store> RetrySweeper<S> {
    pub fn new(
        store: Arc<S>,
        coordinator: Arc<ConflictCoordinator<S>>,
        conditions: RetryConditions,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            conditions,
            config,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.interval_secs.max(1))
    }

    /// Run one pass at `now`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let mut report = SweepReport::default();

        if let Some(flag) = &self.config.maintenance_flag {
            if tokio::fs::try_exists(flag).await.unwrap_or(false) {
                tracing::info!(flag = %flag.display(), "maintenance flag present, sweep skipped");
                report.maintenance = true;
                return Ok(report);
            }
        }

        let parked = self
            .store
            .list_jobs(&JobFilter::with_status(JobStatus::PendingRetry))
            .await?;

        for job in parked {
            report.examined += 1;
            self.sweep_job(&job, now, &mut report).await?;
        }

        if report.examined > 0 {
            tracing::info!(
                examined = report.examined,
                admitted = report.admitted.len(),
                not_ready = report.not_ready.len(),
                deferred = report.deferred.len(),
                exhausted = report.exhausted.len(),
                "sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_job(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), SweepError> {
        let execution = self.store.get_execution(job.id).await?;
        let retry_count = execution.as_ref().map_or(0, |e| e.retry_count);

        if retry_count >= self.config.max_retries {
            let reason = format!(
                "retry limit reached ({retry_count}/{})",
                self.config.max_retries
            );
            self.coordinator.force_fail(job.id, &reason).await?;
            report.exhausted.push(job.id);
            return Ok(());
        }

        let ready = match execution.as_ref().and_then(|e| e.last_failure.as_ref()) {
            Some(failure) => match self.conditions.is_ready(failure, now).await {
                Ok(ready) => ready,
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "retry condition check failed");
                    false
                }
            },
            None => true,
        };
        if !ready {
            tracing::debug!(job_id = %job.id, "retry condition not cleared");
            report.not_ready.push(job.id);
            return Ok(());
        }

        let admission = self
            .coordinator
            .try_start(job.id, job.kind, &job.required_models)
            .await?;
        if admission.is_admitted() {
            report.admitted.push(job.id);
            return Ok(());
        }

        if let Some(blocked_by) = admission.blocked_by() {
            self.coordinator
                .record(
                    QueueEvent::new(
                        job.id,
                        job.kind,
                        QueueEventType::Conflict,
                        job.required_models.clone(),
                    )
                    .with_conflict(Some(blocked_by), admission.reason().unwrap_or_default()),
                )
                .await?;
        }
        report.deferred.push(job.id);
        Ok(())
    }

    /// Sweep every interval until `cancel` fires.
    ///
    /// `on_admitted` is called with each admitted job id. Errors from a pass
    /// are logged and the loop continues.
    pub async fn run<F>(&self, cancel: CancellationToken, on_admitted: F)
    where
        F: Fn(Uuid) + Send + Sync,
    {
        let mut ticker = tokio::time::interval(self.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval().as_secs(), "retry sweeper started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) => report.admitted.iter().copied().for_each(&on_admitted),
                        Err(err) => tracing::error!(error = %err, "sweep failed"),
                    }
                }
            }
        }
        tracing::info!("retry sweeper stopped");
    }
}
