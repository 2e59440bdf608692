//! Drives one admitted job through its pipeline steps.
//!
//! The runner never retries a step itself. After every attempt it writes a
//! checkpoint, and on any terminal or parked outcome it hands the job's
//! models back to the coordinator. The returned [`RunOutcome`] lists the
//! queued jobs that were admitted as a result; the caller runs them.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::FutureExt;
use modelgate_types::config::RunnerConfig;
use modelgate_types::error::RepositoryError;
use modelgate_types::event::JobEvent;
use modelgate_types::execution::WorkflowExecution;
use modelgate_types::failure::{FailureClass, RetryableSubtype, StepFailure};
use modelgate_types::job::{Job, JobStatus};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::classifier::ErrorClassifier;
use super::executor::{StepContext, StepError};
use super::registry::{Pipeline, PipelineRegistry};
use crate::coordinator::{ConflictCoordinator, CoordinatorError};
use crate::event::EventBus;
use crate::provider::{AlwaysAvailable, BoxQuotaProvider};
use crate::repository::Store;

/// Default step-level timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),
}

/// Signals a running job watches between and during steps.
#[derive(Debug, Clone, Default)]
pub struct RunSignals {
    /// User cancellation: the job ends `cancelled`.
    pub cancel: CancellationToken,
    /// Process shutdown: the job is parked `pending_retry` for a later resume.
    pub shutdown: CancellationToken,
}

/// How a run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// Queued jobs admitted when this job released its models.
    pub promoted: Vec<Uuid>,
}

enum Interrupt {
    Cancelled,
    Shutdown,
}

pub struct WorkflowRunner<S: Store> {
    store: Arc<S>,
    coordinator: Arc<ConflictCoordinator<S>>,
    registry: Arc<PipelineRegistry>,
    checkpoints: CheckpointManager<S>,
    classifier: ErrorClassifier,
    quota: Arc<BoxQuotaProvider>,
    bus: EventBus,
    step_timeout: Duration,
}

impl<S: Store> WorkflowRunner<S> {
    pub fn new(
        store: Arc<S>,
        coordinator: Arc<ConflictCoordinator<S>>,
        registry: Arc<PipelineRegistry>,
    ) -> Self {
        Self {
            checkpoints: CheckpointManager::new(store.clone()),
            store,
            coordinator,
            registry,
            classifier: ErrorClassifier::default(),
            quota: Arc::new(BoxQuotaProvider::new(AlwaysAvailable)),
            bus: EventBus::default(),
            step_timeout: Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_quota(mut self, quota: Arc<BoxQuotaProvider>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_config(self, config: &RunnerConfig) -> Self {
        self.with_step_timeout(Duration::from_secs(config.step_timeout_secs))
    }

    /// Start an admitted job from step 0.
    ///
    /// If an execution already exists (a promoted job that was parked
    /// earlier), completed steps are kept and the run continues from
    /// `current_step`.
    pub async fn run(&self, job_id: Uuid, signals: &RunSignals) -> Result<RunOutcome, RunnerError> {
        let job = self.load_job(job_id).await?;
        let Some(pipeline) = self.registry.get(&job.pipeline) else {
            let reason = format!("unknown pipeline '{}'", job.pipeline);
            return self.fail_unrunnable(&job, reason).await;
        };

        let execution = match self.checkpoints.load(job_id).await? {
            Some(existing) => {
                tracing::debug!(job_id = %job_id, step = existing.current_step, "execution exists, continuing");
                existing
            }
            None => {
                self.checkpoints
                    .begin(job_id, pipeline.definition().total_steps(), job.input.clone())
                    .await?
            }
        };
        self.drive(job, &pipeline, execution, signals).await
    }

    /// Continue an admitted job from its persisted `current_step`.
    pub async fn resume(&self, job_id: Uuid, signals: &RunSignals) -> Result<RunOutcome, RunnerError> {
        let job = self.load_job(job_id).await?;
        let execution = self.checkpoints.restore(job_id).await?;
        let Some(pipeline) = self.registry.get(&job.pipeline) else {
            let reason = format!("unknown pipeline '{}'", job.pipeline);
            return self.fail_unrunnable(&job, reason).await;
        };
        tracing::info!(
            job_id = %job_id,
            step = execution.current_step,
            retry_count = execution.retry_count,
            "resuming job"
        );
        self.drive(job, &pipeline, execution, signals).await
    }

    async fn drive(
        &self,
        job: Job,
        pipeline: &Pipeline,
        mut execution: WorkflowExecution,
        signals: &RunSignals,
    ) -> Result<RunOutcome, RunnerError> {
        if execution.total_steps != pipeline.definition().total_steps() {
            let reason = format!(
                "pipeline '{}' now has {} steps but the execution expects {}",
                pipeline.name(),
                pipeline.definition().total_steps(),
                execution.total_steps
            );
            return self.fail_unrunnable(&job, reason).await;
        }

        self.checkpoints
            .set_status(&mut execution, JobStatus::Running)
            .await?;

        while !execution.is_finished() {
            if signals.cancel.is_cancelled() {
                return self.acknowledge_cancel(&job, &mut execution).await;
            }
            if signals.shutdown.is_cancelled() {
                return self.park_interrupted(&job, &mut execution).await;
            }

            let index = execution.current_step;
            let Some((step, executor)) = pipeline.step(index) else {
                let reason = format!("pipeline '{}' has no step {index}", pipeline.name());
                return self.fail_unrunnable(&job, reason).await;
            };

            let ctx = StepContext {
                job_id: job.id,
                step_index: index,
                step_name: step.name.clone(),
                model: step.model.clone(),
                provider: step.provider.clone(),
                input: execution.next_input(),
                attempt: execution.retry_count,
                cancel: signals.cancel.child_token(),
            };
            let timeout = step
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.step_timeout);

            self.bus.publish(JobEvent::StepStarted {
                job_id: job.id,
                step_index: index,
                step_name: step.name.clone(),
            });
            tracing::debug!(job_id = %job.id, step = index, name = %step.name, "step started");

            let started_at = Utc::now();
            let clock = Instant::now();
            let attempt = tokio::time::timeout(
                timeout,
                AssertUnwindSafe(async { executor.execute(&ctx).await }).catch_unwind(),
            );
            let result = tokio::select! {
                biased;
                _ = signals.cancel.cancelled() => Err(Interrupt::Cancelled),
                _ = signals.shutdown.cancelled() => Err(Interrupt::Shutdown),
                r = attempt => Ok(r),
            };

            let outcome = match result {
                Err(Interrupt::Cancelled) => {
                    return self.acknowledge_cancel(&job, &mut execution).await;
                }
                Err(Interrupt::Shutdown) => {
                    return self.park_interrupted(&job, &mut execution).await;
                }
                Ok(Err(_elapsed)) => Err(StepError::Timeout(timeout)),
                Ok(Ok(Err(panic))) => Err(StepError::Panicked(panic_message(&*panic))),
                Ok(Ok(Ok(result))) => result,
            };

            match outcome {
                Ok(output) => {
                    self.checkpoints
                        .record_success(&mut execution, &step.name, started_at, output)
                        .await?;
                    self.bus.publish(JobEvent::StepCompleted {
                        job_id: job.id,
                        step_index: index,
                        duration_ms: clock.elapsed().as_millis() as u64,
                    });
                    if let (Some(provider), Some(model)) = (&step.provider, &step.model) {
                        if let Err(err) = self.quota.record_usage(provider, model).await {
                            tracing::warn!(job_id = %job.id, provider, model, error = %err, "failed to record quota usage");
                        }
                    }
                }
                Err(err) => {
                    let now = Utc::now();
                    let failure = StepFailure {
                        class: self.classifier.classify(&err, now),
                        message: err.to_string(),
                        model: step.model.clone(),
                        provider: step.provider.clone(),
                        occurred_at: now,
                    };
                    self.bus.publish(JobEvent::StepFailed {
                        job_id: job.id,
                        step_index: index,
                        retryable: failure.class.is_retryable(),
                        error: failure.to_string(),
                    });
                    self.checkpoints
                        .record_failure(&mut execution, &step.name, started_at, failure.clone())
                        .await?;

                    return if failure.class.is_retryable() {
                        self.park(&job, &execution, &failure).await
                    } else {
                        self.fail(&job, failure.to_string()).await
                    };
                }
            }
        }

        self.complete(&job, &mut execution).await
    }

    async fn complete(
        &self,
        job: &Job,
        execution: &mut WorkflowExecution,
    ) -> Result<RunOutcome, RunnerError> {
        self.checkpoints
            .set_status(execution, JobStatus::Completed)
            .await?;
        self.update_job(job.id, JobStatus::Completed, None).await?;
        self.bus.publish(JobEvent::Completed { job_id: job.id });
        tracing::info!(job_id = %job.id, steps = execution.total_steps, "job completed");
        self.finish(job, JobStatus::Completed).await
    }

    async fn park(
        &self,
        job: &Job,
        execution: &WorkflowExecution,
        failure: &StepFailure,
    ) -> Result<RunOutcome, RunnerError> {
        self.update_job(job.id, JobStatus::PendingRetry, Some(failure.to_string()))
            .await?;
        self.bus.publish(JobEvent::Parked {
            job_id: job.id,
            retry_count: execution.retry_count,
            earliest_retry_at: failure.earliest_retry_at(),
        });
        tracing::warn!(
            job_id = %job.id,
            step = execution.current_step,
            retry_count = execution.retry_count,
            failure = %failure,
            "job parked for retry"
        );
        self.finish(job, JobStatus::PendingRetry).await
    }

    async fn fail(&self, job: &Job, error: String) -> Result<RunOutcome, RunnerError> {
        self.update_job(job.id, JobStatus::Failed, Some(error.clone()))
            .await?;
        tracing::warn!(job_id = %job.id, %error, "job failed");
        self.bus.publish(JobEvent::Failed {
            job_id: job.id,
            error,
        });
        self.finish(job, JobStatus::Failed).await
    }

    /// Fail a job that cannot run at all (unknown or changed pipeline).
    async fn fail_unrunnable(&self, job: &Job, reason: String) -> Result<RunOutcome, RunnerError> {
        if let Some(mut execution) = self.checkpoints.load(job.id).await? {
            self.checkpoints
                .set_status(&mut execution, JobStatus::Failed)
                .await?;
        }
        self.fail(job, reason).await
    }

    async fn acknowledge_cancel(
        &self,
        job: &Job,
        execution: &mut WorkflowExecution,
    ) -> Result<RunOutcome, RunnerError> {
        self.checkpoints
            .set_status(execution, JobStatus::Cancelled)
            .await?;
        let promoted = self.coordinator.on_cancelled(job.id).await?;
        tracing::info!(job_id = %job.id, step = execution.current_step, "running job cancelled");
        Ok(RunOutcome {
            job_id: job.id,
            status: JobStatus::Cancelled,
            promoted: promoted.into_iter().map(|j| j.id).collect(),
        })
    }

    /// Shutdown interrupted the job: park it without blaming the step and
    /// release its models without launching anything else.
    async fn park_interrupted(
        &self,
        job: &Job,
        execution: &mut WorkflowExecution,
    ) -> Result<RunOutcome, RunnerError> {
        let failure = StepFailure {
            class: FailureClass::Retryable {
                subtype: RetryableSubtype::Unavailable,
                earliest_retry_at: None,
            },
            message: "interrupted by shutdown".to_string(),
            model: None,
            provider: None,
            occurred_at: Utc::now(),
        };
        self.checkpoints.park_interrupted(execution, failure).await?;
        self.update_job(job.id, JobStatus::PendingRetry, None).await?;
        self.coordinator.release(job.id, job.kind).await?;
        tracing::info!(job_id = %job.id, step = execution.current_step, "job parked for shutdown");
        Ok(RunOutcome {
            job_id: job.id,
            status: JobStatus::PendingRetry,
            promoted: Vec::new(),
        })
    }

    async fn finish(&self, job: &Job, status: JobStatus) -> Result<RunOutcome, RunnerError> {
        let promoted = self.coordinator.on_finish(job.id, job.kind).await?;
        Ok(RunOutcome {
            job_id: job.id,
            status,
            promoted: promoted.into_iter().map(|j| j.id).collect(),
        })
    }

    async fn load_job(&self, job_id: Uuid) -> Result<Job, RunnerError> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or(RunnerError::JobNotFound(job_id))
    }

    async fn update_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), RunnerError> {
        let mut job = self.load_job(job_id).await?;
        job.status = status;
        job.error = error;
        job.updated_at = Utc::now();
        self.store.update_job(&job).await?;
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
