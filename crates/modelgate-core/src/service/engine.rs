//! Job engine service.
//!
//! The engine is the entry point callers use: it validates submissions,
//! admits them through the coordinator and launches admitted jobs on
//! tracked tokio tasks. Every job it launches (directly, via promotion,
//! via the sweeper or via recovery) goes through [`JobEngine::launch`].

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use modelgate_types::config::GlobalConfig;
use modelgate_types::error::RepositoryError;
use modelgate_types::job::{Job, JobKind, JobSpec, JobStatus, JobStatusView};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::coordinator::{CancelOutcome, ConflictCoordinator, CoordinatorError, ReconcileReport};
use crate::event::EventBus;
use crate::provider::{AlwaysAvailable, BoxCredentialProvider, BoxQuotaProvider};
use crate::repository::{JobFilter, Store};
use crate::sweeper::{RetryConditions, RetrySweeper, SweepError, SweepReport};
use crate::workflow::classifier::ErrorClassifier;
use crate::workflow::registry::PipelineRegistry;
use crate::workflow::runner::{RunSignals, RunnerError, WorkflowRunner};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Sweep(#[from] SweepError),

    #[error("unknown pipeline: {0}")]
    UnknownPipeline(String),

    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("job not found: {0}")]
    JobNotFound(Uuid),
}

/// External collaborators the engine consults.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub quota: Arc<BoxQuotaProvider>,
    pub credentials: Arc<BoxCredentialProvider>,
    pub bus: EventBus,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            quota: Arc::new(BoxQuotaProvider::new(AlwaysAvailable)),
            credentials: Arc::new(BoxCredentialProvider::new(AlwaysAvailable)),
            bus: EventBus::default(),
        }
    }
}

/// Result of startup recovery.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    pub reconcile: ReconcileReport,
    /// Jobs admitted from `pending` or `queued` after reconciliation.
    pub admitted: Vec<Uuid>,
}

/// Cheaply cloneable handle to the engine.
pub struct JobEngine<S: Store> {
    inner: Arc<EngineInner<S>>,
}

impl<S: Store> Clone for JobEngine<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct EngineInner<S: Store> {
    store: Arc<S>,
    coordinator: Arc<ConflictCoordinator<S>>,
    runner: WorkflowRunner<S>,
    sweeper: RetrySweeper<S>,
    registry: Arc<PipelineRegistry>,
    /// Cancellation tokens of jobs running in this process.
    tokens: DashMap<Uuid, CancellationToken>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    bus: EventBus,
    config: GlobalConfig,
}

impl<S: Store> JobEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<PipelineRegistry>,
        config: GlobalConfig,
        options: EngineOptions,
    ) -> Self {
        let coordinator = Arc::new(ConflictCoordinator::new(
            store.clone(),
            config.coordinator.admission_mode,
            options.bus.clone(),
        ));
        let runner = WorkflowRunner::new(store.clone(), coordinator.clone(), registry.clone())
            .with_classifier(ErrorClassifier::new(config.backoff.clone()))
            .with_quota(options.quota.clone())
            .with_event_bus(options.bus.clone())
            .with_config(&config.runner);
        let sweeper = RetrySweeper::new(
            store.clone(),
            coordinator.clone(),
            RetryConditions::new(options.quota, options.credentials),
            config.sweeper.clone(),
        );

        tracing::info!(
            mode = %config.coordinator.admission_mode,
            pipelines = registry.len(),
            "job engine ready"
        );

        Self {
            inner: Arc::new(EngineInner {
                store,
                coordinator,
                runner,
                sweeper,
                registry,
                tokens: DashMap::new(),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                bus: options.bus,
                config,
            }),
        }
    }

    pub fn coordinator(&self) -> &Arc<ConflictCoordinator<S>> {
        &self.inner.coordinator
    }

    pub fn registry(&self) -> &Arc<PipelineRegistry> {
        &self.inner.registry
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.bus
    }

    /// Accept a job and start it immediately if its models are free.
    ///
    /// A conflicting job is left `queued`; it starts when the holder
    /// finishes.
    pub async fn submit(&self, spec: JobSpec) -> Result<Uuid, EngineError> {
        let job = self.build_job(spec)?;
        self.inner.coordinator.enqueue(&job).await?;

        let admission = self
            .inner
            .coordinator
            .try_start(job.id, job.kind, &job.required_models)
            .await?;
        if admission.is_admitted() {
            self.launch(job.id);
        } else {
            tracing::info!(
                job_id = %job.id,
                reason = admission.reason().unwrap_or_default(),
                "job queued behind a conflict"
            );
        }
        Ok(job.id)
    }

    /// Accept a job without admitting it. A worker picks it up during
    /// recovery or [`admit_pending`](Self::admit_pending).
    pub async fn enqueue_only(&self, spec: JobSpec) -> Result<Uuid, EngineError> {
        let job = self.build_job(spec)?;
        self.inner.coordinator.enqueue(&job).await?;
        Ok(job.id)
    }

    fn build_job(&self, spec: JobSpec) -> Result<Job, EngineError> {
        let pipeline = self
            .inner
            .registry
            .get(&spec.pipeline)
            .ok_or_else(|| EngineError::UnknownPipeline(spec.pipeline.clone()))?;
        let definition = pipeline.definition();

        if spec.kind == JobKind::Simple && definition.total_steps() != 1 {
            return Err(EngineError::InvalidSpec(format!(
                "simple job needs a single-step pipeline, '{}' has {} steps",
                definition.name,
                definition.total_steps()
            )));
        }

        Ok(Job::new(
            spec.kind,
            definition.name.clone(),
            definition.required_models(),
            spec.input,
        ))
    }

    /// Everything known about a job, derived from persisted state.
    pub async fn get_status(&self, job_id: Uuid) -> Result<JobStatusView, EngineError> {
        let job = self
            .inner
            .store
            .get_job(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))?;
        let execution = self.inner.store.get_execution(job_id).await?;

        let total_steps = match &execution {
            Some(exec) => exec.total_steps,
            None => self
                .inner
                .registry
                .get(&job.pipeline)
                .map_or(0, |p| p.definition().total_steps()),
        };

        Ok(JobStatusView {
            job_id,
            kind: job.kind,
            pipeline: job.pipeline,
            status: job.status,
            current_step: execution.as_ref().map_or(0, |e| e.current_step),
            total_steps,
            retry_count: execution.as_ref().map_or(0, |e| e.retry_count),
            checkpoints: execution
                .map(|e| e.checkpoints.into_values().collect())
                .unwrap_or_default(),
            blocked_by: job.blocked_by,
            conflict_reason: job.conflict_reason,
            error: job.error,
        })
    }

    /// Cancel a job.
    ///
    /// Jobs that have not started are cancelled at once. A job running in
    /// this process is signalled and ends `cancelled` at its next step
    /// boundary or sooner. A job running in another process is reported as
    /// [`CancelOutcome::Running`] and left alone.
    pub async fn cancel(&self, job_id: Uuid) -> Result<CancelOutcome, EngineError> {
        let outcome = self.inner.coordinator.cancel(job_id).await?;
        match &outcome {
            CancelOutcome::Running => match self.inner.tokens.get(&job_id) {
                Some(token) => {
                    token.cancel();
                    tracing::info!(job_id = %job_id, "cancellation signalled");
                }
                None => {
                    tracing::warn!(job_id = %job_id, "job is running in another process");
                }
            },
            CancelOutcome::Cancelled => tracing::info!(job_id = %job_id, "job cancelled"),
            CancelOutcome::AlreadyFinished(status) => {
                tracing::debug!(job_id = %job_id, %status, "cancel ignored");
            }
        }
        Ok(outcome)
    }

    /// Whether this process is running `job_id`.
    pub fn is_running_here(&self, job_id: Uuid) -> bool {
        self.inner.tokens.contains_key(&job_id)
    }

    /// Run an admitted job on a tracked task.
    ///
    /// A job with an existing execution is resumed from its current step.
    pub fn launch(&self, job_id: Uuid) {
        let cancel = CancellationToken::new();
        self.inner.tokens.insert(job_id, cancel.clone());
        let engine = self.clone();
        self.inner.tracker.spawn(async move {
            engine.drive(job_id, cancel).await;
        });
    }

    async fn drive(&self, job_id: Uuid, cancel: CancellationToken) {
        let signals = RunSignals {
            cancel,
            shutdown: self.inner.shutdown.clone(),
        };
        let result = match self.inner.store.get_execution(job_id).await {
            Ok(Some(_)) => self.inner.runner.resume(job_id, &signals).await,
            Ok(None) => self.inner.runner.run(job_id, &signals).await,
            Err(err) => Err(err.into()),
        };
        self.inner.tokens.remove(&job_id);

        match result {
            Ok(outcome) => {
                tracing::debug!(job_id = %job_id, status = %outcome.status, "run finished");
                for promoted in outcome.promoted {
                    self.launch(promoted);
                }
            }
            // The job keeps its active entry; reconciliation repairs it.
            Err(err) => tracing::error!(job_id = %job_id, error = %err, "run aborted"),
        }
    }

    /// Admit accepted jobs that were never put through admission.
    pub async fn admit_pending(&self) -> Result<Vec<Uuid>, EngineError> {
        let pending = self
            .inner
            .store
            .list_jobs(&JobFilter::with_status(JobStatus::Pending))
            .await?;

        let mut admitted = Vec::new();
        for job in pending {
            let admission = self
                .inner
                .coordinator
                .try_start(job.id, job.kind, &job.required_models)
                .await?;
            if admission.is_admitted() {
                self.launch(job.id);
                admitted.push(job.id);
            }
        }
        Ok(admitted)
    }

    /// Startup recovery: reconcile the active set, then admit whatever fits.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport, EngineError> {
        let owned: HashSet<Uuid> = self.inner.tokens.iter().map(|e| *e.key()).collect();
        let reconcile = self
            .inner
            .coordinator
            .reconcile(now, &owned, &self.inner.config.reconcile)
            .await?;
        for id in &reconcile.promoted {
            self.launch(*id);
        }

        let mut admitted = self.admit_pending().await?;
        for job in self.inner.coordinator.promote_queued().await? {
            self.launch(job.id);
            admitted.push(job.id);
        }

        if !reconcile.is_empty() || !admitted.is_empty() {
            tracing::info!(
                released = reconcile.released.len(),
                requeued = reconcile.requeued.len(),
                failed = reconcile.failed.len(),
                admitted = admitted.len() + reconcile.promoted.len(),
                "recovery finished"
            );
        }
        Ok(RecoveryReport {
            reconcile,
            admitted,
        })
    }

    /// One sweep pass; admitted jobs are launched.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let report = self.inner.sweeper.sweep_once(now).await?;
        for id in &report.admitted {
            self.launch(*id);
        }
        Ok(report)
    }

    /// Start the periodic sweeper. It stops on [`shutdown`](Self::shutdown).
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let engine = self.clone();
        let cancel = self.inner.shutdown.child_token();
        tokio::spawn(async move {
            let launcher = engine.clone();
            engine
                .inner
                .sweeper
                .run(cancel, move |id| launcher.launch(id))
                .await;
        })
    }

    /// Wait until every launched job (and whatever it promoted) has stopped.
    pub async fn wait_idle(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }

    /// Stop the sweeper, park running jobs and wait for them.
    pub async fn shutdown(&self) {
        tracing::info!(running = self.inner.tokens.len(), "shutting down job engine");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryStore;
    use crate::repository::{ActiveStateStore, JobRepository};
    use crate::testing::{Script, ScriptedStep, http_step, pipeline, registry};
    use crate::workflow::executor::StepError;
    use crate::workflow::registry::Pipeline;
    use modelgate_types::admission::AdmissionMode;
    use modelgate_types::execution::CheckpointStatus;
    use serde_json::json;

    fn engine_with(pipelines: Vec<Pipeline>, config: GlobalConfig) -> (Arc<InMemoryStore>, JobEngine<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let engine = JobEngine::new(store.clone(), registry(pipelines), config, EngineOptions::default());
        (store, engine)
    }

    fn spec(kind: JobKind, pipeline: &str) -> JobSpec {
        JobSpec {
            kind,
            pipeline: pipeline.to_string(),
            input: json!({"prompt": "cat"}),
        }
    }

    fn image(step: ScriptedStep) -> Pipeline {
        pipeline("image", vec![(http_step("render", Some("gen-x")), step)])
    }

    async fn wait_for_calls(step: &ScriptedStep, n: usize) {
        while step.calls() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn submit_runs_to_completion() {
        let p = pipeline(
            "t2v",
            vec![
                (http_step("generate", Some("gen-x")), ScriptedStep::new()),
                (http_step("encode", None), ScriptedStep::new()),
            ],
        );
        let (store, engine) = engine_with(vec![p], GlobalConfig::default());

        let id = engine.submit(spec(JobKind::Workflow, "t2v")).await.unwrap();
        engine.wait_idle().await;

        let view = engine.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.current_step, 2);
        assert_eq!(view.total_steps, 2);
        assert_eq!(view.checkpoints.len(), 2);
        assert!(view
            .checkpoints
            .iter()
            .all(|c| c.status == CheckpointStatus::Completed));
        assert!(store.load_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn conflicting_submission_waits_then_runs() {
        // Scenario: A holds gen-x; B needs gen-x and is blocked until A ends.
        let step = ScriptedStep::new().then(Script::Hang);
        let (_, engine) = engine_with(vec![image(step.clone())], GlobalConfig::default());

        let a = engine.submit(spec(JobKind::Simple, "image")).await.unwrap();
        wait_for_calls(&step, 1).await;
        let b = engine.submit(spec(JobKind::Simple, "image")).await.unwrap();

        let view = engine.get_status(b).await.unwrap();
        assert_eq!(view.status, JobStatus::Queued);
        assert_eq!(view.blocked_by, Some(a));
        assert!(view.conflict_reason.unwrap().contains("gen-x"));

        engine.cancel(a).await.unwrap();
        engine.wait_idle().await;

        assert_eq!(engine.get_status(a).await.unwrap().status, JobStatus::Cancelled);
        let view = engine.get_status(b).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert!(view.blocked_by.is_none());
    }

    #[tokio::test]
    async fn single_flight_blocks_unrelated_models() {
        let hang = ScriptedStep::new().then(Script::Hang);
        let other = pipeline("audio", vec![(http_step("speak", Some("tts")), ScriptedStep::new())]);
        let mut config = GlobalConfig::default();
        config.coordinator.admission_mode = AdmissionMode::SingleFlight;
        let (_, engine) = engine_with(vec![image(hang.clone()), other], config);

        let a = engine.submit(spec(JobKind::Simple, "image")).await.unwrap();
        wait_for_calls(&hang, 1).await;
        let b = engine.submit(spec(JobKind::Simple, "audio")).await.unwrap();
        assert_eq!(engine.get_status(b).await.unwrap().status, JobStatus::Queued);

        engine.cancel(a).await.unwrap();
        engine.wait_idle().await;
        assert_eq!(engine.get_status(b).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn rejects_bad_specs() {
        let p = pipeline(
            "t2v",
            vec![
                (http_step("generate", Some("gen-x")), ScriptedStep::new()),
                (http_step("encode", None), ScriptedStep::new()),
            ],
        );
        let (_, engine) = engine_with(vec![p], GlobalConfig::default());

        let err = engine.submit(spec(JobKind::Simple, "t2v")).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidSpec(_)));
        let err = engine.submit(spec(JobKind::Workflow, "nope")).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownPipeline(_)));
        let err = engine.get_status(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, EngineError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn cancel_queued_job_never_runs_it() {
        let hang = ScriptedStep::new().then(Script::Hang);
        let (_, engine) = engine_with(vec![image(hang.clone())], GlobalConfig::default());

        let a = engine.submit(spec(JobKind::Simple, "image")).await.unwrap();
        wait_for_calls(&hang, 1).await;
        let b = engine.submit(spec(JobKind::Simple, "image")).await.unwrap();

        assert_eq!(engine.cancel(b).await.unwrap(), CancelOutcome::Cancelled);
        assert_eq!(engine.cancel(a).await.unwrap(), CancelOutcome::Running);
        engine.wait_idle().await;

        assert_eq!(hang.calls(), 1);
        assert_eq!(engine.get_status(b).await.unwrap().status, JobStatus::Cancelled);
        assert_eq!(
            engine.cancel(b).await.unwrap(),
            CancelOutcome::AlreadyFinished(JobStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn retryable_failure_is_resumed_by_sweep() {
        let step = ScriptedStep::new().then_err(StepError::Unavailable("down".to_string()));
        let (_, engine) = engine_with(vec![image(step.clone())], GlobalConfig::default());

        let id = engine.submit(spec(JobKind::Simple, "image")).await.unwrap();
        engine.wait_idle().await;
        let view = engine.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::PendingRetry);
        assert_eq!(view.retry_count, 1);

        let report = engine.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.admitted, vec![id]);
        engine.wait_idle().await;

        assert_eq!(engine.get_status(id).await.unwrap().status, JobStatus::Completed);
        assert_eq!(step.calls(), 2);
    }

    #[tokio::test]
    async fn recover_admits_jobs_accepted_elsewhere() {
        let (store, engine) = engine_with(vec![image(ScriptedStep::new())], GlobalConfig::default());
        let id = engine.enqueue_only(spec(JobKind::Simple, "image")).await.unwrap();
        assert_eq!(
            store.get_job(id).await.unwrap().unwrap().status,
            JobStatus::Pending
        );

        let report = engine.recover(Utc::now()).await.unwrap();
        assert_eq!(report.admitted, vec![id]);
        engine.wait_idle().await;
        assert_eq!(engine.get_status(id).await.unwrap().status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn shutdown_parks_running_jobs() {
        let hang = ScriptedStep::new().then(Script::Hang);
        let (store, engine) = engine_with(vec![image(hang.clone())], GlobalConfig::default());
        let sweeper = engine.spawn_sweeper();

        let id = engine.submit(spec(JobKind::Simple, "image")).await.unwrap();
        wait_for_calls(&hang, 1).await;
        assert!(engine.is_running_here(id));

        engine.shutdown().await;
        sweeper.await.unwrap();

        let view = engine.get_status(id).await.unwrap();
        assert_eq!(view.status, JobStatus::PendingRetry);
        assert_eq!(view.retry_count, 0);
        assert!(store.load_active().await.unwrap().is_empty());
        assert!(!engine.is_running_here(id));
    }
}
