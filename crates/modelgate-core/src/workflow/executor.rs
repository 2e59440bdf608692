//! Step executor port.
//!
//! A step executor runs one pipeline step: it receives the previous step's
//! output and returns this step's output. Concrete providers live outside
//! the core crate; they only have to raise a [`StepError`] the classifier
//! understands.
//!
//! Follows the same blanket-impl pattern as the provider traits:
//! 1. `StepExecutor` uses RPITIT
//! 2. `StepExecutorDyn` is the object-safe mirror with boxed futures
//! 3. `BoxStepExecutor` wraps `Box<dyn StepExecutorDyn>` and delegates

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Everything an executor may know about the step it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub job_id: Uuid,
    pub step_index: u32,
    pub step_name: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    /// Previous step's output, or the job input for step 0.
    pub input: Value,
    /// How many times this job has been parked before this attempt.
    pub attempt: u32,
    /// Cancelled when the job is cancelled; long-running executors should
    /// watch it.
    pub cancel: CancellationToken,
}

/// Failures raised by step executors.
///
/// Variants describe what happened, not what to do about it; the
/// `ErrorClassifier` decides retryable versus hard.
#[derive(Debug, Error)]
pub enum StepError {
    /// Non-success HTTP response from a provider.
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },

    /// The request never produced a response (DNS, connect, reset).
    #[error("transport error: {0}")]
    Transport(String),

    #[error("step timed out after {0:?}")]
    Timeout(Duration),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("missing parameter: {0}")]
    MissingParameter(String),

    #[error("step panicked: {0}")]
    Panicked(String),

    /// Anything the executor could not describe more precisely.
    #[error("{0}")]
    Other(String),
}

/// Runs a single pipeline step.
pub trait StepExecutor: Send + Sync {
    fn execute(
        &self,
        ctx: &StepContext,
    ) -> impl Future<Output = Result<Value, StepError>> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        ctx: &'a StepContext,
    ) -> Pin<Box<dyn Future<Output = Result<Value, StepError>> + Send + 'a>> {
        Box::pin(self.execute(ctx))
    }
}

/// Type-erased step executor, so one pipeline can mix executor types.
pub struct BoxStepExecutor {
    inner: Box<dyn StepExecutorDyn + Send + Sync>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        self.inner.execute_boxed(ctx).await
    }
}

impl std::fmt::Debug for BoxStepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepExecutor").finish_non_exhaustive()
    }
}

/// Executor backed by an async closure, for in-process steps.
pub struct FnStepExecutor<F> {
    f: F,
}

impl<F> FnStepExecutor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F, Fut> StepExecutor for FnStepExecutor<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, StepError>> + Send,
{
    fn execute(&self, ctx: &StepContext) -> impl Future<Output = Result<Value, StepError>> + Send {
        (self.f)(ctx.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(input: Value) -> StepContext {
        StepContext {
            job_id: Uuid::now_v7(),
            step_index: 0,
            step_name: "generate".to_string(),
            model: Some("gen-x".to_string()),
            provider: None,
            input,
            attempt: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn fn_executor_through_box() {
        let executor = BoxStepExecutor::new(FnStepExecutor::new(|ctx: StepContext| async move {
            Ok::<_, StepError>(json!({ "echo": ctx.input, "model": ctx.model }))
        }));
        let output = executor.execute(&ctx(json!("hi"))).await.unwrap();
        assert_eq!(output, json!({ "echo": "hi", "model": "gen-x" }));
    }

    #[tokio::test]
    async fn errors_pass_through_box() {
        let executor = BoxStepExecutor::new(FnStepExecutor::new(|_ctx: StepContext| async move {
            Err::<Value, _>(StepError::Http {
                status: 429,
                retry_after: None,
                body: "slow down".to_string(),
            })
        }));
        let err = executor.execute(&ctx(Value::Null)).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP 429: slow down");
    }
}
