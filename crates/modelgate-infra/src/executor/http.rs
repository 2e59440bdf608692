//! HTTP step executor.
//!
//! Sends the step input to a provider endpoint as JSON and takes the JSON
//! response body as the step output. Non-success responses are reported as
//! [`StepError::Http`] with the status and any `Retry-After` hint, leaving
//! the retry decision to the classifier.

use std::collections::HashMap;
use std::time::Duration;

use modelgate_core::workflow::executor::{StepContext, StepError, StepExecutor};
use modelgate_types::pipeline::ExecutorConfig;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Client, Method, Response};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpExecutorError {
    #[error("invalid HTTP method '{0}'")]
    Method(String),

    #[error("invalid header '{0}'")]
    Header(String),

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

#[derive(Debug, Clone)]
pub struct HttpStepExecutor {
    client: Client,
    url: String,
    method: Method,
    headers: HeaderMap,
}

impl HttpStepExecutor {
    pub fn new(
        client: Client,
        url: impl Into<String>,
        method: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, HttpExecutorError> {
        let method = Method::from_bytes(method.to_uppercase().as_bytes())
            .map_err(|_| HttpExecutorError::Method(method.to_string()))?;

        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| HttpExecutorError::Header(name.clone()))?;
            let value = HeaderValue::from_str(&expand_env(value))
                .map_err(|_| HttpExecutorError::Header(name.to_string()))?;
            header_map.insert(name, value);
        }

        Ok(Self {
            client,
            url: url.into(),
            method,
            headers: header_map,
        })
    }

    pub fn from_config(client: Client, config: &ExecutorConfig) -> Result<Self, HttpExecutorError> {
        match config {
            ExecutorConfig::Http {
                url,
                method,
                headers,
            } => Self::new(client, url.clone(), method, headers),
        }
    }

    /// Shared client for all executors of a process. The runner enforces
    /// step timeouts, so the client only bounds connection setup.
    pub fn default_client() -> Result<Client, HttpExecutorError> {
        Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HttpExecutorError::Client(e.to_string()))
    }

    fn request_body(ctx: &StepContext) -> Value {
        json!({
            "job_id": ctx.job_id,
            "step": ctx.step_name,
            "step_index": ctx.step_index,
            "model": ctx.model,
            "provider": ctx.provider,
            "attempt": ctx.attempt,
            "input": ctx.input,
        })
    }
}

impl StepExecutor for HttpStepExecutor {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        tracing::debug!(
            job_id = %ctx.job_id,
            step = ctx.step_index,
            method = %self.method,
            url = %self.url,
            "calling step endpoint"
        );

        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .headers(self.headers.clone());
        request = if self.method == Method::GET {
            request.query(&[("job_id", ctx.job_id.to_string())])
        } else {
            request.json(&Self::request_body(ctx))
        };

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                StepError::Timeout(Duration::ZERO)
            } else {
                StepError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(StepError::Http {
                status: status.as_u16(),
                retry_after,
                body: truncate(body, 2048),
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| StepError::Transport(format!("failed to read response body: {e}")))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored and
/// the classifier falls back to its backoff table.
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Replace `${VAR}` with the value of environment variable `VAR`, so header
/// values in pipeline files can reference API keys without embedding them.
fn expand_env(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&std::env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn truncate(mut s: String, max: usize) -> String {
    if s.len() > max {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}
