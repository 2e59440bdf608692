//! Job domain types.
//!
//! A job is one unit of work submitted against a named pipeline. The
//! coordinator and the workflow runner are the only writers of its status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::StepCheckpoint;

/// Whether a job runs a single step or a multi-step workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Simple,
    Workflow,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Simple => write!(f, "simple"),
            JobKind::Workflow => write!(f, "workflow"),
        }
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "simple" => Ok(JobKind::Simple),
            "workflow" => Ok(JobKind::Workflow),
            other => Err(format!("invalid job kind: '{other}'")),
        }
    }
}

/// Job lifecycle states.
///
/// - Pending: accepted, admission not yet attempted
/// - Queued: admission rejected, waiting for a conflicting model to free up
/// - Running: admitted and driven by a workflow runner
/// - PendingRetry: parked after a retryable step failure
/// - Completed / Failed / Cancelled: terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    PendingRetry,
    Cancelled,
}

impl JobStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// States from which the coordinator may admit the job.
    pub fn is_admissible(self) -> bool {
        matches!(
            self,
            JobStatus::Pending | JobStatus::Queued | JobStatus::PendingRetry
        )
    }

    /// Stable string form used for storage and CLI filters.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::PendingRetry => "pending_retry",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "pending_retry" => Ok(JobStatus::PendingRetry),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("invalid job status: '{other}'")),
        }
    }
}

/// A job tracked by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 job ID (time-sortable).
    pub id: Uuid,
    pub kind: JobKind,
    /// Name of the pipeline this job executes.
    pub pipeline: String,
    pub status: JobStatus,
    /// Models this job holds for its whole lifetime, in first-seen step order.
    pub required_models: Vec<String>,
    /// Input handed to step 0.
    pub input: serde_json::Value,
    /// Active job holding a conflicting model, if queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Uuid>,
    /// Human-readable explanation of why the job is queued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
    /// When the job entered the queue (FIFO ordering key).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<DateTime<Utc>>,
    /// Terminal error message for failed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a freshly submitted job in `Pending` state.
    pub fn new(
        kind: JobKind,
        pipeline: impl Into<String>,
        required_models: Vec<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            kind,
            pipeline: pipeline.into(),
            status: JobStatus::Pending,
            required_models,
            input,
            blocked_by: None,
            conflict_reason: None,
            queued_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: JobKind,
    pub pipeline: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Point-in-time view of a job for status polling.
///
/// Built purely from persisted state, so it is safe to query at any time,
/// including while a crashed process is being reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub pipeline: String,
    pub status: JobStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub retry_count: u32,
    pub checkpoints: Vec<StepCheckpoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
