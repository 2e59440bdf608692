//! Durable workflow execution state and per-step checkpoints.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::failure::StepFailure;
use crate::job::JobStatus;

/// Outcome of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Completed,
    FailedRetryable,
    FailedHard,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::FailedRetryable => "failed_retryable",
            CheckpointStatus::FailedHard => "failed_hard",
        }
    }
}

impl std::fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(CheckpointStatus::Completed),
            "failed_retryable" => Ok(CheckpointStatus::FailedRetryable),
            "failed_hard" => Ok(CheckpointStatus::FailedHard),
            other => Err(format!("invalid checkpoint status: '{other}'")),
        }
    }
}

/// Persisted result of a single step attempt.
///
/// A `Completed` checkpoint is immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    pub step_index: u32,
    pub step_name: String,
    pub status: CheckpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepFailure>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl StepCheckpoint {
    pub fn is_completed(&self) -> bool {
        self.status == CheckpointStatus::Completed
    }
}

/// Progress record for one job's pipeline.
///
/// Invariants: every checkpoint below `current_step` is `Completed`;
/// `retry_count` never decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub job_id: Uuid,
    pub total_steps: u32,
    /// Index of the next step to run.
    pub current_step: u32,
    pub status: JobStatus,
    /// Input handed to step 0, kept so a resume never needs the submitter.
    pub input: serde_json::Value,
    #[serde(default)]
    pub checkpoints: BTreeMap<u32, StepCheckpoint>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<StepFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowExecution {
    pub fn new(job_id: Uuid, total_steps: u32, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            total_steps,
            current_step: 0,
            status: JobStatus::Running,
            input,
            checkpoints: BTreeMap::new(),
            retry_count: 0,
            last_failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.current_step >= self.total_steps
    }

    /// Input for the step at `current_step`: the previous step's output, or
    /// the original input for step 0.
    pub fn next_input(&self) -> serde_json::Value {
        if self.current_step == 0 {
            return self.input.clone();
        }
        self.checkpoints
            .get(&(self.current_step - 1))
            .and_then(|c| c.output.clone())
            .unwrap_or(serde_json::Value::Null)
    }

    /// Output of the last completed step, if any.
    pub fn final_output(&self) -> Option<&serde_json::Value> {
        self.checkpoints
            .values()
            .rev()
            .find(|c| c.is_completed())
            .and_then(|c| c.output.as_ref())
    }
}
