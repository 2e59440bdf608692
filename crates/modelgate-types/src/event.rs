//! Queue audit log entries and live progress events.
//!
//! `QueueEvent` is the durable, append-only audit record written by the
//! coordinator. `JobEvent` is broadcast on the in-process event bus for
//! progress observers and is never persisted.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::job::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    Queued,
    Started,
    Completed,
    Blocked,
    Conflict,
    Skipped,
    Cancelled,
}

impl QueueEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueEventType::Queued => "queued",
            QueueEventType::Started => "started",
            QueueEventType::Completed => "completed",
            QueueEventType::Blocked => "blocked",
            QueueEventType::Conflict => "conflict",
            QueueEventType::Skipped => "skipped",
            QueueEventType::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for QueueEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(QueueEventType::Queued),
            "started" => Ok(QueueEventType::Started),
            "completed" => Ok(QueueEventType::Completed),
            "blocked" => Ok(QueueEventType::Blocked),
            "conflict" => Ok(QueueEventType::Conflict),
            "skipped" => Ok(QueueEventType::Skipped),
            "cancelled" => Ok(QueueEventType::Cancelled),
            other => Err(format!("invalid queue event type: '{other}'")),
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEvent {
    pub id: Uuid,
    pub job_id: Uuid,
    pub job_kind: JobKind,
    pub event_type: QueueEventType,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_reason: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(
        job_id: Uuid,
        job_kind: JobKind,
        event_type: QueueEventType,
        models: Vec<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            job_id,
            job_kind,
            event_type,
            models,
            blocked_by: None,
            conflict_reason: None,
            metadata: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn with_conflict(mut self, blocked_by: Option<Uuid>, reason: impl Into<String>) -> Self {
        self.blocked_by = blocked_by;
        self.conflict_reason = Some(reason.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Live progress notifications published on the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Admitted {
        job_id: Uuid,
        models: Vec<String>,
    },
    Blocked {
        job_id: Uuid,
        blocked_by: Option<Uuid>,
        reason: String,
    },
    StepStarted {
        job_id: Uuid,
        step_index: u32,
        step_name: String,
    },
    StepCompleted {
        job_id: Uuid,
        step_index: u32,
        duration_ms: u64,
    },
    StepFailed {
        job_id: Uuid,
        step_index: u32,
        retryable: bool,
        error: String,
    },
    Parked {
        job_id: Uuid,
        retry_count: u32,
        earliest_retry_at: Option<DateTime<Utc>>,
    },
    Completed {
        job_id: Uuid,
    },
    Failed {
        job_id: Uuid,
        error: String,
    },
    Cancelled {
        job_id: Uuid,
    },
}

impl JobEvent {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::Admitted { job_id, .. }
            | JobEvent::Blocked { job_id, .. }
            | JobEvent::StepStarted { job_id, .. }
            | JobEvent::StepCompleted { job_id, .. }
            | JobEvent::StepFailed { job_id, .. }
            | JobEvent::Parked { job_id, .. }
            | JobEvent::Completed { job_id }
            | JobEvent::Failed { job_id, .. }
            | JobEvent::Cancelled { job_id } => *job_id,
        }
    }
}
