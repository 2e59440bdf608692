//! Classified step failures.
//!
//! Every failure that reaches a checkpoint has been through the classifier
//! and is either `Retryable` (transient, resumed by the sweeper) or `Hard`
//! (terminal). Subtypes are closed enums so predicate dispatch is exhaustive.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a retryable failure happened, which decides when it may be resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryableSubtype {
    /// External usage limit hit; resumable once capacity is observed.
    QuotaExceeded,
    /// HTTP 429 equivalent; resumable after `earliest_retry_at`.
    RateLimited,
    /// Transient timeout; always resumable.
    Timeout,
    /// Service or network unavailable; always resumable.
    Unavailable,
    /// Credential rejected; resumable once a valid credential exists.
    InvalidCredential,
    /// Unspecified provider-side error; resumable after backoff.
    GenericApiError,
}

impl RetryableSubtype {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryableSubtype::QuotaExceeded => "quota_exceeded",
            RetryableSubtype::RateLimited => "rate_limited",
            RetryableSubtype::Timeout => "timeout",
            RetryableSubtype::Unavailable => "unavailable",
            RetryableSubtype::InvalidCredential => "invalid_credential",
            RetryableSubtype::GenericApiError => "generic_api_error",
        }
    }
}

impl fmt::Display for RetryableSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a hard failure happened. No amount of waiting fixes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardReason {
    InvalidInput,
    UnsupportedFormat,
    MissingParameter,
    /// Unclassified errors and executor panics.
    Internal,
}

impl HardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            HardReason::InvalidInput => "invalid_input",
            HardReason::UnsupportedFormat => "unsupported_format",
            HardReason::MissingParameter => "missing_parameter",
            HardReason::Internal => "internal",
        }
    }
}

impl fmt::Display for HardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The classification half of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureClass {
    Retryable {
        subtype: RetryableSubtype,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        earliest_retry_at: Option<DateTime<Utc>>,
    },
    Hard {
        reason: HardReason,
    },
}

impl FailureClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureClass::Retryable { .. })
    }
}

/// A classified failure as persisted on a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub class: FailureClass,
    pub message: String,
    /// Model the failing step targeted, for quota checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider the failing step targeted, for credential checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl StepFailure {
    pub fn subtype(&self) -> Option<RetryableSubtype> {
        match &self.class {
            FailureClass::Retryable { subtype, .. } => Some(*subtype),
            FailureClass::Hard { .. } => None,
        }
    }

    pub fn earliest_retry_at(&self) -> Option<DateTime<Utc>> {
        match &self.class {
            FailureClass::Retryable {
                earliest_retry_at, ..
            } => *earliest_retry_at,
            FailureClass::Hard { .. } => None,
        }
    }

    /// Short machine-readable label (`rate_limited`, `invalid_input`, ...).
    pub fn label(&self) -> &'static str {
        match &self.class {
            FailureClass::Retryable { subtype, .. } => subtype.as_str(),
            FailureClass::Hard { reason } => reason.as_str(),
        }
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.label(), self.message)
    }
}
