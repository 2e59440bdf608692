//! Global configuration types for modelgate.
//!
//! `GlobalConfig` represents the top-level `config.toml`. Every section and
//! every field has a default, so an empty file is a valid configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::admission::AdmissionMode;
use crate::failure::RetryableSubtype;

/// Top-level configuration, loaded from `{data_dir}/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub sweeper: SweeperConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Per-model usage limits seeded into the quota store at startup.
    #[serde(default)]
    pub quotas: Vec<QuotaConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub admission_mode: AdmissionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweeperConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// Resumptions allowed before a job is forced to `failed`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Sweeps are skipped while this file exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_flag: Option<PathBuf>,
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    5
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            max_retries: default_max_retries(),
            maintenance_flag: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_step_timeout")]
    pub step_timeout_secs: u64,
}

fn default_step_timeout() -> u64 {
    300
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout(),
        }
    }
}

/// What reconciliation does with a stale running job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Park it as `pending_retry` so the sweeper resumes it.
    #[default]
    Requeue,
    /// Mark it `failed`.
    Fail,
}

impl fmt::Display for ReconcilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcilePolicy::Requeue => write!(f, "requeue"),
            ReconcilePolicy::Fail => write!(f, "fail"),
        }
    }
}

impl FromStr for ReconcilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requeue" => Ok(ReconcilePolicy::Requeue),
            "fail" => Ok(ReconcilePolicy::Fail),
            other => Err(format!("invalid reconcile policy: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// A running job not updated for this long is considered orphaned.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,
    #[serde(default)]
    pub policy: ReconcilePolicy,
}

fn default_stale_after() -> u64 {
    1800
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after(),
            policy: ReconcilePolicy::default(),
        }
    }
}

/// Backoff applied by the classifier when the failure carries no explicit
/// retry-after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_quota_backoff")]
    pub quota_exceeded_secs: u64,
    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limited_secs: u64,
    #[serde(default = "default_timeout_backoff")]
    pub timeout_secs: u64,
    #[serde(default = "default_timeout_backoff")]
    pub unavailable_secs: u64,
    #[serde(default = "default_credential_backoff")]
    pub invalid_credential_secs: u64,
    #[serde(default = "default_generic_backoff")]
    pub generic_api_error_secs: u64,
}

fn default_quota_backoff() -> u64 {
    300
}

fn default_rate_limit_backoff() -> u64 {
    60
}

fn default_timeout_backoff() -> u64 {
    30
}

fn default_credential_backoff() -> u64 {
    120
}

fn default_generic_backoff() -> u64 {
    180
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            quota_exceeded_secs: default_quota_backoff(),
            rate_limited_secs: default_rate_limit_backoff(),
            timeout_secs: default_timeout_backoff(),
            unavailable_secs: default_timeout_backoff(),
            invalid_credential_secs: default_credential_backoff(),
            generic_api_error_secs: default_generic_backoff(),
        }
    }
}

impl BackoffConfig {
    pub fn seconds_for(&self, subtype: RetryableSubtype) -> u64 {
        match subtype {
            RetryableSubtype::QuotaExceeded => self.quota_exceeded_secs,
            RetryableSubtype::RateLimited => self.rate_limited_secs,
            RetryableSubtype::Timeout => self.timeout_secs,
            RetryableSubtype::Unavailable => self.unavailable_secs,
            RetryableSubtype::InvalidCredential => self.invalid_credential_secs,
            RetryableSubtype::GenericApiError => self.generic_api_error_secs,
        }
    }
}

/// A usage limit for one `provider:model` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub provider: String,
    pub model: String,
    pub limit: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}
