//! Readiness predicates for parked jobs, one per failure subtype.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use modelgate_types::error::RepositoryError;
use modelgate_types::failure::{FailureClass, RetryableSubtype, StepFailure};

use crate::provider::{AlwaysAvailable, BoxCredentialProvider, BoxQuotaProvider};

/// Decides whether the condition that parked a job has cleared.
#[derive(Debug, Clone)]
pub struct RetryConditions {
    quota: Arc<BoxQuotaProvider>,
    credentials: Arc<BoxCredentialProvider>,
}

impl Default for RetryConditions {
    fn default() -> Self {
        Self {
            quota: Arc::new(BoxQuotaProvider::new(AlwaysAvailable)),
            credentials: Arc::new(BoxCredentialProvider::new(AlwaysAvailable)),
        }
    }
}

impl RetryConditions {
    pub fn new(quota: Arc<BoxQuotaProvider>, credentials: Arc<BoxCredentialProvider>) -> Self {
        Self { quota, credentials }
    }

    /// Whether a job whose latest failure is `failure` may be resumed at `now`.
    ///
    /// Hard failures are never ready.
    pub async fn is_ready(
        &self,
        failure: &StepFailure,
        now: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let FailureClass::Retryable {
            subtype,
            earliest_retry_at,
        } = &failure.class
        else {
            return Ok(false);
        };
        let elapsed = earliest_retry_at.is_none_or(|at| now >= at);

        match subtype {
            RetryableSubtype::QuotaExceeded => match (&failure.provider, &failure.model) {
                (Some(provider), Some(model)) => self.quota.has_capacity(provider, model).await,
                _ => Ok(elapsed),
            },
            RetryableSubtype::RateLimited | RetryableSubtype::GenericApiError => Ok(elapsed),
            RetryableSubtype::InvalidCredential => match &failure.provider {
                Some(provider) => self.credentials.has_valid_credential(provider).await,
                None => Ok(true),
            },
            RetryableSubtype::Timeout | RetryableSubtype::Unavailable => Ok(true),
        }
    }
}
