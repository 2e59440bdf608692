//! Pure mapping from a [`StepError`] to a [`FailureClass`].
//!
//! Retryable failures always carry an `earliest_retry_at`: the
//! server-provided retry-after when there is one, otherwise the configured
//! backoff for the subtype. Anything not recognised is hard.

use std::time::Duration;

use chrono::{DateTime, Utc};
use modelgate_types::config::BackoffConfig;
use modelgate_types::failure::{FailureClass, HardReason, RetryableSubtype};

use super::executor::StepError;

#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    backoff: BackoffConfig,
}

impl ErrorClassifier {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self { backoff }
    }

    pub fn classify(&self, err: &StepError, now: DateTime<Utc>) -> FailureClass {
        match err {
            StepError::Http {
                status,
                retry_after,
                ..
            } => match classify_status(*status) {
                Ok(subtype) => self.retryable(subtype, *retry_after, now),
                Err(reason) => FailureClass::Hard { reason },
            },
            StepError::Transport(_) | StepError::Unavailable(_) => {
                self.retryable(RetryableSubtype::Unavailable, None, now)
            }
            StepError::Timeout(_) => self.retryable(RetryableSubtype::Timeout, None, now),
            StepError::QuotaExceeded(_) => {
                self.retryable(RetryableSubtype::QuotaExceeded, None, now)
            }
            StepError::RateLimited { retry_after, .. } => {
                self.retryable(RetryableSubtype::RateLimited, *retry_after, now)
            }
            StepError::InvalidCredential(_) => {
                self.retryable(RetryableSubtype::InvalidCredential, None, now)
            }
            StepError::InvalidInput(_) => hard(HardReason::InvalidInput),
            StepError::UnsupportedFormat(_) => hard(HardReason::UnsupportedFormat),
            StepError::MissingParameter(_) => hard(HardReason::MissingParameter),
            StepError::Panicked(_) | StepError::Other(_) => hard(HardReason::Internal),
        }
    }

    fn retryable(
        &self,
        subtype: RetryableSubtype,
        retry_after: Option<Duration>,
        now: DateTime<Utc>,
    ) -> FailureClass {
        let delay = retry_after.unwrap_or_else(|| Duration::from_secs(self.backoff.seconds_for(subtype)));
        let earliest_retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d));
        FailureClass::Retryable {
            subtype,
            earliest_retry_at,
        }
    }
}

fn hard(reason: HardReason) -> FailureClass {
    FailureClass::Hard { reason }
}

/// HTTP status to retryable subtype (`Ok`) or hard reason (`Err`).
pub fn classify_status(status: u16) -> Result<RetryableSubtype, HardReason> {
    match status {
        429 => Ok(RetryableSubtype::RateLimited),
        402 => Ok(RetryableSubtype::QuotaExceeded),
        401 | 403 => Ok(RetryableSubtype::InvalidCredential),
        408 | 504 => Ok(RetryableSubtype::Timeout),
        502 | 503 => Ok(RetryableSubtype::Unavailable),
        500..=599 => Ok(RetryableSubtype::GenericApiError),
        415 => Err(HardReason::UnsupportedFormat),
        400..=499 => Err(HardReason::InvalidInput),
        _ => Err(HardReason::Internal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http(status: u16) -> StepError {
        StepError::Http {
            status,
            retry_after: None,
            body: String::new(),
        }
    }

    fn subtype(class: &FailureClass) -> Option<RetryableSubtype> {
        match class {
            FailureClass::Retryable { subtype, .. } => Some(*subtype),
            FailureClass::Hard { .. } => None,
        }
    }

    #[test]
    fn status_table() {
        use RetryableSubtype::*;
        let cases = [
            (429, Ok(RateLimited)),
            (402, Ok(QuotaExceeded)),
            (401, Ok(InvalidCredential)),
            (403, Ok(InvalidCredential)),
            (408, Ok(Timeout)),
            (504, Ok(Timeout)),
            (502, Ok(Unavailable)),
            (503, Ok(Unavailable)),
            (500, Ok(GenericApiError)),
            (599, Ok(GenericApiError)),
            (415, Err(HardReason::UnsupportedFormat)),
            (400, Err(HardReason::InvalidInput)),
            (422, Err(HardReason::InvalidInput)),
            (404, Err(HardReason::InvalidInput)),
            (302, Err(HardReason::Internal)),
        ];
        for (status, expected) in cases {
            assert_eq!(classify_status(status), expected, "status {status}");
        }
    }

    #[test]
    fn rate_limit_honours_server_retry_after() {
        let classifier = ErrorClassifier::default();
        let now = Utc::now();
        let class = classifier.classify(
            &StepError::Http {
                status: 429,
                retry_after: Some(Duration::from_secs(7)),
                body: String::new(),
            },
            now,
        );
        match class {
            FailureClass::Retryable {
                subtype,
                earliest_retry_at,
            } => {
                assert_eq!(subtype, RetryableSubtype::RateLimited);
                assert_eq!(earliest_retry_at, Some(now + chrono::Duration::seconds(7)));
            }
            other => panic!("expected retryable, got {other:?}"),
        }
    }

    #[test]
    fn default_backoff_applies_without_retry_after() {
        let classifier = ErrorClassifier::default();
        let now = Utc::now();
        let FailureClass::Retryable {
            earliest_retry_at, ..
        } = classifier.classify(&http(429), now)
        else {
            panic!("429 must be retryable");
        };
        assert_eq!(earliest_retry_at, Some(now + chrono::Duration::seconds(60)));

        let FailureClass::Retryable {
            earliest_retry_at, ..
        } = classifier.classify(&http(500), now)
        else {
            panic!("500 must be retryable");
        };
        assert_eq!(earliest_retry_at, Some(now + chrono::Duration::seconds(180)));
    }

    #[test]
    fn configured_backoff_overrides_default() {
        let classifier = ErrorClassifier::new(BackoffConfig {
            quota_exceeded_secs: 5,
            ..BackoffConfig::default()
        });
        let now = Utc::now();
        let FailureClass::Retryable {
            earliest_retry_at, ..
        } = classifier.classify(&StepError::QuotaExceeded("out".into()), now)
        else {
            panic!("quota must be retryable");
        };
        assert_eq!(earliest_retry_at, Some(now + chrono::Duration::seconds(5)));
    }

    #[test]
    fn non_http_errors() {
        let classifier = ErrorClassifier::default();
        let now = Utc::now();
        assert_eq!(
            subtype(&classifier.classify(&StepError::Transport("reset".into()), now)),
            Some(RetryableSubtype::Unavailable)
        );
        assert_eq!(
            subtype(&classifier.classify(&StepError::Timeout(Duration::from_secs(1)), now)),
            Some(RetryableSubtype::Timeout)
        );
        assert_eq!(
            classifier.classify(&StepError::MissingParameter("prompt".into()), now),
            FailureClass::Hard {
                reason: HardReason::MissingParameter
            }
        );
    }

    #[test]
    fn unclassified_and_panics_are_hard_internal() {
        let classifier = ErrorClassifier::default();
        let now = Utc::now();
        for err in [
            StepError::Other("boom".into()),
            StepError::Panicked("index out of bounds".into()),
        ] {
            assert_eq!(
                classifier.classify(&err, now),
                FailureClass::Hard {
                    reason: HardReason::Internal
                }
            );
        }
    }
}
