//! Status providers consulted by the runner and the retry sweeper.
//!
//! Quota and credential checks are external collaborators: the core crate
//! only defines the traits and an always-available fallback. Both traits use
//! RPITIT, so each has a `Box*` wrapper for runtime selection.

pub mod credential;
pub mod quota;

pub use credential::{BoxCredentialProvider, CredentialProvider};
pub use quota::{BoxQuotaProvider, QuotaProvider};

use modelgate_types::error::RepositoryError;

/// Provider that never reports exhaustion and accepts every credential.
///
/// Used when no quota store or credential source is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAvailable;

impl QuotaProvider for AlwaysAvailable {
    async fn has_capacity(&self, _provider: &str, _model: &str) -> Result<bool, RepositoryError> {
        Ok(true)
    }

    async fn record_usage(&self, _provider: &str, _model: &str) -> Result<(), RepositoryError> {
        Ok(())
    }
}

impl CredentialProvider for AlwaysAvailable {
    async fn has_valid_credential(&self, _provider: &str) -> Result<bool, RepositoryError> {
        Ok(true)
    }
}
