//! Environment variable credential provider.
//!
//! A provider named `acme-ai` has a valid credential when `ACME_AI_API_KEY`
//! is set to a non-empty value. The key itself is never read beyond that
//! check.

use modelgate_core::provider::CredentialProvider;
use modelgate_types::error::RepositoryError;

#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider {
    prefix: Option<String>,
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up `{PREFIX}_{PROVIDER}_API_KEY` instead.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
        }
    }

    /// Environment variable consulted for `provider`.
    pub fn var_name(&self, provider: &str) -> String {
        let provider: String = provider
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        match &self.prefix {
            Some(prefix) => format!("{}_{provider}_API_KEY", prefix.to_uppercase()),
            None => format!("{provider}_API_KEY"),
        }
    }
}

impl CredentialProvider for EnvCredentialProvider {
    async fn has_valid_credential(&self, provider: &str) -> Result<bool, RepositoryError> {
        match std::env::var(self.var_name(provider)) {
            Ok(value) => Ok(!value.trim().is_empty()),
            // Present but not valid Unicode: cannot be a usable key.
            Err(std::env::VarError::NotUnicode(_)) => Ok(false),
            Err(std::env::VarError::NotPresent) => Ok(false),
        }
    }
}
