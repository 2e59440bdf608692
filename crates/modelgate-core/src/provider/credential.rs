//! Credential provider trait and its object-safe wrapper.

use std::future::Future;
use std::pin::Pin;

use modelgate_types::error::RepositoryError;

/// Answers whether a usable credential exists for a provider.
pub trait CredentialProvider: Send + Sync {
    fn has_valid_credential(
        &self,
        provider: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;
}

impl<T: CredentialProvider> CredentialProvider for std::sync::Arc<T> {
    fn has_valid_credential(
        &self,
        provider: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send {
        (**self).has_valid_credential(provider)
    }
}

/// Object-safe version of [`CredentialProvider`] with boxed futures.
pub trait CredentialProviderDyn: Send + Sync {
    fn has_valid_credential_boxed<'a>(
        &'a self,
        provider: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + 'a>>;
}

impl<T: CredentialProvider> CredentialProviderDyn for T {
    fn has_valid_credential_boxed<'a>(
        &'a self,
        provider: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + 'a>> {
        Box::pin(self.has_valid_credential(provider))
    }
}

/// Type-erased credential provider.
pub struct BoxCredentialProvider {
    inner: Box<dyn CredentialProviderDyn + Send + Sync>,
}

impl BoxCredentialProvider {
    pub fn new<T: CredentialProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub async fn has_valid_credential(&self, provider: &str) -> Result<bool, RepositoryError> {
        self.inner.has_valid_credential_boxed(provider).await
    }
}

impl std::fmt::Debug for BoxCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxCredentialProvider").finish_non_exhaustive()
    }
}
