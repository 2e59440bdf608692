//! Quota provider trait and its object-safe wrapper.

use std::future::Future;
use std::pin::Pin;

use modelgate_types::error::RepositoryError;

/// Per `provider:model` usage accounting.
pub trait QuotaProvider: Send + Sync {
    /// Whether another unit of work may be sent to `provider:model`.
    ///
    /// Pairs without an enabled limit always have capacity.
    fn has_capacity(
        &self,
        provider: &str,
        model: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send;

    /// Record one unit of usage after a successful step.
    fn record_usage(
        &self,
        provider: &str,
        model: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send;
}

impl<T: QuotaProvider> QuotaProvider for std::sync::Arc<T> {
    fn has_capacity(
        &self,
        provider: &str,
        model: &str,
    ) -> impl Future<Output = Result<bool, RepositoryError>> + Send {
        (**self).has_capacity(provider, model)
    }

    fn record_usage(
        &self,
        provider: &str,
        model: &str,
    ) -> impl Future<Output = Result<(), RepositoryError>> + Send {
        (**self).record_usage(provider, model)
    }
}

/// Object-safe version of [`QuotaProvider`] with boxed futures.
pub trait QuotaProviderDyn: Send + Sync {
    fn has_capacity_boxed<'a>(
        &'a self,
        provider: &'a str,
        model: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + 'a>>;

    fn record_usage_boxed<'a>(
        &'a self,
        provider: &'a str,
        model: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>>;
}

impl<T: QuotaProvider> QuotaProviderDyn for T {
    fn has_capacity_boxed<'a>(
        &'a self,
        provider: &'a str,
        model: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool, RepositoryError>> + Send + 'a>> {
        Box::pin(self.has_capacity(provider, model))
    }

    fn record_usage_boxed<'a>(
        &'a self,
        provider: &'a str,
        model: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        Box::pin(self.record_usage(provider, model))
    }
}

/// Type-erased quota provider.
pub struct BoxQuotaProvider {
    inner: Box<dyn QuotaProviderDyn + Send + Sync>,
}

impl BoxQuotaProvider {
    pub fn new<T: QuotaProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub async fn has_capacity(&self, provider: &str, model: &str) -> Result<bool, RepositoryError> {
        self.inner.has_capacity_boxed(provider, model).await
    }

    pub async fn record_usage(&self, provider: &str, model: &str) -> Result<(), RepositoryError> {
        self.inner.record_usage_boxed(provider, model).await
    }
}

impl std::fmt::Debug for BoxQuotaProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxQuotaProvider").finish_non_exhaustive()
    }
}
