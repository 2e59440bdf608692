//! Active-state store trait definition.

use modelgate_types::admission::ActiveState;
use modelgate_types::error::RepositoryError;

/// Durable single-record holder of the [`ActiveState`].
///
/// Writes are compare-and-swap on `version` so that several coordinators
/// sharing one store never both admit against the same snapshot.
pub trait ActiveStateStore: Send + Sync {
    /// Current state. An empty state with version 0 if nothing was ever written.
    fn load_active(
        &self,
    ) -> impl std::future::Future<Output = Result<ActiveState, RepositoryError>> + Send;

    /// Replace the stored jobs with `next.jobs` if the stored version still
    /// equals `expected_version`, bumping the version by one.
    ///
    /// Returns `false` (and writes nothing) when the version moved.
    fn compare_and_swap_active(
        &self,
        expected_version: u64,
        next: &ActiveState,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
