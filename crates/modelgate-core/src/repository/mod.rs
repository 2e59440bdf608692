//! Repository trait definitions (ports).
//!
//! These traits define the storage interface that the infrastructure layer
//! (modelgate-infra) implements. The core crate never depends on any
//! specific storage technology.
//!
//! Method names are distinct across traits so a single backend can
//! implement all of them and be used through the [`Store`] bundle without
//! fully-qualified calls.

pub mod active;
pub mod event_log;
pub mod execution;
pub mod job;
pub mod memory;

pub use active::ActiveStateStore;
pub use event_log::EventLog;
pub use execution::ExecutionRepository;
pub use job::{JobFilter, JobRepository};

/// Everything the coordinator, runner and sweeper need from storage.
///
/// Blanket-implemented for any type implementing all four ports.
pub trait Store:
    JobRepository + ActiveStateStore + EventLog + ExecutionRepository + Send + Sync + 'static
{
}

impl<T> Store for T where
    T: JobRepository + ActiveStateStore + EventLog + ExecutionRepository + Send + Sync + 'static
{
}
