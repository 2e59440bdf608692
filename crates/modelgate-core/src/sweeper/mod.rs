//! Asynchronous resumption of parked jobs.

pub mod conditions;
pub mod retry;

pub use conditions::RetryConditions;
pub use retry::{RetrySweeper, SweepError, SweepReport};
