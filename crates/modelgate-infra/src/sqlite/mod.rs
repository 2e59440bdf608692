//! SQLite storage layer.
//!
//! [`SqliteStore`] implements every repository port from `modelgate-core`
//! over one [`DatabasePool`]; each port lives in its own module.

pub mod active;
pub mod event_log;
pub mod execution;
pub mod job;
pub mod pool;
pub mod quota;
pub mod store;

pub use pool::DatabasePool;
pub use quota::{QuotaUsage, SqliteQuotaProvider};
pub use store::SqliteStore;
