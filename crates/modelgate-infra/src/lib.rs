//! Infrastructure layer for modelgate.
//!
//! Contains implementations of the traits defined in `modelgate-core`:
//! SQLite storage for jobs, active state, events and checkpoints, the quota
//! table, environment-backed credentials, and the HTTP step executor. Also
//! loads `config.toml` and pipeline definitions from the data directory.

pub mod config;
pub mod executor;
pub mod pipeline;
pub mod provider;
pub mod sqlite;
