//! Shared domain types for modelgate.
//!
//! Jobs, admission state, the queue audit log, workflow executions and their
//! checkpoints, classified failures, pipeline definitions and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod admission;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod failure;
pub mod job;
pub mod pipeline;
