//! Admission, execution and retry logic for model-bound jobs.
//!
//! This crate defines the "ports" (repository and provider traits) that the
//! infrastructure layer implements. It depends only on `modelgate-types` --
//! never on `modelgate-infra` or any database/HTTP crate.

pub mod coordinator;
pub mod event;
pub mod provider;
pub mod repository;
pub mod service;
pub mod sweeper;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;
