//! Pipeline execution with durable, resumable checkpointing.
//!
//! - `definition` -- YAML parsing, validation, recursive discovery
//! - `registry` -- pipelines paired with their step executors
//! - `executor` -- the step executor trait and its type-erased wrapper
//! - `classifier` -- maps step errors to retryable or hard failures
//! - `checkpoint` -- per-step checkpoint persistence
//! - `runner` -- drives an admitted job step by step

pub mod checkpoint;
pub mod classifier;
pub mod definition;
pub mod executor;
pub mod registry;
pub mod runner;
