//! Business logic services (use cases).
//!
//! Services depend on the repository and provider traits (ports), never on
//! concrete infrastructure.

pub mod engine;

pub use engine::{EngineError, EngineOptions, JobEngine, RecoveryReport};
