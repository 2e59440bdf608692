//! Concrete step executors.

pub mod http;

pub use http::{HttpExecutorError, HttpStepExecutor};
