//! Status providers backed by the environment.

pub mod credential;

pub use credential::EnvCredentialProvider;
