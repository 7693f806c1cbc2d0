//! appforge: containerized app-generation orchestrator.
//!
//! Fans out independent AI coding-agent generation tasks into isolated
//! Docker containers under a bounded concurrency limit, then harvests
//! artifacts, logs, and metrics from each task even when the underlying
//! agent process fails partway.

pub mod agent;
pub mod cli;
pub mod container;
pub mod error;
pub mod generation;
pub mod prompts;

// Re-export commonly used error types
pub use error::{AgentError, BatchError, BuildError, ContainerError, TaskError};
