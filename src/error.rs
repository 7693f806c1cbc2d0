//! Error types for appforge operations.
//!
//! Defines error types for the major subsystems:
//! - Image building (context assembly, mounts, binary probing)
//! - Container execution and artifact export
//! - Agent process invocation
//! - Task-level and batch-level orchestration
//!
//! The taxonomy follows the batch/task split: `BatchError` aborts an entire
//! run and propagates to the caller; `TaskError` is always converted into the
//! `error` field of a `TaskResult` and never crosses the scheduler boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while building the execution image.
///
/// Every variant is batch-fatal: no task can run without the image.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Docker image build failed: {0}")]
    ImageBuild(String),

    #[error("Docker daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Failed to assemble build context from '{path}': {reason}")]
    ContextFailed { path: PathBuf, reason: String },

    #[error("Required mount source '{0}' does not exist on the host")]
    MissingRequiredMount(PathBuf),

    #[error(
        "Binary '{path}' is {format}, but containers run Linux.\n\
         Provide a Linux build (for Go: GOOS=linux GOARCH=amd64 go build ...)."
    )]
    IncompatibleBinary { path: PathBuf, format: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from container execution and artifact export.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Container create/start failed: {0}")]
    StartFailed(String),

    #[error("Container command exited with code {exit_code}")]
    ExecFailed {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    #[error("Container execution timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Path '{0}' does not exist in the container")]
    ExportNotFound(String),

    #[error("Failed to export '{path}' from container: {reason}")]
    ExportFailed { path: String, reason: String },

    #[error("Container session closed: {0}")]
    SessionClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from invoking the agent backend as an external process.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent process exited with code {code}")]
    NonZeroExit { code: i32 },

    #[error("Failed to spawn agent process '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Backend '{backend}' requires {what}")]
    MissingRequirement { backend: String, what: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A task-level error: recorded on the task's result, never aborts siblings.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A batch-fatal error: aborts the whole run, no partial results collected.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("Control-plane session failed: {0}")]
    Session(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_incompatible_binary_names_remediation() {
        let err = BuildError::IncompatibleBinary {
            path: PathBuf::from("/tmp/agent-runner"),
            format: "macOS Mach-O".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("agent-runner"));
        assert!(msg.contains("GOOS=linux"));
    }

    #[test]
    fn test_container_error_export_not_found_display() {
        let err = ContainerError::ExportNotFound("/workspace/app".to_string());
        assert!(err.to_string().contains("/workspace/app"));
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_task_error_wraps_container_error() {
        let err: TaskError = ContainerError::Timeout { seconds: 120 }.into();
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn test_batch_error_wraps_build_error() {
        let err: BatchError = BuildError::ImageBuild("dockerfile syntax".to_string()).into();
        assert!(err.to_string().contains("dockerfile syntax"));
    }
}
