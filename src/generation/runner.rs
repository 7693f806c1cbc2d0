//! Per-task container runner (host side).
//!
//! Runs one generation command in a fresh container from the batch image,
//! captures its log, and harvests the artifact. Harvesting is deliberately
//! tolerant: the artifact is exported even when the command exited non-zero,
//! and a recovered artifact downgrades the failure to a warning.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::container::{ContainerRun, ContainerRuntime, ExecOutput, ImageHandle};
use crate::error::{ContainerError, TaskError};
use crate::generation::metrics::{read_metrics_from_app, GenerationMetrics};
use crate::generation::spec::TaskSpec;

/// Longest error excerpt carried into task results and logs.
const ERROR_EXCERPT_LEN: usize = 500;

/// What one task run produced.
#[derive(Debug, Clone)]
pub struct RunOutput {
    /// Exported artifact directory on the host, if the agent produced one.
    pub artifact_dir: Option<PathBuf>,
    /// Captured container log.
    pub log_file: PathBuf,
    /// Metrics read from the artifact, if present.
    pub metrics: Option<GenerationMetrics>,
}

/// Runs single tasks against a [`ContainerRuntime`].
pub struct TaskRunner {
    runtime: Arc<dyn ContainerRuntime>,
    output_dir: PathBuf,
}

impl TaskRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            output_dir: output_dir.into(),
        }
    }

    /// Runs one task to completion and harvests its artifact.
    ///
    /// A non-zero container exit only fails the task when no artifact could
    /// be exported; agents routinely crash on teardown after finishing the
    /// actual work.
    pub async fn run(&self, image: &ImageHandle, spec: &TaskSpec) -> Result<RunOutput, TaskError> {
        let cmd = spec.container_command(&image.working_dir);
        let log_file = self.log_path(&spec.name);

        let run = match self.runtime.run_in_container(image, &spec.name, cmd).await {
            Ok(run) => run,
            Err(e) => {
                write_log(&log_file, &format!("=== EXEC ERROR ===\n{e}\n"));
                return Err(e.into());
            }
        };

        let exec_error = exec_failure(&run.output);
        write_log(&log_file, &format_log(&run.output));

        let container_artifact = format!("{}/{}", image.working_dir, spec.name);
        let host_dest = self.output_dir.join(&spec.name);
        let export = self
            .runtime
            .export_directory(&run, &container_artifact, &host_dest)
            .await;

        let artifact_dir = match (export, exec_error) {
            (Ok(()), None) => Some(host_dest),
            (Ok(()), Some(e)) => {
                warn!(
                    task = %spec.name,
                    error = %e,
                    "Artifact exported despite container failure, treating as success"
                );
                Some(host_dest)
            }
            (Err(ContainerError::ExportNotFound(_)), Some(e)) => {
                // no artifact to soften the failure: the exec error is the story
                self.finish(&run).await;
                return Err(e.into());
            }
            (Err(ContainerError::ExportNotFound(path)), None) => {
                warn!(task = %spec.name, path = %path, "Container exited cleanly but left no artifact");
                None
            }
            (Err(e), _) => {
                self.finish(&run).await;
                return Err(e.into());
            }
        };

        self.finish(&run).await;

        let metrics = artifact_dir.as_deref().and_then(read_metrics_from_app);
        if let Some(dir) = &artifact_dir {
            info!(task = %spec.name, artifact = %dir.display(), "Task artifact recovered");
        }

        Ok(RunOutput {
            artifact_dir,
            log_file,
            metrics,
        })
    }

    /// Where a task's log is (or will be) persisted.
    ///
    /// The log survives task failure; callers reporting a failed task should
    /// still point at it when the file exists.
    pub fn log_path(&self, task_name: &str) -> PathBuf {
        self.output_dir.join("logs").join(format!("{task_name}.log"))
    }

    async fn finish(&self, run: &ContainerRun) {
        self.runtime.cleanup(run).await;
    }
}

fn exec_failure(output: &ExecOutput) -> Option<ContainerError> {
    if output.succeeded() {
        return None;
    }
    Some(ContainerError::ExecFailed {
        exit_code: output.exit_code,
        stdout: truncate(&output.stdout, ERROR_EXCERPT_LEN),
        stderr: truncate(&output.stderr, ERROR_EXCERPT_LEN),
    })
}

fn format_log(output: &ExecOutput) -> String {
    format!(
        "{}\n=== STDERR ===\n{}\n=== EXIT CODE: {} ===\n",
        output.stdout, output.stderr, output.exit_code
    )
}

/// Best-effort: a failed log write never fails the task.
fn write_log(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(dir = %parent.display(), error = %e, "Failed to create log directory");
            return;
        }
    }
    if let Err(e) = std::fs::write(path, contents) {
        warn!(file = %path.display(), error = %e, "Failed to write task log");
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &s[..end])
}
