//! In-container task entry point.
//!
//! The batch image carries the `appforge` binary; the host-side runner
//! executes `appforge run-task ...` as the container's main process. This
//! module is that process: snapshot the workspace, hand the prompt to the
//! agent backend, reconcile whatever directory the agent produced, and
//! decide the exit code.

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::agent::{AgentInvoker, AgentRequest, ExecStrategy};
use crate::error::AgentError;
use crate::generation::metrics::{GenerationMetrics, METRICS_FILE_NAME};
use crate::generation::normalize::{reconcile, top_level_dirs};
use crate::generation::spec::Backend;

/// Parameters for one in-container generation run.
#[derive(Debug, Clone)]
pub struct TaskEntry {
    pub name: String,
    pub prompt: String,
    pub backend: Backend,
    pub model: Option<String>,
    pub output_dir: PathBuf,
    pub agent_args: Vec<String>,
    pub strip_unsupported_params: bool,
}

impl TaskEntry {
    /// Runs the generation and returns an error only when the run must be
    /// reported as failed: agent error with no artifact to show for it.
    pub async fn run(self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)?;
        let pre_existing = top_level_dirs(&self.output_dir)?;

        let invoker = AgentInvoker::new(ExecStrategy::detect());
        let mut request = AgentRequest::new(&self.prompt, &self.name, &self.output_dir)
            .with_extra_args(self.agent_args.clone())
            .with_strip_unsupported_params(self.strip_unsupported_params);
        if let Some(model) = &self.model {
            request = request.with_model(model.clone());
        }

        let mut agent_error: Option<AgentError> = None;
        let mut metrics: Option<GenerationMetrics> = None;
        match invoker.invoke(self.backend, &request).await {
            Ok(reported) => metrics = reported,
            Err(e) => agent_error = Some(e),
        }

        let app_dir = reconcile(&self.output_dir, &self.name, &pre_existing)?;

        if let (Some(metrics), Some(app_dir)) = (&metrics, &app_dir) {
            persist_metrics(metrics, app_dir);
        }
        if let Some(metrics) = &metrics {
            info!(task = %self.name, metrics = ?metrics, "Agent reported usage");
        }

        resolve_outcome(&self.name, agent_error, app_dir.as_deref())
    }
}

/// The exit rule: only an agent error with no artifact to show for it
/// fails the run. A clean exit without an artifact means the agent
/// answered without creating files; that is reported, not failed.
fn resolve_outcome(
    task: &str,
    agent_error: Option<AgentError>,
    app_dir: Option<&Path>,
) -> Result<()> {
    match (agent_error, app_dir) {
        (Some(e), Some(app_dir)) => {
            // artifact beats exit status: the agent often dies after
            // finishing its work (teardown crashes, timeout on exit)
            warn!(
                app_dir = %app_dir.display(),
                error = %e,
                "Agent errored but artifact exists, treating as success"
            );
            Ok(())
        }
        (Some(e), None) => {
            error!(task, error = %e, "Agent failed with no artifact");
            Err(e.into())
        }
        (None, Some(app_dir)) => {
            info!(task, app_dir = %app_dir.display(), "Generation complete");
            Ok(())
        }
        (None, None) => {
            warn!(task, "Agent exited cleanly but produced no artifact");
            Ok(())
        }
    }
}

/// Writes agent-reported metrics into the artifact unless the backend
/// already wrote its own file. Best-effort.
fn persist_metrics(metrics: &GenerationMetrics, app_dir: &Path) {
    let file = app_dir.join(METRICS_FILE_NAME);
    if file.exists() {
        return;
    }
    match serde_json::to_string_pretty(metrics) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&file, json) {
                warn!(file = %file.display(), error = %e, "Failed to write metrics file");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize metrics"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::metrics::read_metrics_from_app;

    fn agent_error() -> AgentError {
        AgentError::NonZeroExit { code: 1 }
    }

    #[test]
    fn test_clean_exit_without_artifact_is_success() {
        // the agent may answer a prompt without creating any files; the
        // container must still exit zero so the host records a clean run
        assert!(resolve_outcome("widget-3", None, None).is_ok());
    }

    #[test]
    fn test_clean_exit_with_artifact_is_success() {
        assert!(resolve_outcome("widget-3", None, Some(Path::new("/workspace/widget-3"))).is_ok());
    }

    #[test]
    fn test_agent_error_with_artifact_is_downgraded() {
        let outcome = resolve_outcome(
            "widget-3",
            Some(agent_error()),
            Some(Path::new("/workspace/widget-3")),
        );
        assert!(outcome.is_ok());
    }

    #[test]
    fn test_agent_error_without_artifact_fails() {
        let err = resolve_outcome("widget-3", Some(agent_error()), None).unwrap_err();
        assert!(err.to_string().contains("exited with code 1"));
    }

    #[test]
    fn test_persist_metrics_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = GenerationMetrics {
            cost_usd: 0.1,
            input_tokens: 10,
            output_tokens: 20,
            turns: 3,
        };
        persist_metrics(&metrics, dir.path());
        assert_eq!(read_metrics_from_app(dir.path()), Some(metrics));
    }

    #[test]
    fn test_persist_metrics_never_overwrites_backend_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(METRICS_FILE_NAME),
            r#"{"cost_usd": 9.0, "input_tokens": 1, "output_tokens": 1, "turns": 1}"#,
        )
        .unwrap();

        let metrics = GenerationMetrics::default();
        persist_metrics(&metrics, dir.path());
        let kept = read_metrics_from_app(dir.path()).unwrap();
        assert!((kept.cost_usd - 9.0).abs() < f64::EPSILON);
    }
}
