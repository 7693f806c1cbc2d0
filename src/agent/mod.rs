//! Agent backend invocation.
//!
//! The generation agent is an opaque external process: this module builds
//! the command line for the selected backend, runs it to completion, and
//! extracts whatever usage metrics the backend reports. Everything else
//! about the agent (tools, retries, model routing) is the backend's
//! business.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::unistd::geteuid;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::AgentError;
use crate::generation::metrics::GenerationMetrics;
use crate::generation::spec::Backend;

/// Path where the litellm agent binary is mounted inside the container.
pub const AGENT_RUNNER_PATH: &str = "/usr/local/bin/agent-runner";

/// How workspace pre-setup commands are executed.
///
/// Detected once at startup and injected; never re-checked mid-run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStrategy {
    /// Running as root (the in-container case): setup commands run through
    /// a shell directly.
    DirectShell,
    /// Unprivileged (the local-debugging case): setup is limited to plain
    /// filesystem calls and the agent handles its own permissions.
    AgentMediated,
}

impl ExecStrategy {
    /// Picks the strategy for this process from the effective uid.
    pub fn detect() -> Self {
        if geteuid().is_root() {
            ExecStrategy::DirectShell
        } else {
            ExecStrategy::AgentMediated
        }
    }
}

/// One agent invocation, fully specified.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    /// Prompt describing what to build.
    pub prompt: String,
    /// Task name; the expected artifact directory name.
    pub app_name: String,
    /// Model override (required for the litellm backend).
    pub model: Option<String>,
    /// Directory the agent writes its app under.
    pub output_dir: PathBuf,
    /// Extra arguments appended verbatim to the backend command.
    pub extra_args: Vec<String>,
    /// Ask the backend to drop sampling parameters the target model does
    /// not support instead of failing the request.
    pub strip_unsupported_params: bool,
}

impl AgentRequest {
    pub fn new(
        prompt: impl Into<String>,
        app_name: impl Into<String>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            app_name: app_name.into(),
            model: None,
            output_dir: output_dir.into(),
            extra_args: Vec::new(),
            strip_unsupported_params: false,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_strip_unsupported_params(mut self, strip: bool) -> Self {
        self.strip_unsupported_params = strip;
        self
    }
}

/// Invokes agent backends as subprocesses.
pub struct AgentInvoker {
    strategy: ExecStrategy,
}

impl AgentInvoker {
    pub fn new(strategy: ExecStrategy) -> Self {
        Self { strategy }
    }

    /// Runs the backend to completion.
    ///
    /// Returns the usage metrics the backend reported on stdout, if any.
    /// Backends that write `generation_metrics.json` themselves return
    /// `None` here.
    pub async fn invoke(
        &self,
        backend: Backend,
        request: &AgentRequest,
    ) -> Result<Option<GenerationMetrics>, AgentError> {
        validate_request(backend, request)?;
        self.prepare_workspace(request).await?;

        let (program, args) = backend_command(backend, request);
        info!(backend = %backend, app = %request.app_name, command = %program, "Invoking agent");
        debug!(args = ?args, "Agent command line");

        let output = Command::new(&program)
            .args(&args)
            .current_dir(&request.output_dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AgentError::SpawnFailed {
                command: program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        // re-emit so the container log captures the agent's own output
        if !stdout.is_empty() {
            print!("{stdout}");
        }
        if !stderr.is_empty() {
            eprint!("{stderr}");
        }

        if !output.status.success() {
            return Err(AgentError::NonZeroExit {
                code: output.status.code().unwrap_or(-1),
            });
        }

        Ok(match backend {
            Backend::Claude => parse_claude_metrics(&stdout),
            Backend::OpenCode | Backend::LiteLlm => None,
        })
    }

    /// Ensures the output directory exists before the agent starts.
    async fn prepare_workspace(&self, request: &AgentRequest) -> Result<(), AgentError> {
        match self.strategy {
            ExecStrategy::DirectShell => {
                let dir = request.output_dir.display().to_string();
                let status = Command::new("sh")
                    .arg("-c")
                    .arg(format!("mkdir -p '{dir}' && chmod 777 '{dir}'"))
                    .status()
                    .await
                    .map_err(|e| AgentError::SpawnFailed {
                        command: "sh".to_string(),
                        reason: e.to_string(),
                    })?;
                if !status.success() {
                    warn!(dir = %dir, "Workspace setup command failed, continuing");
                }
            }
            ExecStrategy::AgentMediated => {
                std::fs::create_dir_all(&request.output_dir)?;
            }
        }
        Ok(())
    }
}

fn validate_request(backend: Backend, request: &AgentRequest) -> Result<(), AgentError> {
    if backend.requires_model() && request.model.is_none() {
        return Err(AgentError::MissingRequirement {
            backend: backend.to_string(),
            what: "a model name (--model)".to_string(),
        });
    }
    if backend == Backend::LiteLlm && !Path::new(AGENT_RUNNER_PATH).exists() {
        return Err(AgentError::MissingRequirement {
            backend: backend.to_string(),
            what: format!("an agent binary mounted at {AGENT_RUNNER_PATH}"),
        });
    }
    Ok(())
}

/// Builds the backend command line. Pure.
pub fn backend_command(backend: Backend, request: &AgentRequest) -> (String, Vec<String>) {
    let mut args = Vec::new();
    let program = match backend {
        Backend::Claude => {
            args.push("-p".to_string());
            args.push(request.prompt.clone());
            args.push("--output-format".to_string());
            args.push("json".to_string());
            if let Some(model) = &request.model {
                args.push("--model".to_string());
                args.push(model.clone());
            }
            "claude".to_string()
        }
        Backend::OpenCode => {
            args.push("run".to_string());
            args.push(request.prompt.clone());
            if let Some(model) = &request.model {
                args.push("--model".to_string());
                args.push(model.clone());
            }
            "opencode".to_string()
        }
        Backend::LiteLlm => {
            args.push("--prompt".to_string());
            args.push(request.prompt.clone());
            args.push("--app-name".to_string());
            args.push(request.app_name.clone());
            args.push("--output-dir".to_string());
            args.push(request.output_dir.display().to_string());
            if let Some(model) = &request.model {
                args.push("--model".to_string());
                args.push(model.clone());
            }
            if request.strip_unsupported_params {
                args.push("--strip-unsupported-params".to_string());
            }
            AGENT_RUNNER_PATH.to_string()
        }
    };
    args.extend(request.extra_args.iter().cloned());
    (program, args)
}

/// Parses usage metrics from the Claude CLI's `--output-format json` result.
///
/// The CLI prints a single JSON object on stdout; absent or unparseable
/// output yields `None` (metrics are telemetry, never a failure).
pub fn parse_claude_metrics(stdout: &str) -> Option<GenerationMetrics> {
    let line = stdout.lines().rev().find(|l| l.trim_start().starts_with('{'))?;
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    Some(GenerationMetrics {
        cost_usd: value.get("total_cost_usd").and_then(|v| v.as_f64()).unwrap_or(0.0),
        input_tokens: value
            .pointer("/usage/input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: value
            .pointer("/usage/output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        turns: value.get("num_turns").and_then(|v| v.as_u64()).unwrap_or(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AgentRequest {
        AgentRequest::new("build a todo app", "todo-1", "/workspace")
    }

    #[test]
    fn test_detect_returns_a_strategy() {
        // either variant is valid depending on the test environment
        let _ = ExecStrategy::detect();
    }

    #[test]
    fn test_claude_command_shape() {
        let (program, args) = backend_command(Backend::Claude, &request());
        assert_eq!(program, "claude");
        assert_eq!(args[0], "-p");
        assert_eq!(args[1], "build a todo app");
        assert!(args.windows(2).any(|w| w[0] == "--output-format" && w[1] == "json"));
        assert!(!args.iter().any(|a| a == "--model"));
    }

    #[test]
    fn test_claude_command_with_model() {
        let (_, args) = backend_command(Backend::Claude, &request().with_model("opus"));
        assert!(args.windows(2).any(|w| w[0] == "--model" && w[1] == "opus"));
    }

    #[test]
    fn test_opencode_command_shape() {
        let (program, args) = backend_command(Backend::OpenCode, &request());
        assert_eq!(program, "opencode");
        assert_eq!(args[0], "run");
        assert_eq!(args[1], "build a todo app");
    }

    #[test]
    fn test_litellm_command_carries_strip_flag() {
        let req = request()
            .with_model("gemini/gemini-2.5-pro")
            .with_strip_unsupported_params(true);
        let (program, args) = backend_command(Backend::LiteLlm, &req);
        assert_eq!(program, AGENT_RUNNER_PATH);
        assert!(args.iter().any(|a| a == "--strip-unsupported-params"));
        assert!(args.windows(2).any(|w| w[0] == "--app-name" && w[1] == "todo-1"));
    }

    #[test]
    fn test_litellm_without_strip_flag() {
        let req = request().with_model("m");
        let (_, args) = backend_command(Backend::LiteLlm, &req);
        assert!(!args.iter().any(|a| a == "--strip-unsupported-params"));
    }

    #[test]
    fn test_extra_args_appended_last() {
        let req = request().with_extra_args(vec!["--verbose".to_string()]);
        let (_, args) = backend_command(Backend::Claude, &req);
        assert_eq!(args.last().unwrap(), "--verbose");
    }

    #[test]
    fn test_litellm_requires_model() {
        let err = validate_request(Backend::LiteLlm, &request()).unwrap_err();
        assert!(err.to_string().contains("model"));
    }

    #[test]
    fn test_claude_needs_no_model() {
        assert!(validate_request(Backend::Claude, &request()).is_ok());
    }

    #[test]
    fn test_parse_claude_metrics_full() {
        let stdout = concat!(
            "some progress output\n",
            r#"{"type":"result","total_cost_usd":0.42,"num_turns":7,"usage":{"input_tokens":1200,"output_tokens":800}}"#,
            "\n"
        );
        let metrics = parse_claude_metrics(stdout).unwrap();
        assert!((metrics.cost_usd - 0.42).abs() < f64::EPSILON);
        assert_eq!(metrics.input_tokens, 1200);
        assert_eq!(metrics.output_tokens, 800);
        assert_eq!(metrics.turns, 7);
    }

    #[test]
    fn test_parse_claude_metrics_missing_fields_default() {
        let metrics = parse_claude_metrics(r#"{"type":"result"}"#).unwrap();
        assert_eq!(metrics.turns, 0);
        assert_eq!(metrics.cost_usd, 0.0);
    }

    #[test]
    fn test_parse_claude_metrics_non_json_is_none() {
        assert!(parse_claude_metrics("plain text output").is_none());
        assert!(parse_claude_metrics("").is_none());
    }
}
