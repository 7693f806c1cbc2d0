//! Task specifications.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Agent backend used to generate an app.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Claude Code CLI (default): skills-based, no extra tooling needed.
    Claude,
    /// OpenCode CLI: skills-based, no extra tooling needed.
    OpenCode,
    /// LiteLLM-routed agent: requires a model name and a mounted agent binary.
    LiteLlm,
}

impl Backend {
    /// Whether this backend requires an explicit model name.
    pub fn requires_model(&self) -> bool {
        matches!(self, Backend::LiteLlm)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Claude => write!(f, "claude"),
            Backend::OpenCode => write!(f, "opencode"),
            Backend::LiteLlm => write!(f, "litellm"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(Backend::Claude),
            "opencode" => Ok(Backend::OpenCode),
            "litellm" => Ok(Backend::LiteLlm),
            other => Err(format!(
                "unknown backend '{other}' (expected claude, opencode, or litellm)"
            )),
        }
    }
}

/// Immutable description of one generation job.
///
/// `name` is unique within a batch and doubles as the expected output
/// directory name for the task's artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name; unique within a batch.
    pub name: String,
    /// Prompt describing what to build.
    pub prompt: String,
    /// Agent backend to invoke.
    pub backend: Backend,
    /// Model name (required for the litellm backend).
    pub model: Option<String>,
    /// Extra arguments appended verbatim to the agent invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Ask the backend to drop sampling parameters the model rejects.
    #[serde(default)]
    pub strip_unsupported_params: bool,
}

impl TaskSpec {
    /// Creates a spec with the default backend and no model override.
    pub fn new(name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prompt: prompt.into(),
            backend: Backend::Claude,
            model: None,
            extra_args: Vec::new(),
            strip_unsupported_params: false,
        }
    }

    /// Sets the backend.
    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    /// Sets the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets extra agent arguments.
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Sets the strip-unsupported-params toggle.
    pub fn with_strip_unsupported_params(mut self, strip: bool) -> Self {
        self.strip_unsupported_params = strip;
        self
    }

    /// Command line for the in-container task entry.
    ///
    /// The built image carries the `appforge` binary (via its Dockerfile);
    /// the host-side runner executes this command inside the container.
    pub fn container_command(&self, output_dir: &str) -> Vec<String> {
        let mut cmd = vec![
            "appforge".to_string(),
            "run-task".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--prompt".to_string(),
            self.prompt.clone(),
            "--backend".to_string(),
            self.backend.to_string(),
            "--output-dir".to_string(),
            output_dir.to_string(),
        ];
        if let Some(model) = &self.model {
            cmd.push("--model".to_string());
            cmd.push(model.clone());
        }
        if self.strip_unsupported_params {
            cmd.push("--strip-unsupported-params".to_string());
        }
        for arg in &self.extra_args {
            cmd.push("--agent-arg".to_string());
            cmd.push(arg.clone());
        }
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_round_trip() {
        for backend in [Backend::Claude, Backend::OpenCode, Backend::LiteLlm] {
            let parsed: Backend = backend.to_string().parse().unwrap();
            assert_eq!(parsed, backend);
        }
    }

    #[test]
    fn test_backend_parse_rejects_unknown() {
        let err = "codegen".parse::<Backend>().unwrap_err();
        assert!(err.contains("codegen"));
    }

    #[test]
    fn test_backend_requires_model() {
        assert!(Backend::LiteLlm.requires_model());
        assert!(!Backend::Claude.requires_model());
        assert!(!Backend::OpenCode.requires_model());
    }

    #[test]
    fn test_container_command_includes_model_when_set() {
        let spec = TaskSpec::new("widget-3", "build a widget")
            .with_backend(Backend::LiteLlm)
            .with_model("gemini/gemini-2.5-pro");
        let cmd = spec.container_command("/workspace");

        assert_eq!(cmd[0], "appforge");
        assert_eq!(cmd[1], "run-task");
        assert!(cmd.windows(2).any(|w| w[0] == "--name" && w[1] == "widget-3"));
        assert!(cmd
            .windows(2)
            .any(|w| w[0] == "--model" && w[1] == "gemini/gemini-2.5-pro"));
    }

    #[test]
    fn test_container_command_omits_model_when_absent() {
        let spec = TaskSpec::new("a", "build X");
        let cmd = spec.container_command("/workspace");
        assert!(!cmd.iter().any(|a| a == "--model"));
        assert!(!cmd.iter().any(|a| a == "--strip-unsupported-params"));
    }

    #[test]
    fn test_container_command_carries_strip_flag() {
        let spec = TaskSpec::new("a", "build X").with_strip_unsupported_params(true);
        let cmd = spec.container_command("/workspace");
        assert!(cmd.iter().any(|a| a == "--strip-unsupported-params"));
    }

    #[test]
    fn test_container_command_preserves_extra_arg_order() {
        let spec = TaskSpec::new("a", "p")
            .with_extra_args(vec!["--first".to_string(), "--second".to_string()]);
        let cmd = spec.container_command("/workspace");
        let positions: Vec<usize> = cmd
            .iter()
            .enumerate()
            .filter(|(_, a)| a.starts_with("--fir") || a.starts_with("--sec"))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(positions.len(), 2);
        assert!(positions[0] < positions[1]);
    }
}
