//! CLI command definitions for appforge.
//!
//! Four entry points: `bulk` (the main batch path), `single` (one prompt,
//! full container path), `local` (host-side debugging without containers),
//! and the hidden `run-task` executed inside task containers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use crate::agent::AGENT_RUNNER_PATH;
use crate::container::{BuildContext, DockerRuntime, DockerRuntimeConfig, Mount, MountMode};
use crate::generation::{
    print_summary, read_metrics_from_app, write_summary, Backend, BatchGenerator, TaskEntry,
    TaskResult, TaskSpec,
};
use crate::prompts::resolve_prompt_set;

/// Default output directory for generated apps.
const DEFAULT_OUTPUT_DIR: &str = "./app";

/// Default number of concurrently running task containers.
const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Default per-task container timeout, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 1800;

/// Host env vars copied into task containers when set.
const ENV_PASSTHROUGH: &[&str] = &["ANTHROPIC_API_KEY", "OPENROUTER_API_KEY", "DATABASE_URL"];

/// Containerized app-generation orchestrator.
#[derive(Parser)]
#[command(name = "appforge")]
#[command(about = "Fan out AI-agent app-generation tasks into Docker containers")]
#[command(version)]
#[command(
    long_about = "appforge builds one execution image per batch, runs each generation \
task in its own container under a concurrency limit, and harvests artifacts, logs, \
and metrics even when individual agent processes fail.\n\nExample usage:\n  \
appforge bulk --prompts smoke --max-concurrency 4 --output ./app"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Generate a batch of apps in parallel containers.
    Bulk(BulkArgs),

    /// Generate one app through the full container path.
    Single(SingleArgs),

    /// Run a prompt set sequentially on the host, without containers.
    Local(LocalArgs),

    /// In-container task entry point (invoked by the orchestrator).
    #[command(name = "run-task", hide = true)]
    RunTask(RunTaskArgs),
}

/// Arguments shared by all agent-invoking commands.
#[derive(Parser, Debug)]
pub struct AgentArgs {
    /// Agent backend: claude, opencode, or litellm.
    #[arg(short, long, default_value = "claude")]
    pub backend: Backend,

    /// Model name (required for the litellm backend).
    #[arg(short, long)]
    pub model: Option<String>,

    /// Extra argument passed verbatim to the agent (repeatable).
    #[arg(long = "agent-arg", allow_hyphen_values = true)]
    pub agent_args: Vec<String>,

    /// Ask the backend to drop sampling parameters the model rejects
    /// instead of failing the request (litellm only).
    #[arg(long)]
    pub strip_unsupported_params: bool,
}

/// Arguments for `appforge bulk`.
#[derive(Parser, Debug)]
pub struct BulkArgs {
    /// Prompt set: "smoke" or a path to a JSON file of name -> prompt.
    #[arg(short, long, default_value = "smoke")]
    pub prompts: String,

    /// Output directory for artifacts, logs, and the batch summary.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Maximum number of concurrently running task containers.
    #[arg(short = 'c', long, default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub max_concurrency: usize,

    /// Build context directory (must contain a Dockerfile).
    #[arg(long, default_value = ".")]
    pub source: PathBuf,

    /// Per-task container timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Host path of the agent binary mounted for the litellm backend.
    #[arg(long)]
    pub agent_binary: Option<PathBuf>,

    /// Additional host env var copied into containers when set (repeatable).
    #[arg(long = "env")]
    pub env_passthrough: Vec<String>,

    #[command(flatten)]
    pub agent: AgentArgs,
}

/// Arguments for `appforge single`.
#[derive(Parser, Debug)]
pub struct SingleArgs {
    /// Prompt describing what to build.
    pub prompt: String,

    /// App name; defaults to a timestamp-based name.
    #[arg(short = 'n', long)]
    pub app_name: Option<String>,

    /// Output directory for the artifact and log.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    /// Build context directory (must contain a Dockerfile).
    #[arg(long, default_value = ".")]
    pub source: PathBuf,

    /// Per-task container timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Host path of the agent binary mounted for the litellm backend.
    #[arg(long)]
    pub agent_binary: Option<PathBuf>,

    /// Additional host env var copied into containers when set (repeatable).
    #[arg(long = "env")]
    pub env_passthrough: Vec<String>,

    #[command(flatten)]
    pub agent: AgentArgs,
}

/// Arguments for `appforge local`.
#[derive(Parser, Debug)]
pub struct LocalArgs {
    /// Prompt set: "smoke" or a path to a JSON file of name -> prompt.
    #[arg(short, long, default_value = "smoke")]
    pub prompts: String,

    /// Output directory for generated apps.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_DIR)]
    pub output: PathBuf,

    #[command(flatten)]
    pub agent: AgentArgs,
}

/// Arguments for the hidden `appforge run-task`.
#[derive(Parser, Debug)]
pub struct RunTaskArgs {
    /// Task name; the expected artifact directory name.
    #[arg(long)]
    pub name: String,

    /// Prompt describing what to build.
    #[arg(long)]
    pub prompt: String,

    /// Directory the agent writes its app under.
    #[arg(long, default_value = "/workspace")]
    pub output_dir: PathBuf,

    #[command(flatten)]
    pub agent: AgentArgs,
}

/// Parse CLI arguments without running a command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the corresponding command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Bulk(args) => run_bulk_command(args).await,
        Commands::Single(args) => run_single_command(args).await,
        Commands::Local(args) => run_local_command(args).await,
        Commands::RunTask(args) => run_task_command(args).await,
    }
}

async fn run_bulk_command(args: BulkArgs) -> anyhow::Result<()> {
    validate_agent_args(&args.agent, args.agent_binary.as_deref())?;

    let prompts = resolve_prompt_set(&args.prompts)?;
    let specs: Vec<TaskSpec> = prompts
        .into_iter()
        .map(|(name, prompt)| task_spec(name, prompt, &args.agent))
        .collect();

    println!("Starting bulk generation for {} prompts", specs.len());
    println!("Prompt set: {}", args.prompts);
    println!("Output dir: {}", args.output.display());

    let context = build_context(
        &args.source,
        args.agent_binary.as_deref(),
        &args.env_passthrough,
    );
    let runtime = docker_runtime(args.timeout_secs)?;
    let generator = BatchGenerator::new(runtime, &args.output);

    generator
        .generate_bulk(specs, &context, args.max_concurrency, None)
        .await?;
    Ok(())
}

async fn run_single_command(args: SingleArgs) -> anyhow::Result<()> {
    validate_agent_args(&args.agent, args.agent_binary.as_deref())?;

    let app_name = args
        .app_name
        .unwrap_or_else(|| format!("app-{}", chrono::Local::now().format("%Y%m%d-%H%M%S")));
    let spec = task_spec(app_name, args.prompt, &args.agent);

    let context = build_context(
        &args.source,
        args.agent_binary.as_deref(),
        &args.env_passthrough,
    );
    let runtime = docker_runtime(args.timeout_secs)?;
    let generator = BatchGenerator::new(runtime, &args.output);

    let result = generator.generate_single(spec, &context).await?;
    match (&result.error, &result.artifact_dir) {
        (Some(error), _) => anyhow::bail!("generation failed: {error}"),
        (None, Some(dir)) => println!("Generation complete: {}", dir.display()),
        (None, None) => {
            println!("No app generated (agent may have answered without creating files)")
        }
    }
    Ok(())
}

/// Sequential host-side generation, for debugging agents without Docker.
async fn run_local_command(args: LocalArgs) -> anyhow::Result<()> {
    validate_agent_args(&args.agent, None)?;

    let prompts = resolve_prompt_set(&args.prompts)?;
    std::fs::create_dir_all(&args.output)?;
    println!(
        "Starting LOCAL generation for {} prompts (no containers)",
        prompts.len()
    );

    let mut results = Vec::with_capacity(prompts.len());
    for (i, (name, prompt)) in prompts.iter().enumerate() {
        println!("[{}/{}] Generating: {name}", i + 1, prompts.len());
        let spec = task_spec(name.clone(), prompt.clone(), &args.agent);
        results.push(run_local_task(&spec, &args.output).await);
    }

    write_summary(&args.output, &results);
    print_summary(&results);
    Ok(())
}

async fn run_local_task(spec: &TaskSpec, output: &Path) -> TaskResult {
    let entry = TaskEntry {
        name: spec.name.clone(),
        prompt: spec.prompt.clone(),
        backend: spec.backend,
        model: spec.model.clone(),
        output_dir: output.to_path_buf(),
        agent_args: spec.extra_args.clone(),
        strip_unsupported_params: spec.strip_unsupported_params,
    };

    let error = entry.run().await.err().map(|e| e.to_string());
    let app_dir = output.join(&spec.name);
    let artifact_dir = (error.is_none() && app_dir.is_dir()).then_some(app_dir);
    let metrics = artifact_dir.as_deref().and_then(read_metrics_from_app);

    TaskResult {
        name: spec.name.clone(),
        prompt: spec.prompt.clone(),
        backend: spec.backend,
        model: spec.model.clone(),
        artifact_dir,
        log_file: None,
        metrics,
        error,
    }
}

async fn run_task_command(args: RunTaskArgs) -> anyhow::Result<()> {
    let entry = TaskEntry {
        name: args.name,
        prompt: args.prompt,
        backend: args.agent.backend,
        model: args.agent.model,
        output_dir: args.output_dir,
        agent_args: args.agent.agent_args,
        strip_unsupported_params: args.agent.strip_unsupported_params,
    };
    entry.run().await
}

fn task_spec(name: String, prompt: String, agent: &AgentArgs) -> TaskSpec {
    let mut spec = TaskSpec::new(name, prompt)
        .with_backend(agent.backend)
        .with_extra_args(agent.agent_args.clone())
        .with_strip_unsupported_params(agent.strip_unsupported_params);
    if let Some(model) = &agent.model {
        spec = spec.with_model(model.clone());
    }
    spec
}

fn validate_agent_args(agent: &AgentArgs, agent_binary: Option<&Path>) -> anyhow::Result<()> {
    if agent.backend.requires_model() && agent.model.is_none() {
        anyhow::bail!("--model is required when using --backend {}", agent.backend);
    }
    if agent.backend == Backend::LiteLlm && agent_binary.is_none() {
        anyhow::bail!("--agent-binary is required for the litellm backend");
    }
    Ok(())
}

/// Assembles the image build context: default excludes, passthrough env,
/// skill-directory mounts when present on the host, and the agent binary
/// mount for the litellm backend.
fn build_context(
    source: &Path,
    agent_binary: Option<&Path>,
    extra_env: &[String],
) -> BuildContext {
    let mut env: Vec<String> = ENV_PASSTHROUGH.iter().map(|s| s.to_string()).collect();
    env.extend(extra_env.iter().cloned());

    let mut context = BuildContext::new(source).with_env_passthrough(env);

    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        context = context
            .with_mount(Mount::new(
                home.join(".claude/skills"),
                "/root/.claude/skills",
                MountMode::Directory,
            ))
            .with_mount(Mount::new(
                home.join(".config/opencode/skills"),
                "/root/.config/opencode/skills",
                MountMode::Directory,
            ));
    }

    if let Some(binary) = agent_binary {
        context = context.with_mount(
            Mount::new(binary, AGENT_RUNNER_PATH, MountMode::File).required(),
        );
    }

    context
}

fn docker_runtime(timeout_secs: u64) -> anyhow::Result<Arc<DockerRuntime>> {
    let config = DockerRuntimeConfig {
        task_timeout: Duration::from_secs(timeout_secs),
        ..DockerRuntimeConfig::default()
    };
    let runtime = DockerRuntime::new(config)?;
    info!("Connected to Docker daemon");
    Ok(Arc::new(runtime))
}
