//! Bounded-concurrency batch scheduler.
//!
//! Builds the execution image once per batch, fans the task specs out under
//! a semaphore, and collects one [`TaskResult`] per spec no matter how
//! individual tasks fare. Only image-build and control-plane failures abort
//! a batch.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::container::{BuildContext, CacheVolume, ContainerRuntime};
use crate::error::BatchError;
use crate::generation::metrics::GenerationMetrics;
use crate::generation::runner::{RunOutput, TaskRunner};
use crate::generation::spec::{Backend, TaskSpec};

/// Per-task completion callback: `(task_name, success)`.
pub type OnComplete = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Volume key for the shared tool cache. Content-addressed download caches
/// tolerate concurrent writers; the npm store does not and is deliberately
/// absent here (it gets baked into the image at build time instead).
const TOOL_CACHE_KEY: &str = "appforge-tool-cache";
const TOOL_CACHE_PATH: &str = "/root/.cache";

/// Outcome of one task within a batch.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub name: String,
    pub prompt: String,
    pub backend: Backend,
    pub model: Option<String>,
    pub artifact_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub metrics: Option<GenerationMetrics>,
    pub error: Option<String>,
}

impl TaskResult {
    /// A task succeeded when no fatal error was recorded; an artifact may
    /// still be absent if the agent exited cleanly without producing one.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    fn from_run(spec: &TaskSpec, run: RunOutput) -> Self {
        Self {
            name: spec.name.clone(),
            prompt: spec.prompt.clone(),
            backend: spec.backend,
            model: spec.model.clone(),
            artifact_dir: run.artifact_dir,
            log_file: Some(run.log_file),
            metrics: run.metrics,
            error: None,
        }
    }

    fn from_error(
        spec: &TaskSpec,
        error: impl std::fmt::Display,
        log_file: Option<PathBuf>,
    ) -> Self {
        Self {
            name: spec.name.clone(),
            prompt: spec.prompt.clone(),
            backend: spec.backend,
            model: spec.model.clone(),
            artifact_dir: None,
            log_file,
            metrics: None,
            error: Some(error.to_string()),
        }
    }
}

/// Orchestrates whole generation batches.
pub struct BatchGenerator {
    runtime: Arc<dyn ContainerRuntime>,
    output_dir: PathBuf,
}

impl BatchGenerator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            output_dir: output_dir.into(),
        }
    }

    /// Runs one task through the full container path.
    pub async fn generate_single(
        &self,
        spec: TaskSpec,
        context: &BuildContext,
    ) -> Result<TaskResult, BatchError> {
        let mut results = self.generate_bulk(vec![spec], context, 1, None).await?;
        Ok(results.remove(0))
    }

    /// Runs a batch of tasks against one shared image.
    ///
    /// Exactly one result is returned per input spec, in input order. Task
    /// failures land in `TaskResult::error`; only the image build (or a lost
    /// control-plane session) makes this return `Err`.
    pub async fn generate_bulk(
        &self,
        specs: Vec<TaskSpec>,
        context: &BuildContext,
        max_concurrency: usize,
        on_complete: Option<OnComplete>,
    ) -> Result<Vec<TaskResult>, BatchError> {
        info!(
            tasks = specs.len(),
            max_concurrency, "Starting generation batch"
        );

        let image = self.runtime.build_image(context).await?;
        let image = image.with_cache_volume(&CacheVolume::new(TOOL_CACHE_KEY, TOOL_CACHE_PATH));

        std::fs::create_dir_all(&self.output_dir)
            .map_err(|e| BatchError::Session(format!("cannot create output dir: {e}")))?;

        let runner = TaskRunner::new(self.runtime.clone(), &self.output_dir);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        let mut futures = Vec::with_capacity(specs.len());
        for spec in &specs {
            let sem = semaphore.clone();
            let spec = spec.clone();
            let runner = &runner;
            let image = &image;
            let on_complete = on_complete.clone();
            futures.push(async move {
                let _permit = sem.acquire().await.unwrap();
                let result = match runner.run(image, &spec).await {
                    Ok(run) => TaskResult::from_run(&spec, run),
                    Err(e) => {
                        warn!(task = %spec.name, error = %e, "Task failed");
                        // the runner persists the log before erroring
                        let log_file = runner.log_path(&spec.name);
                        TaskResult::from_error(&spec, e, log_file.exists().then_some(log_file))
                    }
                };
                if let Some(callback) = &on_complete {
                    callback(&result.name, result.succeeded());
                }
                result
            });
        }

        let results = futures::future::join_all(futures).await;

        self.runtime.release_image(&image).await;
        write_summary(&self.output_dir, &results);
        print_summary(&results);

        Ok(results)
    }
}

/// Writes `bulk_results_<timestamp>.json`. Best-effort: the results are
/// already in memory, a failed write only loses the file.
pub fn write_summary(output_dir: &std::path::Path, results: &[TaskResult]) {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let path = output_dir.join(format!("bulk_results_{timestamp}.json"));
    let entries: Vec<serde_json::Value> = results.iter().map(summary_entry).collect();

    match serde_json::to_string_pretty(&entries) {
        Ok(json) => {
            if let Err(e) = std::fs::write(&path, json) {
                warn!(file = %path.display(), error = %e, "Failed to write batch summary");
            } else {
                info!(file = %path.display(), "Batch summary written");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize batch summary"),
    }
}

fn summary_entry(result: &TaskResult) -> serde_json::Value {
    serde_json::json!({
        "app_name": result.name,
        "success": result.succeeded(),
        "prompt": result.prompt,
        "app_dir": result.artifact_dir.as_ref().map(|p| p.display().to_string()),
        "error": result.error,
        "backend": result.backend.to_string(),
        "model": result.model,
        "metrics": result.metrics,
    })
}

/// Prints the human-readable batch summary.
pub fn print_summary(results: &[TaskResult]) {
    let succeeded = results.iter().filter(|r| r.succeeded()).count();
    let total_cost: f64 = results
        .iter()
        .filter_map(|r| r.metrics.as_ref())
        .map(|m| m.cost_usd)
        .sum();

    println!();
    println!("Batch complete: {succeeded}/{} succeeded", results.len());
    if total_cost > 0.0 {
        println!("Total reported cost: ${total_cost:.2}");
    }
    for result in results {
        match (&result.error, &result.artifact_dir) {
            (None, Some(dir)) => println!("  ok   {}  ->  {}", result.name, dir.display()),
            (None, None) => println!("  ??   {}  (no artifact)", result.name),
            (Some(error), _) => {
                let first_line = error.lines().next().unwrap_or("unknown error");
                println!("  FAIL {}  {}", result.name, first_line);
            }
        }
    }
    println!();
}
