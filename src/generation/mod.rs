//! Generation orchestration: task specs, the per-task runner, output
//! normalization, metrics, and the bounded-concurrency batch scheduler.

pub mod metrics;
pub mod normalize;
pub mod runner;
pub mod scheduler;
pub mod spec;
pub mod task_entry;

pub use metrics::{read_metrics_from_app, GenerationMetrics, METRICS_FILE_NAME};
pub use normalize::{reconcile, top_level_dirs};
pub use runner::{RunOutput, TaskRunner};
pub use scheduler::{print_summary, write_summary, BatchGenerator, OnComplete, TaskResult};
pub use spec::{Backend, TaskSpec};
pub use task_entry::TaskEntry;
