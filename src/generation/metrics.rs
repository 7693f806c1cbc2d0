//! Generation metrics: best-effort telemetry written by the agent process.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Well-known metrics file name inside an artifact directory.
pub const METRICS_FILE_NAME: &str = "generation_metrics.json";

/// Usage metrics reported by the agent for one generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    /// Total API cost in USD.
    #[serde(default)]
    pub cost_usd: f64,
    /// Input tokens consumed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Output tokens produced.
    #[serde(default)]
    pub output_tokens: u64,
    /// Number of agent turns.
    #[serde(default)]
    pub turns: u64,
}

/// Reads metrics from `generation_metrics.json` in an artifact directory.
///
/// Metrics are best-effort telemetry, not a correctness gate: an absent file
/// returns `None`, and a malformed file is logged and treated as absent.
pub fn read_metrics_from_app(app_dir: &Path) -> Option<GenerationMetrics> {
    let metrics_file = app_dir.join(METRICS_FILE_NAME);
    if !metrics_file.exists() {
        return None;
    }

    let contents = match std::fs::read_to_string(&metrics_file) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(file = %metrics_file.display(), error = %e, "Failed to read generation metrics");
            return None;
        }
    };

    match serde_json::from_str(&contents) {
        Ok(metrics) => Some(metrics),
        Err(e) => {
            warn!(file = %metrics_file.display(), error = %e, "Failed to parse generation metrics");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_read_metrics_absent_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_metrics_from_app(dir.path()).is_none());
    }

    #[test]
    fn test_read_metrics_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(METRICS_FILE_NAME),
            r#"{"cost_usd": 1.25, "input_tokens": 1000, "output_tokens": 500, "turns": 12}"#,
        )
        .unwrap();

        let metrics = read_metrics_from_app(dir.path()).unwrap();
        assert!((metrics.cost_usd - 1.25).abs() < f64::EPSILON);
        assert_eq!(metrics.input_tokens, 1000);
        assert_eq!(metrics.output_tokens, 500);
        assert_eq!(metrics.turns, 12);
    }

    #[test]
    fn test_read_metrics_missing_fields_default_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(METRICS_FILE_NAME),
            r#"{"cost_usd": 0.5}"#,
        )
        .unwrap();

        let metrics = read_metrics_from_app(dir.path()).unwrap();
        assert_eq!(metrics.input_tokens, 0);
        assert_eq!(metrics.turns, 0);
    }

    #[test]
    fn test_read_metrics_malformed_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(METRICS_FILE_NAME), "not json {").unwrap();
        assert!(read_metrics_from_app(dir.path()).is_none());
    }
}
