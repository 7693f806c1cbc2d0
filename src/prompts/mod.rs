//! Prompt sets: named collections of generation prompts.
//!
//! A prompt set is an ordered list of `(name, prompt)` pairs. The built-in
//! `smoke` set exercises the pipeline end to end with small self-contained
//! web apps; larger sets are loaded from JSON files mapping task names to
//! prompts.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

/// Name of the built-in smoke-test prompt set.
pub const SMOKE_SET: &str = "smoke";

/// Returns the built-in smoke set: small web apps that any backend can
/// finish in a few minutes.
pub fn smoke_prompts() -> Vec<(String, String)> {
    [
        (
            "todo-app",
            "Build a simple todo list web app with add, complete, and delete functionality. \
             Use local storage for persistence.",
        ),
        (
            "counter-app",
            "Create a counter app with increment, decrement, and reset buttons. \
             Display the current count prominently.",
        ),
        (
            "color-picker",
            "Build a color picker app that shows RGB, HEX, and HSL values. \
             Include sliders for each color channel.",
        ),
        (
            "timer-app",
            "Create a simple countdown timer with start, pause, and reset buttons. \
             Display time in MM:SS format.",
        ),
        (
            "quote-generator",
            "Build a random quote generator with a 'New Quote' button. \
             Include 10 hardcoded inspirational quotes.",
        ),
    ]
    .into_iter()
    .map(|(name, prompt)| (name.to_string(), prompt.to_string()))
    .collect()
}

/// Loads a prompt set from a JSON file mapping task names to prompts.
///
/// Entries come back sorted by task name so batches are reproducible
/// regardless of the file's key order.
pub fn load_prompt_file(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read prompt file '{}'", path.display()))?;
    let map: BTreeMap<String, String> = serde_json::from_str(&contents)
        .with_context(|| format!("prompt file '{}' is not a JSON object of name -> prompt", path.display()))?;
    anyhow::ensure!(!map.is_empty(), "prompt file '{}' is empty", path.display());
    Ok(map.into_iter().collect())
}

/// Resolves a prompt-set argument: the literal `smoke`, or a path to a
/// JSON prompt file.
pub fn resolve_prompt_set(set: &str) -> Result<Vec<(String, String)>> {
    if set == SMOKE_SET {
        return Ok(smoke_prompts());
    }
    let path = Path::new(set);
    anyhow::ensure!(
        path.exists(),
        "unknown prompt set '{set}' (expected '{SMOKE_SET}' or a path to a JSON file)"
    );
    load_prompt_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoke_set_has_five_unique_names() {
        let prompts = smoke_prompts();
        assert_eq!(prompts.len(), 5);
        let mut names: Vec<&str> = prompts.iter().map(|(n, _)| n.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_load_prompt_file_sorts_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("prompts.json");
        std::fs::write(&file, r#"{"zeta": "build z", "alpha": "build a"}"#).unwrap();

        let prompts = load_prompt_file(&file).unwrap();
        assert_eq!(prompts[0].0, "alpha");
        assert_eq!(prompts[1].0, "zeta");
    }

    #[test]
    fn test_load_prompt_file_rejects_non_object() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("prompts.json");
        std::fs::write(&file, r#"["not", "a", "map"]"#).unwrap();
        assert!(load_prompt_file(&file).is_err());
    }

    #[test]
    fn test_load_prompt_file_rejects_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("prompts.json");
        std::fs::write(&file, "{}").unwrap();
        assert!(load_prompt_file(&file).is_err());
    }

    #[test]
    fn test_resolve_smoke_literal() {
        assert_eq!(resolve_prompt_set("smoke").unwrap().len(), 5);
    }

    #[test]
    fn test_resolve_missing_path_errors() {
        let err = resolve_prompt_set("/nonexistent/prompts.json").unwrap_err();
        assert!(err.to_string().contains("unknown prompt set"));
    }
}
