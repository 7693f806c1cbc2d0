//! Output-directory reconciliation.
//!
//! The agent process is not guaranteed to name its output directory after
//! the task. This module maps whatever directory the agent actually created
//! back to the expected name by diffing against a pre-run snapshot of the
//! output root and applying heuristic tie-breaking.
//!
//! The heuristic is best-effort by design: with multiple simultaneous
//! ambiguous candidates it can pick the wrong one. That trade-off is
//! deliberate — a false "no app produced" is worse for the downstream
//! evaluation pipeline than an occasional wrong pick, and losing candidates
//! are left in place for manual inspection.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

/// Top-level directories that exist in the workspace before generation
/// (source code and tool state), never artifact candidates.
pub const KNOWN_INFRA_DIRS: &[&str] = &[
    "cli",
    "logs",
    "node_modules",
    ".venv",
    "__pycache__",
    "target",
];

/// Manifest files that mark a directory as a generated project, checked in
/// this order when several candidate directories exist.
pub const PROJECT_MARKERS: &[&str] = &["package.json", "pyproject.toml", "Cargo.toml"];

/// Snapshot of the top-level directory names under `root`.
pub fn top_level_dirs(root: &Path) -> io::Result<BTreeSet<String>> {
    let mut dirs = BTreeSet::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.insert(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(dirs)
}

/// Reconciles the agent's actual output directory with the expected name.
///
/// Returns the path of the (possibly relocated) artifact directory, or
/// `None` when the agent produced nothing. Candidates are new non-empty
/// top-level directories that are neither pre-existing, infrastructure,
/// nor the expected name itself. A single candidate is moved into the
/// expected path (merging with any content already there). Among multiple
/// candidates the winner is the first one carrying a project marker, then
/// the one with the most files, then the lexicographically first; losers
/// stay where they are.
pub fn reconcile(
    output_root: &Path,
    expected_name: &str,
    pre_existing: &BTreeSet<String>,
) -> io::Result<Option<PathBuf>> {
    let expected = output_root.join(expected_name);

    let current = top_level_dirs(output_root)?;
    let mut candidates: Vec<String> = current
        .iter()
        .filter(|name| {
            !pre_existing.contains(*name)
                && !KNOWN_INFRA_DIRS.contains(&name.as_str())
                && name.as_str() != expected_name
        })
        .filter(|name| file_count(&output_root.join(name)) > 0)
        .cloned()
        .collect();
    candidates.sort();

    if candidates.is_empty() {
        // agent used the expected name (or created nothing)
        if expected.is_dir() && file_count(&expected) > 0 {
            return Ok(Some(expected));
        }
        return Ok(None);
    }

    if candidates.len() == 1 {
        return Ok(Some(move_to_expected(
            &output_root.join(&candidates[0]),
            &expected,
            expected_name,
        )?));
    }

    warn!(
        expected = expected_name,
        candidates = ?candidates,
        "Multiple new output directories, resolving heuristically"
    );

    // prefer a candidate with a recognized project manifest
    for marker in PROJECT_MARKERS {
        for name in &candidates {
            if output_root.join(name).join(marker).exists() {
                return Ok(Some(move_to_expected(
                    &output_root.join(name),
                    &expected,
                    expected_name,
                )?));
            }
        }
    }

    // last resort: largest file count, ties broken by the sort above
    let largest = candidates
        .iter()
        .max_by_key(|name| {
            // ties on file count go to the lexicographically first name
            (
                file_count(&output_root.join(name)),
                std::cmp::Reverse(name.as_str()),
            )
        })
        .cloned()
        .unwrap_or_else(|| candidates[0].clone());

    Ok(Some(move_to_expected(
        &output_root.join(&largest),
        &expected,
        expected_name,
    )?))
}

/// Counts files (not directories) under `dir` recursively.
fn file_count(dir: &Path) -> usize {
    walkdir::WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count()
}

/// Moves `actual` into `expected`, merging with any pre-existing content.
fn move_to_expected(actual: &Path, expected: &Path, name: &str) -> io::Result<PathBuf> {
    info!(
        actual = %actual.display(),
        expected = %expected.display(),
        "Agent created '{}' instead of '{}', relocating",
        actual.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        name,
    );
    copy_dir_merge(actual, expected)?;
    std::fs::remove_dir_all(actual)?;
    Ok(expected.to_path_buf())
}

/// Recursively copies `src` into `dest`, merging with existing directories
/// and overwriting existing files.
fn copy_dir_merge(src: &Path, dest: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_merge(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn mkdir_with_file(root: &Path, dir: &str, file: &str) {
        let d = root.join(dir);
        fs::create_dir_all(&d).unwrap();
        fs::write(d.join(file), "content").unwrap();
    }

    #[test]
    fn test_expected_dir_used_directly_when_no_new_dirs() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "widget-3", "main.py");

        let pre = BTreeSet::new();
        // widget-3 is the expected name, so it is not a "new" candidate
        let resolved = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        assert_eq!(resolved, root.path().join("widget-3"));
    }

    #[test]
    fn test_idempotent_when_expected_exists_and_nothing_new() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "widget-3", "main.py");
        let pre = BTreeSet::new();

        let first = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        let second = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        assert_eq!(first, second);
        // no move happened: the file is still in place
        assert!(root.path().join("widget-3/main.py").exists());
    }

    #[test]
    fn test_nothing_produced_returns_none() {
        let root = tempfile::tempdir().unwrap();
        let pre = BTreeSet::new();
        assert!(reconcile(root.path(), "widget-3", &pre).unwrap().is_none());
    }

    #[test]
    fn test_empty_expected_dir_is_no_artifact() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("widget-3")).unwrap();
        let pre = BTreeSet::new();
        assert!(reconcile(root.path(), "widget-3", &pre).unwrap().is_none());
    }

    #[test]
    fn test_single_new_dir_is_relocated() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "my-app", "index.html");
        let pre = BTreeSet::new();

        let resolved = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        assert_eq!(resolved, root.path().join("widget-3"));
        assert!(root.path().join("widget-3/index.html").exists());
        assert!(!root.path().join("my-app").exists());
    }

    #[test]
    fn test_relocation_merges_with_existing_expected_content() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "widget-3", "notes.md");
        mkdir_with_file(root.path(), "my-app", "index.html");
        // expected dir pre-existed, so snapshot contains it
        let mut pre = BTreeSet::new();
        pre.insert("widget-3".to_string());

        let resolved = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        assert_eq!(resolved, root.path().join("widget-3"));
        assert!(root.path().join("widget-3/notes.md").exists());
        assert!(root.path().join("widget-3/index.html").exists());
    }

    #[test]
    fn test_pre_existing_dirs_are_not_candidates() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "old-junk", "x");
        let pre = top_level_dirs(root.path()).unwrap();
        mkdir_with_file(root.path(), "my-app", "index.html");

        let resolved = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        assert_eq!(resolved, root.path().join("widget-3"));
        assert!(root.path().join("old-junk").exists());
    }

    #[test]
    fn test_infrastructure_dirs_are_not_candidates() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "node_modules", "pkg.js");
        mkdir_with_file(root.path(), "__pycache__", "m.pyc");
        let pre = BTreeSet::new();
        assert!(reconcile(root.path(), "widget-3", &pre).unwrap().is_none());
    }

    #[test]
    fn test_empty_new_dirs_are_noise() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("scratch")).unwrap();
        let pre = BTreeSet::new();
        assert!(reconcile(root.path(), "widget-3", &pre).unwrap().is_none());
    }

    #[test]
    fn test_multiple_candidates_prefer_project_marker() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "big-dump", "a.txt");
        fs::write(root.path().join("big-dump/b.txt"), "x").unwrap();
        fs::write(root.path().join("big-dump/c.txt"), "x").unwrap();
        mkdir_with_file(root.path(), "real-app", "package.json");
        let pre = BTreeSet::new();

        let resolved = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        assert_eq!(resolved, root.path().join("widget-3"));
        assert!(root.path().join("widget-3/package.json").exists());
        // loser left untouched for inspection
        assert!(root.path().join("big-dump/a.txt").exists());
    }

    #[test]
    fn test_multiple_candidates_fall_back_to_largest() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "small", "one.txt");
        mkdir_with_file(root.path(), "large", "one.txt");
        fs::write(root.path().join("large/two.txt"), "x").unwrap();
        let pre = BTreeSet::new();

        let resolved = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        assert_eq!(resolved, root.path().join("widget-3"));
        assert!(root.path().join("widget-3/two.txt").exists());
        assert!(root.path().join("small/one.txt").exists());
    }

    #[test]
    fn test_equal_size_tie_breaks_lexicographically() {
        let root = tempfile::tempdir().unwrap();
        mkdir_with_file(root.path(), "bravo", "f.txt");
        mkdir_with_file(root.path(), "alpha", "f.txt");
        let pre = BTreeSet::new();

        let resolved = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
        assert_eq!(resolved, root.path().join("widget-3"));
        // alpha won; bravo untouched
        assert!(!root.path().join("alpha").exists());
        assert!(root.path().join("bravo/f.txt").exists());
    }

    #[test]
    fn test_deterministic_across_equivalent_inputs() {
        for _ in 0..3 {
            let root = tempfile::tempdir().unwrap();
            mkdir_with_file(root.path(), "my-app", "index.html");
            let pre = BTreeSet::new();
            let resolved = reconcile(root.path(), "widget-3", &pre).unwrap().unwrap();
            assert_eq!(resolved.file_name().unwrap(), "widget-3");
        }
    }

    #[test]
    fn test_top_level_dirs_ignores_files() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("summary.json"), "{}").unwrap();
        fs::create_dir(root.path().join("app-1")).unwrap();

        let dirs = top_level_dirs(root.path()).unwrap();
        assert!(dirs.contains("app-1"));
        assert!(!dirs.contains("summary.json"));
    }
}
