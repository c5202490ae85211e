//! Splitting a PR diff into the code fix and the test changes.

use serde::{Deserialize, Serialize};

use crate::error::DataIntegrityError;

const DIFF_HEADER: &str = "diff --git ";

/// A PR diff partitioned by file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPatch {
    /// File blocks not touching test paths.
    pub patch: String,
    /// File blocks touching test paths.
    pub test_patch: String,
    pub code_files: Vec<String>,
    pub test_files: Vec<String>,
}

/// Partition `diff` by the test-path heuristic.
///
/// An empty diff yields an empty split; a non-empty diff without any
/// `diff --git` header is malformed.
pub fn split_patch(diff: &str) -> Result<SplitPatch, DataIntegrityError> {
    let mut split = SplitPatch::default();
    if diff.trim().is_empty() {
        return Ok(split);
    }

    let mut current: Option<(String, String)> = None;

    // Lines keep their own terminators so CRLF content survives byte for byte.
    for line in diff.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        if let Some(path) = parse_diff_file_name(content) {
            if let Some((file, block)) = current.take() {
                append_to_partition(&mut split, file, &block);
            }
            current = Some((path, line.to_string()));
            continue;
        }
        if let Some((_, block)) = current.as_mut() {
            block.push_str(line);
        }
    }

    match current {
        Some((file, block)) => append_to_partition(&mut split, file, &block),
        None => {
            return Err(DataIntegrityError::MalformedDiff(
                "no 'diff --git' header found".to_string(),
            ))
        }
    }

    Ok(split)
}

fn append_to_partition(split: &mut SplitPatch, file: String, block: &str) {
    if is_test_path(&file) {
        split.test_patch.push_str(block);
        split.test_files.push(file);
    } else {
        split.patch.push_str(block);
        split.code_files.push(file);
    }
}

/// Destination path of a `diff --git a/<old> b/<new>` header line.
pub fn parse_diff_file_name(line: &str) -> Option<String> {
    let rest = line.strip_prefix(DIFF_HEADER)?;
    if let Some(idx) = rest.rfind(" b/") {
        return Some(rest[idx + 3..].to_string());
    }
    rest.split_whitespace()
        .next()
        .map(|p| p.trim_start_matches("a/").to_string())
}

/// Whether a repository path holds tests.
///
/// Directories named or prefixed `test`, or named `e2e`, `__tests__`,
/// `spec(s)`, count as test trees; file names match `test_*`, `*_test`,
/// `*.test.*`, `*.spec.*`, `conftest.py` and CamelCase `*Test`/`*Tests`.
pub fn is_test_path(path: &str) -> bool {
    let mut components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    let Some(file_name) = components.pop() else {
        return false;
    };

    let dir_is_test = components.iter().any(|dir| {
        let dir = dir.to_lowercase();
        dir.starts_with("test")
            || dir.ends_with("tests")
            || dir.ends_with("_test")
            || dir.ends_with("-test")
            || matches!(dir.as_str(), "e2e" | "__tests__" | "spec" | "specs")
    });
    if dir_is_test {
        return true;
    }

    let stem = file_name.split('.').next().unwrap_or(file_name);
    let lowered = file_name.to_lowercase();
    let lowered_stem = stem.to_lowercase();

    lowered_stem.starts_with("test_")
        || lowered_stem == "test"
        || lowered_stem == "tests"
        || lowered_stem == "conftest"
        || lowered_stem.ends_with("_test")
        || lowered_stem.ends_with("_tests")
        || lowered_stem.ends_with("-test")
        || lowered_stem.ends_with("_spec")
        || lowered.contains(".test.")
        || lowered.contains(".spec.")
        || stem.ends_with("Test")
        || stem.ends_with("Tests")
}

/// Destination paths of every file block, in diff order.
pub fn changed_files(diff: &str) -> Vec<String> {
    diff.lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter_map(parse_diff_file_name)
        .collect()
}

pub fn count_files(diff: &str) -> usize {
    changed_files(diff).len()
}

/// Number of lines in a patch.
pub fn count_lines(patch: &str) -> usize {
    patch.lines().count()
}

/// Added and removed lines, excluding file headers.
pub fn count_line_delta(patch: &str) -> (usize, usize) {
    let mut added = 0usize;
    let mut removed = 0usize;

    for line in patch.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        match line.chars().next() {
            Some('+') => added = added.saturating_add(1),
            Some('-') => removed = removed.saturating_add(1),
            _ => {}
        }
    }

    (added, removed)
}
