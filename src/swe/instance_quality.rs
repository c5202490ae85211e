//! Structural quality tiers for extracted task instances.
//!
//! A task is `base` when it has a fix, a test change and a problem statement,
//! and both diffs edit source files of the repository language. Smaller
//! fixes earn `medium` and `high`.

use serde::{Deserialize, Serialize};

use super::patch::{changed_files, count_files, count_lines};

/// Size-based tier of a valid instance. Ordered `Base < Medium < High`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceTier {
    #[default]
    Base,
    Medium,
    High,
}

impl std::fmt::Display for InstanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceTier::Base => "base",
            InstanceTier::Medium => "medium",
            InstanceTier::High => "high",
        };
        f.write_str(name)
    }
}

/// Patch size limits for the upper tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    pub medium_max_lines: usize,
    pub medium_max_files: usize,
    pub high_max_lines: usize,
    pub high_max_files: usize,
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            medium_max_lines: 1000,
            medium_max_files: 10,
            high_max_lines: 500,
            high_max_files: 5,
        }
    }
}

/// Source file extensions per GitHub language name.
pub fn language_extensions(language: &str) -> Option<&'static [&'static str]> {
    let exts: &'static [&'static str] = match language.to_lowercase().as_str() {
        "python" => &[".py"],
        "rust" => &[".rs"],
        "go" => &[".go"],
        "typescript" => &[".ts", ".tsx"],
        "javascript" => &[".js", ".jsx", ".mjs"],
        "java" => &[".java"],
        "c" => &[".c", ".h"],
        "c++" => &[".cpp", ".cc", ".cxx", ".h", ".hpp"],
        "php" => &[".php"],
        "ruby" => &[".rb"],
        _ => return None,
    };
    Some(exts)
}

/// Whether `patch` edits at least one source file of `language`.
///
/// Languages without a known extension list accept any edited file.
pub fn has_code_edited(patch: &str, language: &str) -> bool {
    let mut files = changed_files(patch).into_iter();
    match language_extensions(language) {
        Some(exts) => files.any(|f| exts.iter().any(|ext| f.ends_with(ext))),
        None => files.next().is_some(),
    }
}

/// Highest tier the instance reaches, or `None` if it is not even `base`.
pub fn assess_instance(
    patch: &str,
    test_patch: &str,
    problem_statement: &str,
    language: &str,
    limits: &TierLimits,
) -> Option<InstanceTier> {
    if patch.trim().is_empty() || test_patch.trim().is_empty() || problem_statement.is_empty() {
        return None;
    }
    if !has_code_edited(patch, language) || !has_code_edited(test_patch, language) {
        return None;
    }

    let lines = count_lines(patch);
    let files = count_files(patch);

    if lines > limits.medium_max_lines || files > limits.medium_max_files {
        return Some(InstanceTier::Base);
    }
    if lines > limits.high_max_lines || files > limits.high_max_files {
        return Some(InstanceTier::Medium);
    }
    Some(InstanceTier::High)
}
