//! SWE task curation stages.
//!
//! The pipeline mines real GitHub history into task instances:
//! - Crawl repositories of a language within a star range
//! - Filter them by PR/issue/fork counts and language share
//! - Extract one task per merged PR that closes an issue
//! - Merge per-repository shards into one deduplicated dataset
//! - Judge issue descriptions with an LLM and apply a score threshold
//!
//! Every stage appends JSONL records and keeps its own checkpoint so it can be
//! resumed on its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::github::RepoSummary;

pub mod crawler;
pub mod extractor;
pub mod instance_quality;
pub mod issue_scorer;
pub mod linking;
pub mod merger;
pub mod patch;
pub mod pipeline;
pub mod progress;
pub mod repo_filter;
pub mod shutdown;
pub mod store;
pub mod version;

pub use crawler::{CrawlCursor, CrawlEvent, RepoCrawler, StarRange};
pub use extractor::{ExtractOutcome, ExtractorConfig, SkipReason, TaskExtractor};
pub use instance_quality::{assess_instance, InstanceTier, TierLimits};
pub use issue_scorer::{
    apply_threshold, parse_judge_response, IssueQualityScorer, JudgeVerdict, ScorerConfig,
};
pub use linking::{link_issues, LinkResult, PullSnapshot};
pub use merger::{collect_shards, merge_shards, tier_output_path, MergeReport, TaskMerger};
pub use patch::{split_patch, SplitPatch};
pub use pipeline::{refilter_scores, Pipeline, StagePaths};
pub use progress::{ProgressCounters, ProgressMonitor, ProgressSnapshot, RunSummary};
pub use repo_filter::{
    decide, FilterCriteria, FilterDecision, FilterOutcome, RepoFilter, RepoStats,
};
pub use shutdown::Shutdown;
pub use version::{resolve_version, DEFAULT_VERSION};

/// A crawled repository, enriched in place by the filter stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoRecord {
    pub id: u64,
    pub full_name: String,
    pub star_count: u64,
    pub fork_count: u64,
    pub open_issue_count: u64,
    /// Set by the filter stage.
    #[serde(default)]
    pub pr_count: Option<u64>,
    /// Set by the filter stage.
    #[serde(default)]
    pub issue_count: Option<u64>,
    #[serde(default)]
    pub primary_language: Option<String>,
    /// Share of the repository's bytes written in the target language.
    #[serde(default)]
    pub language_byte_ratio: Option<f64>,
    pub default_branch: String,
}

impl From<RepoSummary> for RepoRecord {
    fn from(summary: RepoSummary) -> Self {
        Self {
            id: summary.id,
            full_name: summary.full_name,
            star_count: summary.stargazers_count,
            fork_count: summary.forks_count,
            open_issue_count: summary.open_issues_count,
            pr_count: None,
            issue_count: None,
            primary_language: summary.language,
            language_byte_ratio: None,
            default_branch: summary.default_branch,
        }
    }
}

/// One SWE task instance: an issue, the PR that fixed it and its tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub instance_id: String,
    pub repo: String,
    pub pull_number: u64,
    /// Ascending and unique; never empty.
    pub issue_numbers: Vec<u64>,
    pub base_commit: String,
    pub created_at: DateTime<Utc>,
    /// Non-test part of the PR diff.
    pub patch: String,
    /// Part of the PR diff touching test paths.
    pub test_patch: String,
    pub problem_statement: String,
    /// Issue discussion from before the first PR commit.
    #[serde(default)]
    pub hints_text: String,
    #[serde(default)]
    pub all_hints_text: String,
    #[serde(default)]
    pub commit_urls: Vec<String>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub tier: InstanceTier,
    /// `major.minor` release the base commit belongs to.
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Outcome of judging a task's issue text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreStatus {
    Scored,
    /// The judge never produced a usable score.
    Unscored,
}

/// A task with its issue quality verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredTaskRecord {
    #[serde(flatten)]
    pub task: TaskRecord,
    /// In `[0, 10]` when `status` is `Scored`.
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub rationale: String,
    pub status: ScoreStatus,
    pub accepted: bool,
}

impl ScoredTaskRecord {
    pub fn scored(task: TaskRecord, score: f64, rationale: String) -> Self {
        Self {
            task,
            quality_score: Some(score),
            rationale,
            status: ScoreStatus::Scored,
            accepted: false,
        }
    }

    pub fn unscored(task: TaskRecord, reason: String) -> Self {
        Self {
            task,
            quality_score: None,
            rationale: reason,
            status: ScoreStatus::Unscored,
            accepted: false,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.task.instance_id
    }
}

/// `owner/repo` + PR number to `owner__repo-number`.
pub fn instance_id(repo: &str, pull_number: u64) -> String {
    format!("{}-{}", repo.replace('/', "__"), pull_number)
}

/// Validate a GitHub repository name (`owner/repo`).
///
/// Both parts must be non-empty, must not start with `.` or `-`, and may
/// only contain alphanumerics, `-`, `_` and `.`. Repository names end up in
/// shard file names, so this also rules out path traversal.
pub fn validate_repo_name(s: &str) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: "repo".to_string(),
        message,
    };
    if s.is_empty() {
        return Err(invalid("repository name is empty".to_string()));
    }
    if s.len() > 256 {
        return Err(invalid(format!(
            "repository name too long ({} chars, max 256)",
            s.len()
        )));
    }
    let parts: Vec<&str> = s.split('/').collect();
    if parts.len() != 2 {
        return Err(invalid(format!(
            "invalid repository name '{}': expected 'owner/repo' format",
            s
        )));
    }
    for part in &parts {
        if part.is_empty() {
            return Err(invalid(format!(
                "invalid repository name '{}': owner and repo must be non-empty",
                s
            )));
        }
        if part.starts_with('.') || part.starts_with('-') {
            return Err(invalid(format!(
                "invalid repository name '{}': parts must not start with '.' or '-'",
                s
            )));
        }
        if let Some(ch) = part
            .chars()
            .find(|ch| !matches!(ch, 'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.'))
        {
            return Err(invalid(format!(
                "invalid character '{}' in repository name '{}'",
                ch, s
            )));
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_id_format() {
        assert_eq!(instance_id("keras-team/keras", 42), "keras-team__keras-42");
    }

    #[test]
    fn test_validate_repo_name() {
        assert!(validate_repo_name("owner/repo").is_ok());
        assert!(validate_repo_name("my-org/my_repo.rs").is_ok());
        assert!(validate_repo_name("").is_err());
        assert!(validate_repo_name("noslash").is_err());
        assert!(validate_repo_name("a/b/c").is_err());
        assert!(validate_repo_name("../etc").is_err());
        assert!(validate_repo_name("owner/repo;rm").is_err());
    }

    #[test]
    fn test_repo_record_from_summary() {
        let summary = RepoSummary {
            id: 7,
            full_name: "a/b".into(),
            stargazers_count: 1200,
            forks_count: 30,
            open_issues_count: 4,
            language: Some("Rust".into()),
            default_branch: "main".into(),
        };
        let record = RepoRecord::from(summary);
        assert_eq!(record.star_count, 1200);
        assert_eq!(record.pr_count, None);
        assert_eq!(record.language_byte_ratio, None);
    }

    #[test]
    fn test_scored_record_flattens_task() {
        let record = ScoredTaskRecord::scored(test_support::task("a/b", 3), 7.0, "clear".into());
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["instance_id"], "a__b-3");
        assert_eq!(value["quality_score"], 7.0);
        assert_eq!(value["status"], "scored");

        let parsed: ScoredTaskRecord = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_task_without_version_defaults() {
        let mut value = serde_json::to_value(test_support::task("a/b", 3)).unwrap();
        value.as_object_mut().unwrap().remove("version");
        let task: TaskRecord = serde_json::from_value(value).unwrap();
        assert_eq!(task.version, DEFAULT_VERSION);
    }
}
