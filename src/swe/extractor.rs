//! Mining task instances from merged pull requests.
//!
//! Each merged PR that resolves at least one issue of its own repository
//! becomes one [`TaskRecord`]: the issue text as the problem statement, the
//! non-test part of the diff as the reference fix and the test part as the
//! evaluation patch, pinned to the merge base of the PR. The release
//! version comes from the repository's tags, fetched once per repository.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::instance_quality::{assess_instance, InstanceTier, TierLimits};
use super::linking::{link_issues, PullSnapshot};
use super::patch::split_patch;
use super::version::{resolve_version, DEFAULT_VERSION};
use super::{instance_id, TaskRecord};
use crate::config::CurationConfig;
use crate::error::{DataIntegrityError, FetchError};
use crate::github::{CodeHost, Issue, IssueComment, PullCommit, PullRequest, Tag, MAX_PER_PAGE};

/// Safety stop for PR listing (10 000 PRs).
const MAX_PULL_PAGES: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    pub language: String,
    /// PRs created before this date are not mined.
    pub cutoff_date: Option<NaiveDate>,
    /// Only emit instances reaching the `base` tier.
    pub require_test_patch: bool,
    pub limits: TierLimits,
}

impl From<&CurationConfig> for ExtractorConfig {
    fn from(config: &CurationConfig) -> Self {
        Self {
            language: config.language.clone(),
            cutoff_date: config.cutoff_date,
            require_test_patch: config.require_test_patch,
            limits: TierLimits::default(),
        }
    }
}

/// Why a pull request produced no task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum SkipReason {
    NotMerged,
    NoLinkedIssue,
    /// Every linked number was missing or turned out to be a pull request.
    IssueUnresolved,
    EmptyDiff,
    MalformedDiff(String),
    BaseEqualsHead,
    BelowBaseTier,
    FetchFailed(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NotMerged => f.write_str("not merged"),
            SkipReason::NoLinkedIssue => f.write_str("no linked issue"),
            SkipReason::IssueUnresolved => f.write_str("linked issues could not be resolved"),
            SkipReason::EmptyDiff => f.write_str("diff has no code changes"),
            SkipReason::MalformedDiff(detail) => write!(f, "malformed diff: {}", detail),
            SkipReason::BaseEqualsHead => f.write_str("merge base equals PR head"),
            SkipReason::BelowBaseTier => f.write_str("instance below base quality tier"),
            SkipReason::FetchFailed(detail) => write!(f, "fetch failed: {}", detail),
        }
    }
}

impl From<FetchError> for SkipReason {
    fn from(e: FetchError) -> Self {
        SkipReason::FetchFailed(e.to_string())
    }
}

impl From<DataIntegrityError> for SkipReason {
    fn from(e: DataIntegrityError) -> Self {
        match e {
            DataIntegrityError::MalformedDiff(detail) => SkipReason::MalformedDiff(detail),
            DataIntegrityError::BaseCommitEqualsHead(_) => SkipReason::BaseEqualsHead,
            other => SkipReason::MalformedDiff(other.to_string()),
        }
    }
}

/// Everything mined from one repository.
#[derive(Debug, Clone, Default)]
pub struct ExtractOutcome {
    pub repo: String,
    pub tasks: Vec<TaskRecord>,
    /// PR number and the reason it yielded nothing.
    pub skipped: Vec<(u64, SkipReason)>,
}

/// Turns merged PRs of a repository into task records.
pub struct TaskExtractor {
    host: Arc<dyn CodeHost>,
    config: ExtractorConfig,
    tags: Mutex<HashMap<String, Arc<Vec<Tag>>>>,
}

impl TaskExtractor {
    pub fn new(host: Arc<dyn CodeHost>, config: ExtractorConfig) -> Self {
        Self {
            host,
            config,
            tags: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Mine every eligible PR of `repo`.
    ///
    /// Only a failure to list the repository's PRs is an error; problems with
    /// individual PRs are reported in [`ExtractOutcome::skipped`].
    pub async fn extract_repo(&self, repo: &str) -> Result<ExtractOutcome, FetchError> {
        let pulls = self.list_candidate_pulls(repo).await?;
        tracing::info!(repo = %repo, candidates = pulls.len(), "Extracting tasks");

        let mut outcome = ExtractOutcome {
            repo: repo.to_string(),
            ..Default::default()
        };

        for pull in pulls {
            let number = pull.number;
            match self.extract_pull(repo, pull).await {
                Ok(task) => outcome.tasks.push(task),
                Err(reason) => {
                    match &reason {
                        SkipReason::FetchFailed(_) | SkipReason::MalformedDiff(_) | SkipReason::BaseEqualsHead => {
                            tracing::warn!(repo = %repo, pr = number, reason = %reason, "Skipping pull request")
                        }
                        _ => tracing::debug!(repo = %repo, pr = number, reason = %reason, "Skipping pull request"),
                    }
                    outcome.skipped.push((number, reason));
                }
            }
        }

        tracing::info!(
            repo = %repo,
            tasks = outcome.tasks.len(),
            skipped = outcome.skipped.len(),
            "Repository extracted"
        );
        Ok(outcome)
    }

    /// Closed PRs newest first, stopping at the cutoff date.
    async fn list_candidate_pulls(&self, repo: &str) -> Result<Vec<PullRequest>, FetchError> {
        let mut candidates = Vec::new();

        for page in 1..=MAX_PULL_PAGES {
            let pulls = self.host.list_closed_pulls(repo, page).await?;
            let page_len = pulls.len();
            let mut reached_cutoff = false;

            for pull in pulls {
                if self.before_cutoff(pull.created_at) {
                    reached_cutoff = true;
                    break;
                }
                candidates.push(pull);
            }

            if reached_cutoff || page_len < MAX_PER_PAGE as usize {
                break;
            }
        }

        Ok(candidates)
    }

    fn before_cutoff(&self, created_at: DateTime<Utc>) -> bool {
        self.config
            .cutoff_date
            .is_some_and(|cutoff| created_at.date_naive() < cutoff)
    }

    /// Build the task for one PR, or say why there is none.
    pub async fn extract_pull(&self, repo: &str, pull: PullRequest) -> Result<TaskRecord, SkipReason> {
        if !pull.is_merged() {
            return Err(SkipReason::NotMerged);
        }

        let commits = self.host.pull_commits(repo, pull.number).await?;
        let native_links = self.host.linked_issues(repo, pull.number).await?;

        let snapshot = PullSnapshot {
            title: pull.title.clone(),
            body: pull.body.clone().unwrap_or_default(),
            commit_messages: commits.iter().map(|c| c.commit.message.clone()).collect(),
            native_links,
        };
        let links = link_issues(repo, &snapshot);
        if !links.cross_repo.is_empty() {
            tracing::debug!(repo = %repo, pr = pull.number, refs = ?links.cross_repo, "Ignoring cross-repository references");
        }
        if links.is_empty() {
            return Err(SkipReason::NoLinkedIssue);
        }

        let issues = self.resolve_issues(repo, &links.issue_numbers).await?;
        if issues.is_empty() {
            return Err(SkipReason::IssueUnresolved);
        }

        let diff = self.host.pull_diff(repo, pull.number).await?;
        let split = split_patch(&diff)?;
        if split.patch.trim().is_empty() {
            return Err(SkipReason::EmptyDiff);
        }

        let base_commit = self
            .host
            .merge_base(repo, &pull.base.sha, &pull.head.sha)
            .await?;
        if !commits.is_empty() && base_commit == pull.head.sha {
            return Err(DataIntegrityError::BaseCommitEqualsHead(base_commit).into());
        }

        let problem_statement = problem_statement(&issues);

        let tier = match assess_instance(
            &split.patch,
            &split.test_patch,
            &problem_statement,
            &self.config.language,
            &self.config.limits,
        ) {
            Some(tier) => tier,
            None if self.config.require_test_patch => return Err(SkipReason::BelowBaseTier),
            None => InstanceTier::Base,
        };

        let first_commit_at = commits.iter().filter_map(PullCommit::timestamp).min();
        let mut comments = Vec::new();
        for issue in &issues {
            comments.extend(self.host.issue_comments(repo, issue.number).await?);
        }
        let (hints_text, all_hints_text) = hints(&comments, first_commit_at);
        let version = self.version_of(repo, &pull.base.sha).await;

        Ok(TaskRecord {
            instance_id: instance_id(repo, pull.number),
            repo: repo.to_string(),
            pull_number: pull.number,
            issue_numbers: issues.iter().map(|i| i.number).collect(),
            base_commit,
            created_at: pull.created_at,
            patch: split.patch,
            test_patch: split.test_patch,
            problem_statement,
            hints_text,
            all_hints_text,
            commit_urls: commits.into_iter().map(|c| c.html_url).collect(),
            language: self.config.language.clone(),
            tier,
            version,
        })
    }

    /// Tags of `repo`, fetched once. A failed fetch counts as no tags.
    async fn repo_tags(&self, repo: &str) -> Arc<Vec<Tag>> {
        if let Some(tags) = self.lock_tags().get(repo) {
            return tags.clone();
        }
        let tags = match self.host.tags(repo).await {
            Ok(tags) => Arc::new(tags),
            Err(e) => {
                tracing::warn!(repo = %repo, error = %e, "Failed to fetch tags");
                Arc::new(Vec::new())
            }
        };
        self.lock_tags().insert(repo.to_string(), tags.clone());
        tags
    }

    fn lock_tags(&self) -> MutexGuard<'_, HashMap<String, Arc<Vec<Tag>>>> {
        self.tags.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn version_of(&self, repo: &str, sha: &str) -> String {
        let tags = self.repo_tags(repo).await;
        if tags.is_empty() {
            return DEFAULT_VERSION.to_string();
        }
        let commit_date = if tags.iter().any(|t| t.sha == sha) {
            None
        } else {
            self.host.commit_date(repo, sha).await.unwrap_or_else(|e| {
                tracing::debug!(repo = %repo, sha = %sha, error = %e, "Commit date unavailable");
                None
            })
        };
        resolve_version(&tags, sha, commit_date).unwrap_or_else(|| DEFAULT_VERSION.to_string())
    }

    /// Keep the numbers that exist and are real issues, ascending.
    async fn resolve_issues(&self, repo: &str, numbers: &[u64]) -> Result<Vec<Issue>, FetchError> {
        let mut issues = Vec::with_capacity(numbers.len());
        for &number in numbers {
            match self.host.issue(repo, number).await? {
                Some(issue) if !issue.is_pull_request() => issues.push(issue),
                Some(_) => {
                    tracing::debug!(repo = %repo, number, "Linked number is a pull request");
                }
                None => {
                    tracing::debug!(repo = %repo, number, "Linked issue does not exist");
                }
            }
        }
        Ok(issues)
    }
}

/// `"{title}\n{body}\n"` for each issue, in issue order.
pub fn problem_statement(issues: &[Issue]) -> String {
    issues
        .iter()
        .map(|issue| {
            format!(
                "{}\n{}\n",
                issue.title,
                issue.body.as_deref().unwrap_or_default()
            )
        })
        .collect()
}

/// Issue discussion as `(hints_text, all_hints_text)`.
///
/// Hints only include comments last updated before the PR's first commit;
/// with no commit timestamp nothing counts as a hint.
pub fn hints(comments: &[IssueComment], first_commit_at: Option<DateTime<Utc>>) -> (String, String) {
    let body = |c: &IssueComment| c.body.clone().unwrap_or_default();

    let all: Vec<String> = comments.iter().map(body).collect();
    let early: Vec<String> = match first_commit_at {
        Some(at) => comments
            .iter()
            .filter(|c| c.updated_at < at)
            .map(body)
            .collect(),
        None => Vec::new(),
    };
    (early.join("\n"), all.join("\n"))
}
