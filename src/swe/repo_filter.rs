//! Repository admission by activity and language share.
//!
//! For each candidate the PR count, issue count and language breakdown are
//! fetched concurrently; [`decide`] then applies the thresholds without any
//! I/O, so the same stats always produce the same decision.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use super::RepoRecord;
use crate::config::CurationConfig;
use crate::error::FetchError;
use crate::github::CodeHost;

/// Admission thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCriteria {
    pub min_pr: u64,
    pub min_issues: u64,
    pub min_forks: u64,
    pub language: String,
    /// Minimum share of bytes in `language`, in `[0, 1]`.
    pub min_language_ratio: f64,
}

impl From<&CurationConfig> for FilterCriteria {
    fn from(config: &CurationConfig) -> Self {
        Self {
            min_pr: config.min_pr,
            min_issues: config.min_issues,
            min_forks: config.min_forks,
            language: config.language.clone(),
            min_language_ratio: config.min_language_ratio,
        }
    }
}

/// Activity figures fetched for one repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoStats {
    pub pr_count: u64,
    pub issue_count: u64,
    /// Bytes per language.
    pub languages: BTreeMap<String, u64>,
}

impl RepoStats {
    /// Share of bytes written in `language` (case-insensitive); 0 when empty.
    pub fn language_ratio(&self, language: &str) -> f64 {
        let total: u64 = self.languages.values().sum();
        if total == 0 {
            return 0.0;
        }
        let target: u64 = self
            .languages
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(language))
            .map(|(_, bytes)| *bytes)
            .sum();
        target as f64 / total as f64
    }
}

/// Admission decision for one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDecision {
    pub full_name: String,
    pub admitted: bool,
    /// One entry per failed threshold; empty when admitted.
    pub reasons: Vec<String>,
    /// The repository enriched with the fetched figures.
    pub record: RepoRecord,
}

/// Apply `criteria` to a repository and its stats.
pub fn decide(repo: &RepoRecord, stats: &RepoStats, criteria: &FilterCriteria) -> FilterDecision {
    let ratio = stats.language_ratio(&criteria.language);
    let mut reasons = Vec::new();

    if stats.pr_count < criteria.min_pr {
        reasons.push(format!(
            "pr_count {} < min_pr {}",
            stats.pr_count, criteria.min_pr
        ));
    }
    if stats.issue_count < criteria.min_issues {
        reasons.push(format!(
            "issue_count {} < min_issues {}",
            stats.issue_count, criteria.min_issues
        ));
    }
    if repo.fork_count < criteria.min_forks {
        reasons.push(format!(
            "fork_count {} < min_forks {}",
            repo.fork_count, criteria.min_forks
        ));
    }
    if ratio < criteria.min_language_ratio {
        reasons.push(format!(
            "{} share {:.2} < {:.2}",
            criteria.language, ratio, criteria.min_language_ratio
        ));
    }

    let mut record = repo.clone();
    record.pr_count = Some(stats.pr_count);
    record.issue_count = Some(stats.issue_count);
    record.language_byte_ratio = Some(ratio);

    FilterDecision {
        full_name: repo.full_name.clone(),
        admitted: reasons.is_empty(),
        reasons,
        record,
    }
}

/// Result of evaluating one repository.
#[derive(Debug)]
pub enum FilterOutcome {
    Decided(FilterDecision),
    /// Stats could not be fetched; the repository is excluded this run.
    Failed { full_name: String, error: FetchError },
}

/// Concurrent repository filter.
pub struct RepoFilter {
    host: Arc<dyn CodeHost>,
    criteria: FilterCriteria,
    max_workers: usize,
}

impl RepoFilter {
    pub fn new(host: Arc<dyn CodeHost>, criteria: FilterCriteria, max_workers: usize) -> Self {
        Self {
            host,
            criteria,
            max_workers: max_workers.max(1),
        }
    }

    pub fn criteria(&self) -> &FilterCriteria {
        &self.criteria
    }

    /// Fetch PR count, issue count and languages concurrently.
    pub async fn fetch_stats(&self, repo: &str) -> Result<RepoStats, FetchError> {
        let (pr_count, issue_count, languages) = tokio::try_join!(
            self.host.pull_request_count(repo),
            self.host.issue_count(repo),
            self.host.languages(repo),
        )?;
        Ok(RepoStats {
            pr_count,
            issue_count,
            languages,
        })
    }

    pub async fn evaluate(&self, repo: RepoRecord) -> FilterOutcome {
        match self.fetch_stats(&repo.full_name).await {
            Ok(stats) => {
                let decision = decide(&repo, &stats, &self.criteria);
                tracing::debug!(
                    repo = %decision.full_name,
                    admitted = decision.admitted,
                    reasons = ?decision.reasons,
                    "Filter decision"
                );
                FilterOutcome::Decided(decision)
            }
            Err(error) => {
                tracing::warn!(repo = %repo.full_name, error = %error, "Could not fetch repository stats");
                FilterOutcome::Failed {
                    full_name: repo.full_name,
                    error,
                }
            }
        }
    }

    /// Evaluate `repos` with at most `max_workers` repositories in flight.
    /// Outcomes arrive in completion order.
    pub fn filter<'a, S>(&'a self, repos: S) -> impl Stream<Item = FilterOutcome> + 'a
    where
        S: Stream<Item = RepoRecord> + Send + 'a,
    {
        repos
            .map(move |repo| self.evaluate(repo))
            .buffer_unordered(self.max_workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::InMemoryHost;
    use crate::swe::test_support::summary;

    fn criteria() -> FilterCriteria {
        FilterCriteria {
            min_pr: 50,
            min_issues: 50,
            min_forks: 10,
            language: "Python".to_string(),
            min_language_ratio: 0.5,
        }
    }

    fn stats(prs: u64, issues: u64, langs: &[(&str, u64)]) -> RepoStats {
        RepoStats {
            pr_count: prs,
            issue_count: issues,
            languages: langs.iter().map(|(l, b)| (l.to_string(), *b)).collect(),
        }
    }

    #[test]
    fn test_decide_admits_when_all_thresholds_met() {
        let repo = RepoRecord::from(summary(1, "a/b", 2000));
        let decision = decide(&repo, &stats(60, 80, &[("Python", 900), ("Shell", 100)]), &criteria());
        assert!(decision.admitted);
        assert!(decision.reasons.is_empty());
        assert_eq!(decision.record.pr_count, Some(60));
        assert_eq!(decision.record.issue_count, Some(80));
        assert_eq!(decision.record.language_byte_ratio, Some(0.9));
    }

    #[test]
    fn test_decide_reports_every_failed_threshold() {
        let mut repo = RepoRecord::from(summary(1, "a/b", 2000));
        repo.fork_count = 2;
        let decision = decide(&repo, &stats(10, 5, &[("Python", 100), ("C", 900)]), &criteria());
        assert!(!decision.admitted);
        assert_eq!(decision.reasons.len(), 4);
    }

    #[test]
    fn test_language_ratio_is_case_insensitive_and_handles_empty() {
        assert_eq!(stats(0, 0, &[]).language_ratio("Python"), 0.0);
        assert_eq!(stats(0, 0, &[("python", 1), ("Go", 1)]).language_ratio("Python"), 0.5);
    }

    #[test]
    fn test_decide_ratio_boundary_inclusive() {
        let repo = RepoRecord::from(summary(1, "a/b", 2000));
        let decision = decide(&repo, &stats(50, 50, &[("Python", 1), ("Go", 1)]), &criteria());
        assert!(decision.admitted);
    }

    #[tokio::test]
    async fn test_filter_isolates_failing_repo() {
        let host = InMemoryHost::new();
        host.set_repo_stats("o/good", 100, 100, &[("Python", 10)]);
        host.set_repo_stats("o/small", 1, 1, &[("Python", 10)]);
        host.fail_repo("o/down");

        let filter = RepoFilter::new(Arc::new(host), criteria(), 4);
        let repos = vec![
            RepoRecord::from(summary(1, "o/good", 5000)),
            RepoRecord::from(summary(2, "o/down", 4000)),
            RepoRecord::from(summary(3, "o/small", 3000)),
        ];
        let outcomes: Vec<FilterOutcome> = filter.filter(futures::stream::iter(repos)).collect().await;
        assert_eq!(outcomes.len(), 3);

        let mut admitted = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome {
                FilterOutcome::Decided(d) if d.admitted => admitted.push(d.full_name),
                FilterOutcome::Decided(_) => {}
                FilterOutcome::Failed { full_name, .. } => failed.push(full_name),
            }
        }
        assert_eq!(admitted, vec!["o/good"]);
        assert_eq!(failed, vec!["o/down"]);
    }

    #[tokio::test]
    async fn test_decision_is_idempotent() {
        let host = InMemoryHost::new();
        host.set_repo_stats("o/r", 70, 70, &[("Python", 7), ("HTML", 3)]);
        let filter = RepoFilter::new(Arc::new(host), criteria(), 1);
        let repo = RepoRecord::from(summary(1, "o/r", 1500));

        let first = match filter.evaluate(repo.clone()).await {
            FilterOutcome::Decided(d) => d,
            other => panic!("unexpected {:?}", other),
        };
        let second = match filter.evaluate(repo).await {
            FilterOutcome::Decided(d) => d,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(first, second);
    }
}
