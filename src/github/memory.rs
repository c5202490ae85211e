//! In-memory [`CodeHost`] for tests.
//!
//! Search queries are interpreted the way the crawler builds them
//! (`language:<L> stars:<min>..<max>` or `stars:>=<min>`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{
    Issue, IssueComment, IssueRef, PullCommit, PullRequest, RepoSummary, SearchPage, Tag,
};
use super::CodeHost;
use crate::error::FetchError;

type PullKey = (String, u64);

#[derive(Debug, Default)]
struct HostState {
    repos: Vec<RepoSummary>,
    pr_counts: HashMap<String, u64>,
    issue_counts: HashMap<String, u64>,
    languages: HashMap<String, BTreeMap<String, u64>>,
    pulls: HashMap<String, Vec<PullRequest>>,
    commits: HashMap<PullKey, Vec<PullCommit>>,
    native_links: HashMap<PullKey, Vec<IssueRef>>,
    diffs: HashMap<PullKey, String>,
    merge_bases: HashMap<(String, String), String>,
    issues: HashMap<PullKey, Issue>,
    comments: HashMap<PullKey, Vec<IssueComment>>,
    tags: HashMap<String, Vec<Tag>>,
    commit_dates: HashMap<(String, String), DateTime<Utc>>,
    oversized_queries: HashSet<String>,
    failing_searches: u32,
    failing_repos: HashSet<String>,
    search_queries: Vec<String>,
    request_count: usize,
}

/// Scriptable in-memory code host. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryHost {
    state: Arc<Mutex<HostState>>,
}

impl InMemoryHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_repo(&self, repo: RepoSummary) {
        self.state().repos.push(repo);
    }

    /// PR count, issue count and language byte breakdown of a repository.
    pub fn set_repo_stats(&self, repo: &str, prs: u64, issues: u64, languages: &[(&str, u64)]) {
        let mut state = self.state();
        state.pr_counts.insert(repo.to_string(), prs);
        state.issue_counts.insert(repo.to_string(), issues);
        state.languages.insert(
            repo.to_string(),
            languages
                .iter()
                .map(|(lang, bytes)| (lang.to_string(), *bytes))
                .collect(),
        );
    }

    /// Report more than 1000 results for `query` so the crawler splits it.
    pub fn mark_oversized(&self, query: &str) {
        self.state().oversized_queries.insert(query.to_string());
    }

    /// Fail the next `n` search requests.
    pub fn fail_searches(&self, n: u32) {
        self.state().failing_searches = n;
    }

    /// Fail every per-repository request for `repo`.
    pub fn fail_repo(&self, repo: &str) {
        self.state().failing_repos.insert(repo.to_string());
    }

    pub fn add_pull(&self, repo: &str, pull: PullRequest) {
        self.state()
            .pulls
            .entry(repo.to_string())
            .or_default()
            .push(pull);
    }

    pub fn set_commits(&self, repo: &str, number: u64, commits: Vec<PullCommit>) {
        self.state().commits.insert((repo.to_string(), number), commits);
    }

    pub fn set_native_links(&self, repo: &str, number: u64, links: Vec<IssueRef>) {
        self.state()
            .native_links
            .insert((repo.to_string(), number), links);
    }

    pub fn set_diff(&self, repo: &str, number: u64, diff: &str) {
        self.state()
            .diffs
            .insert((repo.to_string(), number), diff.to_string());
    }

    /// Merge base reported for `head` (defaults to the base sha passed in).
    pub fn set_merge_base(&self, repo: &str, head: &str, merge_base: &str) {
        self.state()
            .merge_bases
            .insert((repo.to_string(), head.to_string()), merge_base.to_string());
    }

    pub fn add_issue(&self, repo: &str, issue: Issue) {
        self.state()
            .issues
            .insert((repo.to_string(), issue.number), issue);
    }

    pub fn set_comments(&self, repo: &str, number: u64, comments: Vec<IssueComment>) {
        self.state()
            .comments
            .insert((repo.to_string(), number), comments);
    }

    /// Tags in the order the host reports them (newest first).
    pub fn set_tags(&self, repo: &str, tags: Vec<Tag>) {
        self.state().tags.insert(repo.to_string(), tags);
    }

    pub fn set_commit_date(&self, repo: &str, sha: &str, date: DateTime<Utc>) {
        self.state()
            .commit_dates
            .insert((repo.to_string(), sha.to_string()), date);
    }

    /// Every search query received so far.
    pub fn search_queries(&self) -> Vec<String> {
        self.state().search_queries.clone()
    }

    /// Number of requests served.
    pub fn request_count(&self) -> usize {
        self.state().request_count
    }

    fn begin_repo_request(&self, repo: &str) -> Result<MutexGuard<'_, HostState>, FetchError> {
        let mut state = self.state();
        state.request_count += 1;
        if state.failing_repos.contains(repo) {
            return Err(FetchError::RetriesExhausted {
                attempts: 5,
                last: format!("simulated outage for {}", repo),
            });
        }
        Ok(state)
    }
}

fn parse_query(query: &str) -> (Option<String>, u64, Option<u64>) {
    let (language_part, stars_part) = match query.rsplit_once(" stars:") {
        Some((lang, stars)) => (lang, stars),
        None => (query, ""),
    };
    let language = language_part
        .strip_prefix("language:")
        .map(|l| l.trim_matches('"').to_string());

    let (min, max) = if let Some(min) = stars_part.strip_prefix(">=") {
        (min.parse().unwrap_or(0), None)
    } else if let Some((min, max)) = stars_part.split_once("..") {
        (min.parse().unwrap_or(0), max.parse().ok())
    } else {
        (0, None)
    };
    (language, min, max)
}

#[async_trait]
impl CodeHost for InMemoryHost {
    async fn search_repositories(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, FetchError> {
        let mut state = self.state();
        state.request_count += 1;
        state.search_queries.push(query.to_string());
        if state.failing_searches > 0 {
            state.failing_searches -= 1;
            return Err(FetchError::RetriesExhausted {
                attempts: 5,
                last: "simulated search outage".to_string(),
            });
        }

        let (language, min, max) = parse_query(query);
        let mut matching: Vec<RepoSummary> = state
            .repos
            .iter()
            .filter(|r| match &language {
                Some(lang) => r
                    .language
                    .as_deref()
                    .is_some_and(|l| l.eq_ignore_ascii_case(lang)),
                None => true,
            })
            .filter(|r| r.stargazers_count >= min && max.map_or(true, |m| r.stargazers_count <= m))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.stargazers_count
                .cmp(&a.stargazers_count)
                .then(a.id.cmp(&b.id))
        });

        let total_count = if state.oversized_queries.contains(query) {
            5000
        } else {
            matching.len() as u64
        };
        let start = (page.saturating_sub(1) * per_page) as usize;
        let items = matching
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .collect();

        Ok(SearchPage {
            total_count,
            incomplete_results: false,
            items,
        })
    }

    async fn repository(&self, full_name: &str) -> Result<RepoSummary, FetchError> {
        let state = self.begin_repo_request(full_name)?;
        state
            .repos
            .iter()
            .find(|r| r.full_name == full_name)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(format!("/repos/{}", full_name)))
    }

    async fn pull_request_count(&self, repo: &str) -> Result<u64, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state.pr_counts.get(repo).copied().unwrap_or(0))
    }

    async fn issue_count(&self, repo: &str) -> Result<u64, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state.issue_counts.get(repo).copied().unwrap_or(0))
    }

    async fn languages(&self, repo: &str) -> Result<BTreeMap<String, u64>, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state.languages.get(repo).cloned().unwrap_or_default())
    }

    async fn list_closed_pulls(
        &self,
        repo: &str,
        page: u32,
    ) -> Result<Vec<PullRequest>, FetchError> {
        let state = self.begin_repo_request(repo)?;
        let mut pulls = state.pulls.get(repo).cloned().unwrap_or_default();
        pulls.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let start = (page.saturating_sub(1) * super::MAX_PER_PAGE) as usize;
        Ok(pulls
            .into_iter()
            .skip(start)
            .take(super::MAX_PER_PAGE as usize)
            .collect())
    }

    async fn pull_commits(&self, repo: &str, number: u64) -> Result<Vec<PullCommit>, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state
            .commits
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn linked_issues(&self, repo: &str, number: u64) -> Result<Vec<IssueRef>, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state
            .native_links
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn pull_diff(&self, repo: &str, number: u64) -> Result<String, FetchError> {
        let state = self.begin_repo_request(repo)?;
        state
            .diffs
            .get(&(repo.to_string(), number))
            .cloned()
            .ok_or_else(|| FetchError::NotFound(format!("/repos/{}/pulls/{}", repo, number)))
    }

    async fn merge_base(&self, repo: &str, base: &str, head: &str) -> Result<String, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state
            .merge_bases
            .get(&(repo.to_string(), head.to_string()))
            .cloned()
            .unwrap_or_else(|| base.to_string()))
    }

    async fn issue(&self, repo: &str, number: u64) -> Result<Option<Issue>, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state.issues.get(&(repo.to_string(), number)).cloned())
    }

    async fn issue_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<IssueComment>, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state
            .comments
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    async fn tags(&self, repo: &str) -> Result<Vec<Tag>, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state.tags.get(repo).cloned().unwrap_or_default())
    }

    async fn commit_date(&self, repo: &str, sha: &str) -> Result<Option<DateTime<Utc>>, FetchError> {
        let state = self.begin_repo_request(repo)?;
        Ok(state
            .commit_dates
            .get(&(repo.to_string(), sha.to_string()))
            .copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(id: u64, name: &str, stars: u64, language: &str) -> RepoSummary {
        RepoSummary {
            id,
            full_name: name.to_string(),
            stargazers_count: stars,
            forks_count: 0,
            open_issues_count: 0,
            language: Some(language.to_string()),
            default_branch: "main".to_string(),
        }
    }

    #[test]
    fn test_parse_query() {
        assert_eq!(
            parse_query("language:Python stars:10..20"),
            (Some("Python".to_string()), 10, Some(20))
        );
        assert_eq!(
            parse_query("language:\"Jupyter Notebook\" stars:>=5"),
            (Some("Jupyter Notebook".to_string()), 5, None)
        );
    }

    #[tokio::test]
    async fn test_search_filters_language_and_range() {
        let host = InMemoryHost::new();
        host.add_repo(repo(1, "a/py", 100, "Python"));
        host.add_repo(repo(2, "a/rs", 100, "Rust"));
        host.add_repo(repo(3, "a/big", 5000, "Python"));

        let page = host
            .search_repositories("language:python stars:50..1000", 1, 100)
            .await
            .unwrap();
        assert_eq!(page.total_count, 1);
        assert_eq!(page.items[0].full_name, "a/py");
    }

    #[tokio::test]
    async fn test_failing_repo() {
        let host = InMemoryHost::new();
        host.fail_repo("a/b");
        assert!(host.pull_request_count("a/b").await.is_err());
        assert_eq!(host.issue_count("c/d").await.unwrap(), 0);
    }
}
