//! GitHub access: credential rotation, the REST/GraphQL client and the
//! [`CodeHost`] seam every curation stage talks to.

pub mod client;
pub mod credentials;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
pub mod types;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::FetchError;

pub use client::GitHubClient;
pub use credentials::{CredentialPool, RateLimitSnapshot, TokenLease, TokenState};
#[cfg(any(test, feature = "test-support"))]
pub use memory::InMemoryHost;
pub use types::{
    Issue, IssueComment, IssueRef, PullCommit, PullRequest, RepoSummary, SearchPage, Tag,
};

/// Maximum page size accepted by the GitHub REST API.
pub const MAX_PER_PAGE: u32 = 100;

/// Operations the curation stages need from a code host.
///
/// Implementations own rate limiting and transient retries; an `Err` means
/// the request is given up on for this run.
#[async_trait]
pub trait CodeHost: Send + Sync {
    /// One page of repository search results, sorted by stars descending.
    async fn search_repositories(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, FetchError>;

    /// A single repository by `owner/name`.
    async fn repository(&self, full_name: &str) -> Result<RepoSummary, FetchError>;

    /// Total number of pull requests (any state).
    async fn pull_request_count(&self, repo: &str) -> Result<u64, FetchError>;

    /// Total number of issues (any state, pull requests excluded).
    async fn issue_count(&self, repo: &str) -> Result<u64, FetchError>;

    /// Bytes of code per language.
    async fn languages(&self, repo: &str) -> Result<BTreeMap<String, u64>, FetchError>;

    /// One page of closed pull requests, newest first.
    async fn list_closed_pulls(&self, repo: &str, page: u32)
        -> Result<Vec<PullRequest>, FetchError>;

    async fn pull_commits(&self, repo: &str, number: u64) -> Result<Vec<PullCommit>, FetchError>;

    /// Issues the host itself links as closed by this pull request.
    async fn linked_issues(&self, repo: &str, number: u64) -> Result<Vec<IssueRef>, FetchError>;

    /// Unified diff of the pull request.
    async fn pull_diff(&self, repo: &str, number: u64) -> Result<String, FetchError>;

    /// Merge base of two commits.
    async fn merge_base(&self, repo: &str, base: &str, head: &str) -> Result<String, FetchError>;

    /// The issue, or `None` when it does not exist.
    async fn issue(&self, repo: &str, number: u64) -> Result<Option<Issue>, FetchError>;

    async fn issue_comments(&self, repo: &str, number: u64)
        -> Result<Vec<IssueComment>, FetchError>;

    /// Up to 100 tags, newest tagged commit first.
    async fn tags(&self, repo: &str) -> Result<Vec<Tag>, FetchError>;

    /// Commit date of `sha`, `None` when the commit is unknown.
    async fn commit_date(&self, repo: &str, sha: &str) -> Result<Option<DateTime<Utc>>, FetchError>;
}
