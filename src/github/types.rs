//! Wire types for the subset of the GitHub REST and GraphQL APIs we use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One page of `GET /search/repositories`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SearchPage {
    #[serde(default)]
    pub total_count: u64,
    #[serde(default)]
    pub incomplete_results: bool,
    #[serde(default)]
    pub items: Vec<RepoSummary>,
}

/// Repository fields returned by search and `GET /repos/{owner}/{repo}`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RepoSummary {
    pub id: u64,
    pub full_name: String,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub open_issues_count: u64,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Response of the count-only search used for PR and issue totals.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchCount {
    #[serde(default)]
    pub total_count: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GitRef {
    pub sha: String,
    #[serde(rename = "ref", default)]
    pub ref_name: String,
}

/// Pull request as listed by `GET /repos/{owner}/{repo}/pulls`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PullRequest {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub state: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merge_commit_sha: Option<String>,
    pub base: GitRef,
    pub head: GitRef,
}

impl PullRequest {
    pub fn is_merged(&self) -> bool {
        self.merged_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommitAuthor {
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommitDetail {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: Option<CommitAuthor>,
    #[serde(default)]
    pub committer: Option<CommitAuthor>,
}

/// Entry of `GET /repos/{owner}/{repo}/pulls/{n}/commits`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PullCommit {
    pub sha: String,
    #[serde(default)]
    pub html_url: String,
    pub commit: CommitDetail,
}

impl PullCommit {
    /// Commit timestamp, preferring the committer date.
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.commit
            .committer
            .as_ref()
            .and_then(|c| c.date)
            .or_else(|| self.commit.author.as_ref().and_then(|a| a.date))
    }
}

/// `GET /repos/{owner}/{repo}/issues/{n}`. Pull requests come back from this
/// endpoint too, with `pull_request` set.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Issue {
    pub number: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

impl Issue {
    pub fn is_pull_request(&self) -> bool {
        self.pull_request.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IssueComment {
    #[serde(default)]
    pub body: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An issue referenced by a pull request, possibly in another repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct IssueRef {
    /// `owner/name` of the repository holding the issue.
    pub repo: String,
    pub number: u64,
}

/// A git tag with the commit it points at.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Tag {
    pub name: String,
    /// Commit sha; annotated tags are peeled to their commit.
    pub sha: String,
    /// Commit date of the tagged commit.
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompareResponse {
    pub merge_base_commit: CompareCommit,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CompareCommit {
    pub sha: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<GraphQlData>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlData {
    pub repository: Option<GraphQlRepository>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphQlRepository {
    pub pull_request: Option<GraphQlPullRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphQlPullRequest {
    pub closing_issues_references: GraphQlConnection,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlConnection {
    #[serde(default)]
    pub nodes: Vec<GraphQlIssueNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GraphQlIssueNode {
    pub number: u64,
    pub repository: GraphQlRepoName,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GraphQlRepoName {
    pub name_with_owner: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsResponse {
    #[serde(default)]
    pub data: Option<TagsData>,
    #[serde(default)]
    pub errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsData {
    pub repository: Option<TagsRepository>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagsRepository {
    pub refs: Option<TagRefs>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagRefs {
    #[serde(default)]
    pub nodes: Vec<TagRefNode>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TagRefNode {
    pub name: String,
    pub target: Option<TagTarget>,
}

/// A ref target: a commit, or an annotated tag wrapping one.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TagTarget {
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub committed_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub target: Option<Box<TagTarget>>,
}

impl TagRefNode {
    pub(crate) fn into_tag(self) -> Option<Tag> {
        let target = self.target?;
        let commit = match target.target {
            Some(inner) => *inner,
            None => target,
        };
        Some(Tag {
            name: self.name,
            sha: commit.oid?,
            date: commit.committed_date,
        })
    }
}
