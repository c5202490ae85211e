//! REST/GraphQL client for GitHub built on the credential pool.
//!
//! Every request goes through [`GitHubClient::execute`]:
//! - rate-limit responses park the token and retry the same request with
//!   another one, without counting as a failed attempt;
//! - network errors and 5xx responses are retried with exponential backoff
//!   plus jitter, up to `FetchConfig::max_attempts`;
//! - 404/410 become `FetchError::NotFound`, other 4xx fail immediately.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngExt;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use serde_json::json;

use super::credentials::{CredentialPool, RateLimitSnapshot, DEFAULT_RESET_AFTER};
use super::types::{
    CompareResponse, GraphQlResponse, Issue, IssueComment, IssueRef, PullCommit, PullRequest,
    RepoSummary, SearchCount, SearchPage, Tag, TagRefNode, TagsResponse,
};
use super::{CodeHost, MAX_PER_PAGE};
use crate::config::FetchConfig;
use crate::error::FetchError;

const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_DIFF: &str = "application/vnd.github.v3.diff";
const API_VERSION: &str = "2022-11-28";

/// GitHub caps the commit listing of a pull request at 250 entries.
const MAX_COMMIT_PAGES: u32 = 3;

/// Comments beyond this many pages are not worth the quota.
const MAX_COMMENT_PAGES: u32 = 10;

const CLOSING_ISSUES_QUERY: &str = r#"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      closingIssuesReferences(first: 50) {
        nodes { number repository { nameWithOwner } }
      }
    }
  }
}
"#;

const TAGS_QUERY: &str = r#"
query($owner: String!, $name: String!) {
  repository(owner: $owner, name: $name) {
    refs(refPrefix: "refs/tags/", first: 100, orderBy: {field: TAG_COMMIT_DATE, direction: DESC}) {
      nodes {
        name
        target {
          oid
          ... on Commit { committedDate }
          ... on Tag { target { oid ... on Commit { committedDate } } }
        }
      }
    }
  }
}
"#;

/// GitHub API client that rotates through a [`CredentialPool`].
#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    pool: CredentialPool,
    config: FetchConfig,
    user_agent: String,
}

impl GitHubClient {
    pub fn new(pool: CredentialPool, config: FetchConfig) -> Self {
        let http = Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            http,
            pool,
            config,
            user_agent: format!("swe-curator/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), path)
    }

    /// Send one logical request and return the response body.
    async fn execute(
        &self,
        method: Method,
        url: &str,
        accept: &str,
        body: Option<&serde_json::Value>,
    ) -> Result<String, FetchError> {
        let mut failures = 0u32;

        loop {
            let lease = self.pool.acquire().await;

            let mut request = self
                .http
                .request(method.clone(), url)
                .header("Accept", accept)
                .header("X-GitHub-Api-Version", API_VERSION)
                .header("User-Agent", &self.user_agent)
                .header("Authorization", format!("Bearer {}", lease.token()));
            if let Some(body) = body {
                request = request.json(body);
            }

            let last_error = match request.send().await {
                Err(e) => {
                    self.pool.release_unchanged(lease);
                    FetchError::Network(e.to_string())
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let (snapshot, retry_after) =
                        rate_limit_from_headers(response.headers(), chrono::Utc::now().timestamp());
                    let text = match response.text().await {
                        Ok(text) => text,
                        Err(e) => {
                            self.pool.release(lease, snapshot);
                            failures += 1;
                            self.backoff_or_give_up(failures, FetchError::Network(e.to_string()))
                                .await?;
                            continue;
                        }
                    };

                    if is_rate_limited(status, &snapshot, retry_after, &text) {
                        let reset_after = retry_after
                            .or(snapshot.reset_after)
                            .unwrap_or(DEFAULT_RESET_AFTER);
                        tracing::warn!(
                            token = %lease.masked(),
                            status,
                            reset_secs = reset_after.as_secs(),
                            url,
                            "GitHub rate limit hit, rotating token"
                        );
                        self.pool.release_exhausted(lease, reset_after);
                        continue;
                    }

                    self.pool.release(lease, snapshot);

                    match status {
                        200..=299 => return Ok(text),
                        404 | 410 => return Err(FetchError::NotFound(url.to_string())),
                        500..=599 => FetchError::Server {
                            status,
                            message: truncate(&text, 200),
                        },
                        _ => {
                            return Err(FetchError::Status {
                                status,
                                url: url.to_string(),
                                message: truncate(&text, 200),
                            })
                        }
                    }
                }
            };

            failures += 1;
            self.backoff_or_give_up(failures, last_error).await?;
        }
    }

    /// Sleep before the next attempt, or fail once attempts are used up.
    async fn backoff_or_give_up(&self, failures: u32, error: FetchError) -> Result<(), FetchError> {
        if failures >= self.config.max_attempts {
            return Err(FetchError::RetriesExhausted {
                attempts: failures,
                last: error.to_string(),
            });
        }
        let delay = backoff_delay(self.config.base_delay(), failures);
        tracing::debug!(
            attempt = failures,
            max_attempts = self.config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient GitHub error, will retry"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = self.url(path);
        let text = self.execute(Method::GET, &url, ACCEPT_JSON, None).await?;
        serde_json::from_str(&text).map_err(|e| FetchError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn post_graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, FetchError> {
        let body = json!({"query": query, "variables": variables});
        let url = self.url("/graphql");
        let text = self
            .execute(Method::POST, &url, ACCEPT_JSON, Some(&body))
            .await?;
        serde_json::from_str(&text).map_err(|e| FetchError::Decode {
            url,
            message: e.to_string(),
        })
    }

    async fn count_search(&self, query: &str) -> Result<u64, FetchError> {
        let path = format!("/search/issues?q={}&per_page=1", urlencoding::encode(query));
        let count: SearchCount = self.get_json(&path).await?;
        Ok(count.total_count)
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn search_repositories(
        &self,
        query: &str,
        page: u32,
        per_page: u32,
    ) -> Result<SearchPage, FetchError> {
        let path = format!(
            "/search/repositories?q={}&sort=stars&order=desc&per_page={}&page={}",
            urlencoding::encode(query),
            per_page.min(MAX_PER_PAGE),
            page
        );
        self.get_json(&path).await
    }

    async fn repository(&self, full_name: &str) -> Result<RepoSummary, FetchError> {
        self.get_json(&format!("/repos/{}", full_name)).await
    }

    async fn pull_request_count(&self, repo: &str) -> Result<u64, FetchError> {
        self.count_search(&format!("repo:{} is:pr", repo)).await
    }

    async fn issue_count(&self, repo: &str) -> Result<u64, FetchError> {
        self.count_search(&format!("repo:{} is:issue", repo)).await
    }

    async fn languages(&self, repo: &str) -> Result<BTreeMap<String, u64>, FetchError> {
        self.get_json(&format!("/repos/{}/languages", repo)).await
    }

    async fn list_closed_pulls(
        &self,
        repo: &str,
        page: u32,
    ) -> Result<Vec<PullRequest>, FetchError> {
        let path = format!(
            "/repos/{}/pulls?state=closed&sort=created&direction=desc&per_page={}&page={}",
            repo, MAX_PER_PAGE, page
        );
        self.get_json(&path).await
    }

    async fn pull_commits(&self, repo: &str, number: u64) -> Result<Vec<PullCommit>, FetchError> {
        let mut commits = Vec::new();
        for page in 1..=MAX_COMMIT_PAGES {
            let path = format!(
                "/repos/{}/pulls/{}/commits?per_page={}&page={}",
                repo, number, MAX_PER_PAGE, page
            );
            let batch: Vec<PullCommit> = self.get_json(&path).await?;
            let done = batch.len() < MAX_PER_PAGE as usize;
            commits.extend(batch);
            if done {
                break;
            }
        }
        Ok(commits)
    }

    async fn linked_issues(&self, repo: &str, number: u64) -> Result<Vec<IssueRef>, FetchError> {
        let (owner, name) = split_repo(repo)?;
        let response: GraphQlResponse = self
            .post_graphql(
                CLOSING_ISSUES_QUERY,
                json!({"owner": owner, "name": name, "number": number}),
            )
            .await?;

        let pull = response
            .data
            .and_then(|d| d.repository)
            .and_then(|r| r.pull_request);
        match pull {
            Some(pull) => Ok(pull
                .closing_issues_references
                .nodes
                .into_iter()
                .map(|node| IssueRef {
                    repo: node.repository.name_with_owner,
                    number: node.number,
                })
                .collect()),
            None => {
                let message = response
                    .errors
                    .unwrap_or_default()
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(FetchError::Decode {
                    url: self.url("/graphql"),
                    message,
                })
            }
        }
    }

    async fn pull_diff(&self, repo: &str, number: u64) -> Result<String, FetchError> {
        let url = self.url(&format!("/repos/{}/pulls/{}", repo, number));
        self.execute(Method::GET, &url, ACCEPT_DIFF, None).await
    }

    async fn merge_base(&self, repo: &str, base: &str, head: &str) -> Result<String, FetchError> {
        let compare: CompareResponse = self
            .get_json(&format!("/repos/{}/compare/{}...{}", repo, base, head))
            .await?;
        Ok(compare.merge_base_commit.sha)
    }

    async fn issue(&self, repo: &str, number: u64) -> Result<Option<Issue>, FetchError> {
        match self
            .get_json::<Issue>(&format!("/repos/{}/issues/{}", repo, number))
            .await
        {
            Ok(issue) => Ok(Some(issue)),
            Err(FetchError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn issue_comments(
        &self,
        repo: &str,
        number: u64,
    ) -> Result<Vec<IssueComment>, FetchError> {
        let mut comments = Vec::new();
        for page in 1..=MAX_COMMENT_PAGES {
            let path = format!(
                "/repos/{}/issues/{}/comments?per_page={}&page={}",
                repo, number, MAX_PER_PAGE, page
            );
            let batch: Vec<IssueComment> = self.get_json(&path).await?;
            let done = batch.len() < MAX_PER_PAGE as usize;
            comments.extend(batch);
            if done {
                break;
            }
        }
        Ok(comments)
    }

    async fn tags(&self, repo: &str) -> Result<Vec<Tag>, FetchError> {
        let (owner, name) = split_repo(repo)?;
        let response: TagsResponse = self
            .post_graphql(TAGS_QUERY, json!({"owner": owner, "name": name}))
            .await?;
        if let Some(refs) = response.data.and_then(|d| d.repository).and_then(|r| r.refs) {
            return Ok(refs.nodes.into_iter().filter_map(TagRefNode::into_tag).collect());
        }
        let message = response
            .errors
            .unwrap_or_default()
            .into_iter()
            .map(|e| e.message)
            .collect::<Vec<_>>()
            .join("; ");
        Err(FetchError::Decode {
            url: self.url("/graphql"),
            message,
        })
    }

    async fn commit_date(&self, repo: &str, sha: &str) -> Result<Option<DateTime<Utc>>, FetchError> {
        match self
            .get_json::<PullCommit>(&format!("/repos/{}/commits/{}", repo, sha))
            .await
        {
            Ok(commit) => Ok(commit.timestamp()),
            Err(FetchError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn split_repo(repo: &str) -> Result<(&str, &str), FetchError> {
    repo.split_once('/').ok_or_else(|| FetchError::Status {
        status: 400,
        url: repo.to_string(),
        message: "repository must be owner/name".to_string(),
    })
}

/// Parse `x-ratelimit-*` and `retry-after` headers.
///
/// `now_epoch` is the current Unix time, used to turn the absolute
/// `x-ratelimit-reset` into a delay.
pub fn rate_limit_from_headers(
    headers: &HeaderMap,
    now_epoch: i64,
) -> (RateLimitSnapshot, Option<Duration>) {
    let header_u64 = |name: &str| -> Option<u64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };

    let remaining = header_u64("x-ratelimit-remaining").map(|v| v.min(u32::MAX as u64) as u32);
    let reset_after = header_u64("x-ratelimit-reset").map(|reset| {
        let secs = (reset as i64 - now_epoch).max(1);
        Duration::from_secs(secs as u64)
    });
    let retry_after = header_u64("retry-after").map(Duration::from_secs);

    (RateLimitSnapshot::new(remaining, reset_after), retry_after)
}

/// Whether a response means "this token is out of quota" rather than a real failure.
pub fn is_rate_limited(
    status: u16,
    snapshot: &RateLimitSnapshot,
    retry_after: Option<Duration>,
    body: &str,
) -> bool {
    match status {
        429 => true,
        403 => {
            snapshot.remaining == Some(0)
                || retry_after.is_some()
                || body.to_lowercase().contains("rate limit")
        }
        _ => false,
    }
}

/// `base * 2^(attempt-1)` plus up to 25% jitter.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1u32 << exp);
    let jitter_cap = (delay.as_millis() as u64) / 4;
    let jitter = if jitter_cap > 0 {
        rand::rng().random_range(0..=jitter_cap)
    } else {
        0
    };
    delay + Duration::from_millis(jitter)
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(max_chars).collect();
        out.push_str("...");
        out
    }
}
