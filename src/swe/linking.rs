//! Pairing pull requests with the issues they resolve.
//!
//! Two signals are combined: closing keywords written in the PR title, body
//! and commit messages ("Fixes #42", "closes owner/repo#7", issue URLs) and
//! the issue links the host records natively. Only issues of the PR's own
//! repository count; references elsewhere are reported as cross-repo and
//! dropped.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::github::IssueRef;

/// Everything pairing needs to know about a pull request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullSnapshot {
    pub title: String,
    pub body: String,
    pub commit_messages: Vec<String>,
    /// Links reported by the host (GitHub's `closingIssuesReferences`).
    pub native_links: Vec<IssueRef>,
}

/// Result of pairing one pull request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkResult {
    /// Same-repository issue numbers, ascending and unique.
    pub issue_numbers: Vec<u64>,
    /// References to issues in other repositories, excluded from the task.
    pub cross_repo: Vec<IssueRef>,
}

impl LinkResult {
    pub fn is_empty(&self) -> bool {
        self.issue_numbers.is_empty()
    }
}

/// A closing reference found in free text. `repo` is `None` for a bare `#N`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextReference {
    pub repo: Option<String>,
    pub number: u64,
}

fn closing_keyword_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:close[sd]?|fix(?:e[sd])?|resolve[sd]?)\b:?\s+(?:https?://github\.com/(?P<url_repo>[\w.-]+/[\w.-]+)/issues/(?P<url_num>\d+)|(?P<repo>[\w.-]+/[\w.-]+)?#(?P<num>\d+))",
        )
        .expect("Invalid regex for closing keywords")
    })
}

fn html_comment_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").expect("Invalid regex for HTML comments"))
}

/// Extract closing references from text. HTML comments (PR template
/// boilerplate) are ignored.
pub fn parse_closing_references(text: &str) -> Vec<TextReference> {
    let visible = html_comment_regex().replace_all(text, "");
    closing_keyword_regex()
        .captures_iter(&visible)
        .filter_map(|caps| {
            if let Some(num) = caps.name("url_num") {
                let number = num.as_str().parse().ok()?;
                let repo = caps.name("url_repo").map(|m| m.as_str().to_string());
                Some(TextReference { repo, number })
            } else {
                let number = caps.name("num")?.as_str().parse().ok()?;
                let repo = caps.name("repo").map(|m| m.as_str().to_string());
                Some(TextReference { repo, number })
            }
        })
        .collect()
}

/// Pair a pull request of `repo` with the issues it resolves.
pub fn link_issues(repo: &str, pull: &PullSnapshot) -> LinkResult {
    let mut numbers = BTreeSet::new();
    let mut cross_repo = BTreeSet::new();

    let mut texts: Vec<&str> = vec![pull.title.as_str(), pull.body.as_str()];
    texts.extend(pull.commit_messages.iter().map(String::as_str));

    let candidates = texts
        .into_iter()
        .flat_map(parse_closing_references)
        .map(|r| IssueRef {
            repo: r.repo.unwrap_or_else(|| repo.to_string()),
            number: r.number,
        })
        .chain(pull.native_links.iter().cloned());

    for reference in candidates {
        if reference.number == 0 {
            continue;
        }
        if reference.repo.eq_ignore_ascii_case(repo) {
            numbers.insert(reference.number);
        } else {
            cross_repo.insert(reference);
        }
    }

    LinkResult {
        issue_numbers: numbers.into_iter().collect(),
        cross_repo: cross_repo.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(body: &str) -> PullSnapshot {
        PullSnapshot {
            title: "Fix crash".to_string(),
            body: body.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_fixes_hash_number() {
        let result = link_issues("a/b", &snapshot("Fixes #42"));
        assert_eq!(result.issue_numbers, vec![42]);
        assert!(result.cross_repo.is_empty());
    }

    #[test]
    fn test_all_keyword_forms() {
        for keyword in [
            "close", "closes", "closed", "fix", "fixes", "fixed", "resolve", "resolves",
            "resolved", "FIXES", "Closes:",
        ] {
            let result = link_issues("a/b", &snapshot(&format!("{} #7", keyword)));
            assert_eq!(result.issue_numbers, vec![7], "keyword {}", keyword);
        }
    }

    #[test]
    fn test_no_keyword_no_link() {
        let result = link_issues("a/b", &snapshot("See #42 and related to #43"));
        assert!(result.is_empty());
        let result = link_issues("a/b", &snapshot("prefixes #42"));
        assert!(result.is_empty());
    }

    #[test]
    fn test_qualified_and_url_references() {
        let body = "Fixes a/b#3\nResolves https://github.com/a/b/issues/5\nCloses other/repo#9";
        let result = link_issues("a/b", &snapshot(body));
        assert_eq!(result.issue_numbers, vec![3, 5]);
        assert_eq!(
            result.cross_repo,
            vec![IssueRef {
                repo: "other/repo".to_string(),
                number: 9
            }]
        );
    }

    #[test]
    fn test_union_with_commits_and_native_links_sorted_unique() {
        let pull = PullSnapshot {
            title: "Resolve #12".to_string(),
            body: "fixes #3, also fixes #12".to_string(),
            commit_messages: vec!["fix #8: handle empty input".to_string()],
            native_links: vec![
                IssueRef {
                    repo: "A/B".to_string(),
                    number: 3,
                },
                IssueRef {
                    repo: "a/b".to_string(),
                    number: 1,
                },
            ],
        };
        let result = link_issues("a/b", &pull);
        assert_eq!(result.issue_numbers, vec![1, 3, 8, 12]);
    }

    #[test]
    fn test_html_comments_ignored() {
        let body = "<!-- Please write: Fixes #123 -->\nNo linked issue.";
        assert!(link_issues("a/b", &snapshot(body)).is_empty());
    }

    #[test]
    fn test_parse_closing_references_keeps_repo() {
        let refs = parse_closing_references("closes #1 and fixes x/y#2");
        assert_eq!(
            refs,
            vec![
                TextReference {
                    repo: None,
                    number: 1
                },
                TextReference {
                    repo: Some("x/y".to_string()),
                    number: 2
                },
            ]
        );
    }
}
