//! Release version of the code a task is pinned to, derived from tags.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::github::Tag;

/// Version recorded when no tag says otherwise.
pub const DEFAULT_VERSION: &str = "0.0";

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\d+\.\d+)(?:\.\d+)?").expect("Invalid regex for version tags"))
}

/// `major.minor` of a tag name such as `v2.31.0` or `release-1.4`.
pub fn version_from_tag(name: &str) -> Option<String> {
    version_re()
        .captures(name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

/// Version of the commit `sha`, given the repository's tags newest first.
///
/// A tag on `sha` itself decides alone, even when its name carries no
/// version. Otherwise the tag whose commit date is nearest `commit_date`
/// wins, and without a date the newest tag does.
pub fn resolve_version(
    tags: &[Tag],
    sha: &str,
    commit_date: Option<DateTime<Utc>>,
) -> Option<String> {
    if let Some(exact) = tags.iter().find(|t| t.sha == sha) {
        return version_from_tag(&exact.name);
    }

    let nearest = commit_date.and_then(|date| {
        tags.iter()
            .filter_map(|t| t.date.map(|d| ((d - date).num_seconds().abs(), t)))
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, t)| t)
    });

    nearest
        .or_else(|| tags.first())
        .and_then(|t| version_from_tag(&t.name))
}
