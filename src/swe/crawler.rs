//! Repository discovery through the GitHub search API.
//!
//! Search only serves the first 1000 results of a query, so star ranges
//! holding more repositories are bisected until each fits. Each range is
//! read in up to 10 pages of 100, highest stars first.
//!
//! The crawl is a lazy stream of [`CrawlEvent`]s. After every page it yields
//! the cursor to persist, so an interrupted crawl resumes at the next page.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};

use super::RepoRecord;
use crate::error::FetchError;
use crate::github::{CodeHost, RepoSummary};

/// Results per search page.
pub const PER_PAGE: u32 = 100;

/// Pages readable per query (GitHub serves at most 1000 results).
pub const MAX_PAGES: u32 = 10;

/// Result count above which a star range is split.
pub const SEARCH_RESULT_CAP: u64 = 1000;

/// Width of the first slice cut from an open-ended range.
const OPEN_RANGE_STEP: u32 = 5000;

/// Inclusive star range; `max == None` is open-ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StarRange {
    pub min: u32,
    pub max: Option<u32>,
}

impl StarRange {
    pub fn new(min: u32, max: Option<u32>) -> Self {
        Self { min, max }
    }

    fn qualifier(&self) -> String {
        match self.max {
            Some(max) => format!("stars:{}..{}", self.min, max),
            None => format!("stars:>={}", self.min),
        }
    }

    /// Halve the range, or cut an open range at `min + 5000`.
    /// `None` when the range is a single star count.
    pub fn split(&self) -> Option<(StarRange, StarRange)> {
        match self.max {
            None => {
                let mid = self.min.checked_add(OPEN_RANGE_STEP)?;
                Some((
                    StarRange::new(self.min, Some(mid)),
                    StarRange::new(mid + 1, None),
                ))
            }
            Some(max) if max > self.min => {
                let mid = self.min + (max - self.min) / 2;
                Some((
                    StarRange::new(self.min, Some(mid)),
                    StarRange::new(mid + 1, Some(max)),
                ))
            }
            Some(_) => None,
        }
    }
}

/// Search query for repositories of `language` inside `range`.
pub fn build_query(language: &str, range: &StarRange) -> String {
    let language = if language.contains(char::is_whitespace) {
        format!("\"{}\"", language)
    } else {
        language.to_string()
    };
    format!("language:{} {}", language, range.qualifier())
}

/// Resumable crawl position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlCursor {
    pub language: String,
    /// Repositories below this star count are never emitted.
    pub min_stars: u32,
    #[serde(default)]
    pub max_stars: Option<u32>,
    /// Ranges still to read; the front one is in progress.
    pub pending: VecDeque<StarRange>,
    /// Next page of the front range, starting at 1.
    pub next_page: u32,
    /// Whether the front range's result count was seen to fit under the cap.
    #[serde(default)]
    pub range_checked: bool,
}

impl CrawlCursor {
    pub fn start(language: impl Into<String>, min_stars: u32, max_stars: Option<u32>) -> Self {
        Self {
            language: language.into(),
            min_stars,
            max_stars,
            pending: VecDeque::from([StarRange::new(min_stars, max_stars)]),
            next_page: 1,
            range_checked: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether this cursor belongs to a crawl with the given parameters.
    pub fn matches(&self, language: &str, min_stars: u32, max_stars: Option<u32>) -> bool {
        self.language.eq_ignore_ascii_case(language)
            && self.min_stars == min_stars
            && self.max_stars == max_stars
    }

    fn advance_page(&mut self, page_len: usize) {
        if page_len < PER_PAGE as usize || self.next_page >= MAX_PAGES {
            self.pending.pop_front();
            self.next_page = 1;
            self.range_checked = false;
        } else {
            self.next_page += 1;
        }
    }
}

/// Item of the crawl stream.
#[derive(Debug, Clone)]
pub enum CrawlEvent {
    Repository(RepoRecord),
    /// A page was fully emitted; persist `cursor` to resume after it.
    PageCompleted { cursor: CrawlCursor },
    /// A page could not be fetched; the crawl moved on to the next one.
    PageFailed {
        query: String,
        page: u32,
        error: String,
        cursor: CrawlCursor,
    },
}

/// Discovers repositories through a [`CodeHost`].
pub struct RepoCrawler {
    host: Arc<dyn CodeHost>,
}

impl RepoCrawler {
    pub fn new(host: Arc<dyn CodeHost>) -> Self {
        Self { host }
    }

    /// Lazily crawl from `cursor` until every range is exhausted.
    pub fn crawl(&self, cursor: CrawlCursor) -> impl Stream<Item = CrawlEvent> + Send + 'static {
        let host = self.host.clone();
        async_stream::stream! {
            let mut cursor = cursor;
            while let Some(range) = cursor.pending.front().copied() {
                let query = build_query(&cursor.language, &range);
                let page = cursor.next_page;

                let result = match host.search_repositories(&query, page, PER_PAGE).await {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::warn!(query = %query, page, error = %e, "Search page failed, skipping");
                        cursor.advance_page(PER_PAGE as usize);
                        yield CrawlEvent::PageFailed {
                            query,
                            page,
                            error: e.to_string(),
                            cursor: cursor.clone(),
                        };
                        continue;
                    }
                };

                // Any page carries the range's total, so a range whose first
                // page failed is still checked before its results are used.
                if !cursor.range_checked && result.total_count > SEARCH_RESULT_CAP {
                    if let Some((low, high)) = range.split() {
                        tracing::info!(
                            query = %query,
                            total = result.total_count,
                            "Star range too large, splitting"
                        );
                        cursor.pending.pop_front();
                        cursor.pending.push_back(low);
                        cursor.pending.push_back(high);
                        cursor.next_page = 1;
                        cursor.range_checked = false;
                        yield CrawlEvent::PageCompleted { cursor: cursor.clone() };
                        continue;
                    }
                    tracing::warn!(
                        query = %query,
                        total = result.total_count,
                        cap = SEARCH_RESULT_CAP,
                        "Star range cannot be split further, results past the cap are unreachable"
                    );
                }

                if !cursor.range_checked {
                    tracing::info!(query = %query, total = result.total_count, "Crawling star range");
                    cursor.range_checked = true;
                }

                let page_len = result.items.len();
                for record in select_page_items(result.items, cursor.min_stars) {
                    yield CrawlEvent::Repository(record);
                }

                cursor.advance_page(page_len);
                yield CrawlEvent::PageCompleted { cursor: cursor.clone() };
            }
        }
    }

    /// Look up a single repository, bypassing search.
    pub async fn fetch_single(&self, full_name: &str) -> Result<RepoRecord, FetchError> {
        let summary = self.host.repository(full_name).await?;
        Ok(RepoRecord::from(summary))
    }
}

/// Sort a page by stars descending then id ascending, dropping repositories
/// below `min_stars`.
pub fn select_page_items(items: Vec<RepoSummary>, min_stars: u32) -> Vec<RepoRecord> {
    let mut items: Vec<RepoSummary> = items
        .into_iter()
        .filter(|r| r.stargazers_count >= u64::from(min_stars))
        .collect();
    items.sort_by(|a, b| {
        b.stargazers_count
            .cmp(&a.stargazers_count)
            .then(a.id.cmp(&b.id))
    });
    items.into_iter().map(RepoRecord::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::InMemoryHost;
    use crate::swe::test_support::summary;
    use futures::StreamExt;

    #[test]
    fn test_build_query() {
        assert_eq!(
            build_query("Python", &StarRange::new(1000, Some(2000))),
            "language:Python stars:1000..2000"
        );
        assert_eq!(
            build_query("Jupyter Notebook", &StarRange::new(10, None)),
            "language:\"Jupyter Notebook\" stars:>=10"
        );
    }

    #[test]
    fn test_split_ranges() {
        assert_eq!(
            StarRange::new(1000, None).split(),
            Some((StarRange::new(1000, Some(6000)), StarRange::new(6001, None)))
        );
        assert_eq!(
            StarRange::new(1000, Some(2000)).split(),
            Some((StarRange::new(1000, Some(1500)), StarRange::new(1501, Some(2000))))
        );
        assert_eq!(
            StarRange::new(7, Some(8)).split(),
            Some((StarRange::new(7, Some(7)), StarRange::new(8, Some(8))))
        );
        assert_eq!(StarRange::new(7, Some(7)).split(), None);
    }

    #[test]
    fn test_select_page_items_filters_and_orders() {
        let items = vec![
            summary(3, "a/low", 500),
            summary(2, "a/mid", 1500),
            summary(9, "a/top", 2000),
            summary(1, "a/tie", 1500),
        ];
        let records = select_page_items(items, 1000);
        let names: Vec<&str> = records.iter().map(|r| r.full_name.as_str()).collect();
        assert_eq!(names, vec!["a/top", "a/tie", "a/mid"]);
    }

    fn repos(events: &[CrawlEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                CrawlEvent::Repository(r) => Some(r.full_name.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_crawl_emits_only_repos_above_min_stars() {
        let host = InMemoryHost::new();
        host.add_repo(summary(1, "o/small", 500));
        host.add_repo(summary(2, "o/medium", 1500));
        host.add_repo(summary(3, "o/large", 2000));

        let crawler = RepoCrawler::new(Arc::new(host));
        let events: Vec<CrawlEvent> = crawler
            .crawl(CrawlCursor::start("Python", 1000, None))
            .collect()
            .await;

        assert_eq!(repos(&events), vec!["o/large", "o/medium"]);
        match events.last() {
            Some(CrawlEvent::PageCompleted { cursor }) => assert!(cursor.is_finished()),
            other => panic!("unexpected last event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_crawl_splits_oversized_ranges() {
        let host = InMemoryHost::new();
        host.add_repo(summary(1, "o/a", 1200));
        host.add_repo(summary(2, "o/b", 9000));
        host.mark_oversized("language:Python stars:>=1000");

        let crawler = RepoCrawler::new(Arc::new(host.clone()));
        let events: Vec<CrawlEvent> = crawler
            .crawl(CrawlCursor::start("Python", 1000, None))
            .collect()
            .await;

        let mut found = repos(&events);
        found.sort();
        assert_eq!(found, vec!["o/a", "o/b"]);
        assert!(host
            .search_queries()
            .iter()
            .any(|q| q == "language:Python stars:1000..6000"));
    }

    #[tokio::test]
    async fn test_crawl_resumes_from_cursor() {
        let host = InMemoryHost::new();
        for i in 0..150u64 {
            host.add_repo(summary(i + 1, &format!("o/r{}", i), 2000 + i));
        }
        let crawler = RepoCrawler::new(Arc::new(host));

        let mut stream = Box::pin(crawler.crawl(CrawlCursor::start("Python", 1000, None)));
        let mut first_page = Vec::new();
        let mut saved = None;
        while let Some(event) = stream.next().await {
            match event {
                CrawlEvent::Repository(r) => first_page.push(r.full_name),
                CrawlEvent::PageCompleted { cursor } => {
                    saved = Some(cursor);
                    break;
                }
                CrawlEvent::PageFailed { .. } => panic!("no failures expected"),
            }
        }
        drop(stream);

        let cursor = saved.unwrap();
        assert_eq!(cursor.next_page, 2);
        assert_eq!(first_page.len(), 100);

        let rest: Vec<CrawlEvent> = crawler.crawl(cursor).collect().await;
        let rest = repos(&rest);
        assert_eq!(rest.len(), 50);
        assert!(rest.iter().all(|name| !first_page.contains(name)));
    }

    #[tokio::test]
    async fn test_failed_page_is_reported_and_skipped() {
        let host = InMemoryHost::new();
        host.add_repo(summary(1, "o/a", 1200));
        host.fail_searches(1);

        let crawler = RepoCrawler::new(Arc::new(host));
        let events: Vec<CrawlEvent> = crawler
            .crawl(CrawlCursor::start("Python", 1000, None))
            .collect()
            .await;

        assert!(matches!(events[0], CrawlEvent::PageFailed { page: 1, .. }));
        assert!(repos(&events).is_empty());
    }

    #[tokio::test]
    async fn test_oversized_range_split_after_failed_first_page() {
        let host = InMemoryHost::new();
        host.add_repo(summary(1, "o/a", 1200));
        host.mark_oversized("language:Python stars:>=1000");
        host.fail_searches(1);

        let crawler = RepoCrawler::new(Arc::new(host.clone()));
        let events: Vec<CrawlEvent> = crawler
            .crawl(CrawlCursor::start("Python", 1000, None))
            .collect()
            .await;

        assert!(matches!(events[0], CrawlEvent::PageFailed { page: 1, .. }));
        assert_eq!(repos(&events), vec!["o/a"]);
        assert!(host
            .search_queries()
            .iter()
            .any(|q| q == "language:Python stars:1000..6000"));
    }

    #[test]
    fn test_cursor_matches_star_bounds() {
        let cursor = CrawlCursor::start("Python", 1000, Some(5000));
        assert!(cursor.matches("python", 1000, Some(5000)));
        assert!(!cursor.matches("Python", 1000, Some(8000)));
        assert!(!cursor.matches("Python", 1000, None));
        assert!(!cursor.matches("Python", 500, Some(5000)));
    }
}
