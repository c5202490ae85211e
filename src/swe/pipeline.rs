//! Stage runners and the on-disk layout of a curation run.
//!
//! Each stage reads the previous stage's output, appends its own records and
//! keeps a checkpoint of finished units, so any stage can be interrupted and
//! rerun without redoing or duplicating work.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use super::crawler::{CrawlCursor, CrawlEvent, RepoCrawler};
use super::extractor::{ExtractorConfig, TaskExtractor};
use super::issue_scorer::{apply_threshold, IssueQualityScorer, ScorerConfig, MAX_SCORE};
use super::merger::{MergeReport, TaskMerger};
use super::progress::{ProgressCounters, RunSummary};
use super::repo_filter::{FilterCriteria, FilterDecision, FilterOutcome, RepoFilter};
use super::shutdown::Shutdown;
use super::store::{
    read_json, read_jsonl, write_json_atomic, write_jsonl_atomic, JsonlAppender,
};
use super::{validate_repo_name, RepoRecord, ScoreStatus, ScoredTaskRecord, TaskRecord};
use crate::config::CurationConfig;
use crate::error::{ConfigError, CurationError};
use crate::github::CodeHost;
use crate::llm::LlmProvider;

/// File layout under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePaths {
    root: PathBuf,
}

impl StagePaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Crawled repositories.
    pub fn raw_repos(&self) -> PathBuf {
        self.root.join("raw_repos.jsonl")
    }

    pub fn crawl_cursor(&self) -> PathBuf {
        self.root.join("crawl_cursor.json")
    }

    /// Every filter decision; also the filter checkpoint.
    pub fn filter_decisions(&self) -> PathBuf {
        self.root.join("filter_decisions.jsonl")
    }

    /// Admitted repositories, enriched.
    pub fn filtered_repos(&self) -> PathBuf {
        self.root.join("filtered_repos.jsonl")
    }

    /// Directory of per-repository task shards.
    pub fn task_shards(&self) -> PathBuf {
        self.root.join("tasks")
    }

    pub fn shard_for(&self, repo: &str) -> PathBuf {
        self.task_shards()
            .join(format!("{}.jsonl", repo.replace('/', "__")))
    }

    /// Repositories whose shard is complete.
    pub fn extract_done(&self) -> PathBuf {
        self.root.join("extract_done.jsonl")
    }

    /// Merged dataset.
    pub fn tasks(&self) -> PathBuf {
        self.root.join("tasks.jsonl")
    }

    /// Raw judge results; later lines supersede earlier ones.
    pub fn issue_scores(&self) -> PathBuf {
        self.root.join("issue_scores.jsonl")
    }

    /// Tasks accepted at the current threshold.
    pub fn issue_filter_tasks(&self) -> PathBuf {
        self.root.join("issue_filter_tasks.jsonl")
    }
}

/// Checkpoint line of the extract stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ExtractDone {
    repo: String,
    tasks: usize,
}

/// Drives the curation stages against a code host and an optional judge.
pub struct Pipeline {
    host: Option<Arc<dyn CodeHost>>,
    judge: Option<Arc<dyn LlmProvider>>,
    config: CurationConfig,
    paths: StagePaths,
    counters: ProgressCounters,
    shutdown: Shutdown,
}

impl Pipeline {
    pub fn new(host: Arc<dyn CodeHost>, config: CurationConfig) -> Self {
        Self::build(Some(host), config)
    }

    /// A pipeline without a code host, for the stages that only read local
    /// files (merge, score, refilter).
    pub fn offline(config: CurationConfig) -> Self {
        Self::build(None, config)
    }

    fn build(host: Option<Arc<dyn CodeHost>>, config: CurationConfig) -> Self {
        let paths = StagePaths::new(config.output_dir.clone());
        Self {
            host,
            judge: None,
            config,
            paths,
            counters: ProgressCounters::new(),
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_judge(mut self, judge: Arc<dyn LlmProvider>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn paths(&self) -> &StagePaths {
        &self.paths
    }

    pub fn config(&self) -> &CurationConfig {
        &self.config
    }

    pub fn counters(&self) -> &ProgressCounters {
        &self.counters
    }

    pub fn summary(&self, start: Instant) -> RunSummary {
        self.counters.summary(start, self.shutdown.is_triggered())
    }

    /// Crawl repositories of the configured language, resuming from the
    /// saved cursor when it belongs to the same crawl.
    pub async fn crawl(&self) -> Result<(), CurationError> {
        let language = self.config.language.clone();
        let cursor = match read_json::<CrawlCursor>(&self.paths.crawl_cursor())? {
            Some(cursor)
                if cursor.matches(&language, self.config.min_stars, self.config.max_stars) =>
            {
                if cursor.is_finished() {
                    tracing::info!("Crawl already complete");
                    return Ok(());
                }
                tracing::info!(pending = cursor.pending.len(), page = cursor.next_page, "Resuming crawl");
                cursor
            }
            Some(_) => {
                tracing::warn!("Saved crawl cursor is for different parameters, starting over");
                CrawlCursor::start(language, self.config.min_stars, self.config.max_stars)
            }
            None => CrawlCursor::start(language, self.config.min_stars, self.config.max_stars),
        };

        let mut seen = self.known_repos(&self.paths.raw_repos())?;
        let mut out = JsonlAppender::open(&self.paths.raw_repos())?;
        let crawler = RepoCrawler::new(self.host()?);
        let stream = crawler.crawl(cursor);
        futures::pin_mut!(stream);

        while let Some(event) = stream.next().await {
            match event {
                CrawlEvent::Repository(record) => {
                    if seen.insert(record.full_name.clone()) {
                        out.append(&record)?;
                        ProgressCounters::add(&self.counters.fetched, 1);
                    }
                }
                CrawlEvent::PageCompleted { cursor } => {
                    out.sync()?;
                    write_json_atomic(&self.paths.crawl_cursor(), &cursor)?;
                    if self.shutdown.is_triggered() {
                        break;
                    }
                }
                CrawlEvent::PageFailed {
                    query,
                    page,
                    error,
                    cursor,
                } => {
                    self.counters
                        .record_failure("crawl", &format!("{} page {}", query, page), error);
                    out.sync()?;
                    write_json_atomic(&self.paths.crawl_cursor(), &cursor)?;
                    if self.shutdown.is_triggered() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Add one named repository to the crawl output, bypassing search.
    pub async fn crawl_single(&self, repo: &str) -> Result<(), CurationError> {
        validate_repo_name(repo)?;
        let seen = self.known_repos(&self.paths.raw_repos())?;
        if seen.contains(repo) {
            tracing::info!(repo = %repo, "Repository already crawled");
            return Ok(());
        }
        let record = RepoCrawler::new(self.host()?).fetch_single(repo).await?;
        let mut out = JsonlAppender::open(&self.paths.raw_repos())?;
        out.append(&record)?;
        out.sync()?;
        ProgressCounters::add(&self.counters.fetched, 1);
        Ok(())
    }

    /// Filter crawled repositories not decided on yet.
    pub async fn filter(&self) -> Result<(), CurationError> {
        let decided: HashSet<String> = read_jsonl::<FilterDecision>(&self.paths.filter_decisions())?
            .records
            .into_iter()
            .map(|d| d.full_name)
            .collect();
        let pending: Vec<RepoRecord> = unique_by_name(read_jsonl::<RepoRecord>(&self.paths.raw_repos())?.records)
            .into_iter()
            .filter(|r| !decided.contains(&r.full_name))
            .collect();
        tracing::info!(pending = pending.len(), already_decided = decided.len(), "Filtering repositories");

        let filter = RepoFilter::new(
            self.host()?,
            FilterCriteria::from(&self.config),
            self.config.max_workers,
        );
        let mut decisions = JsonlAppender::open(&self.paths.filter_decisions())?;
        let mut admitted = JsonlAppender::open(&self.paths.filtered_repos())?;

        let shutdown = self.shutdown.clone();
        let repos = futures::stream::iter(pending).take_while(move |_| {
            futures::future::ready(!shutdown.is_triggered())
        });
        let outcomes = filter.filter(repos);
        futures::pin_mut!(outcomes);

        while let Some(outcome) = outcomes.next().await {
            match outcome {
                FilterOutcome::Decided(decision) => {
                    if decision.admitted {
                        admitted.append(&decision.record)?;
                        admitted.sync()?;
                        ProgressCounters::add(&self.counters.admitted, 1);
                    } else {
                        self.counters.record_skip("filter", &decision.full_name, decision.reasons.join("; "));
                    }
                    decisions.append(&decision)?;
                    decisions.sync()?;
                    ProgressCounters::add(&self.counters.filtered, 1);
                }
                FilterOutcome::Failed { full_name, error } => {
                    self.counters.record_failure("filter", &full_name, error);
                }
            }
        }
        Ok(())
    }

    /// Extract tasks from admitted repositories without a finished shard.
    pub async fn extract(&self) -> Result<(), CurationError> {
        let done: HashSet<String> = read_jsonl::<ExtractDone>(&self.paths.extract_done())?
            .records
            .into_iter()
            .map(|d| d.repo)
            .collect();
        let pending: Vec<String> = unique_by_name(read_jsonl::<RepoRecord>(&self.paths.filtered_repos())?.records)
            .into_iter()
            .map(|r| r.full_name)
            .filter(|name| !done.contains(name))
            .collect();
        tracing::info!(pending = pending.len(), already_done = done.len(), "Extracting repositories");

        let extractor = TaskExtractor::new(self.host()?, ExtractorConfig::from(&self.config));
        let mut checkpoint = JsonlAppender::open(&self.paths.extract_done())?;

        let shutdown = self.shutdown.clone();
        let extractor = &extractor;
        let results = futures::stream::iter(pending)
            .take_while(move |_| futures::future::ready(!shutdown.is_triggered()))
            .map(move |repo| async move {
                let result = extractor.extract_repo(&repo).await;
                (repo, result)
            })
            .buffer_unordered(self.config.max_workers.max(1));
        futures::pin_mut!(results);

        while let Some((repo, result)) = results.next().await {
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.counters.record_failure("extract", &repo, e);
                    continue;
                }
            };
            for (number, reason) in &outcome.skipped {
                self.counters
                    .record_skip("extract", &format!("{}#{}", repo, number), reason);
            }
            write_jsonl_atomic(&self.paths.shard_for(&repo), &outcome.tasks)?;
            checkpoint.append(&ExtractDone {
                repo: repo.clone(),
                tasks: outcome.tasks.len(),
            })?;
            checkpoint.sync()?;
            ProgressCounters::add(&self.counters.extracted, outcome.tasks.len());
        }
        Ok(())
    }

    /// Merge every finished shard into the dataset.
    pub fn merge(&self) -> Result<MergeReport, CurationError> {
        let merger = TaskMerger::new(vec![self.paths.task_shards()], self.paths.tasks());
        let report = merger.run()?;
        for duplicate in &report.duplicates {
            self.counters.record_skip(
                "merge",
                &duplicate.instance_id,
                format!("duplicate in {}", duplicate.shard.display()),
            );
        }
        self.counters
            .merged
            .store(report.tasks.len(), std::sync::atomic::Ordering::Relaxed);
        Ok(report)
    }

    /// Judge merged tasks that have no stored score yet, then write the
    /// accepted set. With `retry_unscored`, unscored tasks are judged again.
    pub async fn score(&self, retry_unscored: bool) -> Result<(), CurationError> {
        let judge = self.judge.clone().ok_or_else(|| {
            ConfigError::ValidationFailed("the score stage needs a judge (set OPENAI_API_KEY)".to_string())
        })?;

        let tasks = read_jsonl::<TaskRecord>(&self.paths.tasks())?.records;
        let mut scores = self.stored_scores()?;
        let pending: Vec<TaskRecord> = tasks
            .into_iter()
            .filter(|task| match scores.get(&task.instance_id) {
                None => true,
                Some(existing) => retry_unscored && existing.status == ScoreStatus::Unscored,
            })
            .collect();
        tracing::info!(pending = pending.len(), stored = scores.len(), "Scoring issues");

        let scorer = IssueQualityScorer::new(judge, ScorerConfig::from(&self.config));
        let mut out = JsonlAppender::open(&self.paths.issue_scores())?;

        let shutdown = self.shutdown.clone();
        let pending = pending
            .into_iter()
            .take_while(move |_| !shutdown.is_triggered());
        let results = scorer.score_all(pending);
        futures::pin_mut!(results);

        while let Some(record) = results.next().await {
            out.append(&record)?;
            out.sync()?;
            ProgressCounters::add(&self.counters.scored, 1);
            scores.insert(record.instance_id().to_string(), record);
        }

        let accepted = self.write_accepted(scores.into_values().collect())?;
        self.counters
            .accepted
            .store(accepted, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    /// Re-apply `threshold` to the stored scores. Never calls the judge.
    pub fn refilter(&self, threshold: f64) -> Result<usize, CurationError> {
        let accepted = refilter_scores(&self.paths, threshold)?;
        self.counters
            .accepted
            .store(accepted, std::sync::atomic::Ordering::Relaxed);
        Ok(accepted)
    }

    /// Run every stage in order. Scoring is skipped when no judge is set.
    pub async fn run_all(&self) -> Result<(), CurationError> {
        self.crawl().await?;
        if self.shutdown.is_triggered() {
            return Ok(());
        }
        self.filter().await?;
        if self.shutdown.is_triggered() {
            return Ok(());
        }
        self.extract().await?;
        if self.shutdown.is_triggered() {
            return Ok(());
        }
        self.merge()?;
        if self.judge.is_none() {
            tracing::warn!("No judge configured, skipping the score stage");
            return Ok(());
        }
        self.score(false).await
    }

    fn host(&self) -> Result<Arc<dyn CodeHost>, CurationError> {
        self.host.clone().ok_or_else(|| {
            ConfigError::ValidationFailed(
                "this stage talks to GitHub and needs a code host".to_string(),
            )
            .into()
        })
    }

    fn known_repos(&self, path: &Path) -> Result<HashSet<String>, CurationError> {
        Ok(read_jsonl::<RepoRecord>(path)?
            .records
            .into_iter()
            .map(|r| r.full_name)
            .collect())
    }

    fn stored_scores(&self) -> Result<BTreeMap<String, ScoredTaskRecord>, CurationError> {
        stored_scores(&self.paths)
    }

    fn write_accepted(&self, records: Vec<ScoredTaskRecord>) -> Result<usize, CurationError> {
        write_accepted_at(&self.paths, records, self.config.score_threshold)
    }
}

/// Re-apply `threshold` to the scores stored under `paths` and rewrite the
/// accepted set. Returns the number of accepted tasks.
pub fn refilter_scores(paths: &StagePaths, threshold: f64) -> Result<usize, CurationError> {
    if !(0.0..=MAX_SCORE).contains(&threshold) {
        return Err(ConfigError::InvalidValue {
            key: "threshold".to_string(),
            message: format!("must be between 0 and {}, got {}", MAX_SCORE, threshold),
        }
        .into());
    }
    let scores = stored_scores(paths)?;
    let accepted = write_accepted_at(paths, scores.into_values().collect(), threshold)?;
    tracing::info!(threshold, accepted, "Re-applied score threshold");
    Ok(accepted)
}

/// Stored judge results keyed by instance id; later lines win.
fn stored_scores(paths: &StagePaths) -> Result<BTreeMap<String, ScoredTaskRecord>, CurationError> {
    let mut scores = BTreeMap::new();
    for record in read_jsonl::<ScoredTaskRecord>(&paths.issue_scores())?.records {
        scores.insert(record.instance_id().to_string(), record);
    }
    Ok(scores)
}

fn write_accepted_at(
    paths: &StagePaths,
    records: Vec<ScoredTaskRecord>,
    threshold: f64,
) -> Result<usize, CurationError> {
    let mut accepted: Vec<ScoredTaskRecord> = apply_threshold(records, threshold)
        .into_iter()
        .filter(|r| r.accepted)
        .collect();
    accepted.sort_by(|a, b| a.instance_id().cmp(b.instance_id()));
    write_jsonl_atomic(&paths.issue_filter_tasks(), &accepted)?;
    Ok(accepted.len())
}

/// Drop repeated repositories, keeping the first occurrence.
fn unique_by_name(records: Vec<RepoRecord>) -> Vec<RepoRecord> {
    let mut seen = HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(r.full_name.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::InMemoryHost;
    use crate::swe::issue_scorer::tests::ScriptedJudge;
    use crate::swe::test_support::{summary, task};

    fn config(dir: &Path) -> CurationConfig {
        CurationConfig::new().with_output_dir(dir)
    }

    #[test]
    fn test_stage_paths_layout() {
        let paths = StagePaths::new("/out");
        assert_eq!(paths.shard_for("acme/widgets"), PathBuf::from("/out/tasks/acme__widgets.jsonl"));
        assert_eq!(paths.tasks(), PathBuf::from("/out/tasks.jsonl"));
        assert_eq!(paths.crawl_cursor(), PathBuf::from("/out/crawl_cursor.json"));
    }

    #[tokio::test]
    async fn test_crawl_is_resumable_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let host = InMemoryHost::new();
        host.add_repo(summary(1, "o/a", 3000));
        host.add_repo(summary(2, "o/b", 2000));
        let pipeline = Pipeline::new(Arc::new(host.clone()), config(dir.path()));

        pipeline.crawl().await.unwrap();
        let searches = host.search_queries().len();
        pipeline.crawl().await.unwrap();

        let records = read_jsonl::<RepoRecord>(&pipeline.paths().raw_repos()).unwrap().records;
        assert_eq!(records.len(), 2);
        assert_eq!(host.search_queries().len(), searches, "finished crawl must not search again");
    }

    #[tokio::test]
    async fn test_filter_does_not_redo_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let host = InMemoryHost::new();
        host.add_repo(summary(1, "o/a", 3000));
        host.set_repo_stats("o/a", 80, 80, &[("Python", 100)]);
        host.add_repo(summary(2, "o/down", 2000));
        host.fail_repo("o/down");
        let pipeline = Pipeline::new(Arc::new(host.clone()), config(dir.path()));

        pipeline.crawl().await.unwrap();
        pipeline.filter().await.unwrap();
        let requests = host.request_count();
        pipeline.filter().await.unwrap();

        let admitted = read_jsonl::<RepoRecord>(&pipeline.paths().filtered_repos()).unwrap().records;
        assert_eq!(admitted.len(), 1);
        assert_eq!(admitted[0].pr_count, Some(80));
        // only the failed repository is asked again
        let retried = host.request_count() - requests;
        assert!((1..=3).contains(&retried));
        let decisions = read_jsonl::<FilterDecision>(&pipeline.paths().filter_decisions()).unwrap();
        assert_eq!(decisions.records.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_before_new_units() {
        let dir = tempfile::tempdir().unwrap();
        let host = InMemoryHost::new();
        host.add_repo(summary(1, "o/a", 3000));
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let pipeline = Pipeline::new(Arc::new(host), config(dir.path())).with_shutdown(shutdown);

        pipeline.crawl().await.unwrap();
        pipeline.filter().await.unwrap();
        assert!(read_jsonl::<FilterDecision>(&pipeline.paths().filter_decisions())
            .unwrap()
            .records
            .is_empty());
        assert!(pipeline.summary(Instant::now()).interrupted);
    }

    #[tokio::test]
    async fn test_score_then_refilter_without_judge_calls() {
        let dir = tempfile::tempdir().unwrap();
        let tasks = vec![task("o/r", 1), task("o/r", 2)];
        write_jsonl_atomic(&dir.path().join("tasks.jsonl"), &tasks).unwrap();

        let judge = Arc::new(ScriptedJudge::new(
            vec![
                Ok("reason for evaluation: fine\nissue score: 7".to_string()),
                Ok("reason for evaluation: vague\nissue score: 3".to_string()),
            ],
            "reason for evaluation: fine\nissue score: 7",
        ));
        let pipeline = Pipeline::offline(config(dir.path())).with_judge(judge.clone());

        pipeline.score(false).await.unwrap();
        assert_eq!(judge.calls(), 2);
        let accepted = read_jsonl::<ScoredTaskRecord>(&pipeline.paths().issue_filter_tasks())
            .unwrap()
            .records;
        assert_eq!(accepted.len(), 1);

        assert_eq!(pipeline.refilter(2.0).unwrap(), 2);
        assert_eq!(pipeline.refilter(8.0).unwrap(), 0);
        assert!(pipeline.refilter(11.0).is_err());
        pipeline.score(false).await.unwrap();
        assert_eq!(judge.calls(), 2, "scored tasks are not judged again");
    }

    #[tokio::test]
    async fn test_retry_unscored() {
        let dir = tempfile::tempdir().unwrap();
        write_jsonl_atomic(&dir.path().join("tasks.jsonl"), &[task("o/r", 1)]).unwrap();

        let judge = Arc::new(ScriptedJudge::new(
            vec![Ok("issue score: high".into()), Ok("issue score: high".into())],
            "issue score: 6",
        ));
        let pipeline = Pipeline::new(Arc::new(InMemoryHost::new()), config(dir.path()))
            .with_judge(judge.clone());

        pipeline.score(false).await.unwrap();
        pipeline.score(false).await.unwrap();
        assert_eq!(judge.calls(), 2);

        pipeline.score(true).await.unwrap();
        assert_eq!(judge.calls(), 3);
        let accepted = read_jsonl::<ScoredTaskRecord>(&pipeline.paths().issue_filter_tasks())
            .unwrap()
            .records;
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].quality_score, Some(6.0));
    }

    #[tokio::test]
    async fn test_offline_pipeline_refuses_github_stages() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::offline(config(dir.path()));
        assert!(matches!(pipeline.crawl().await, Err(CurationError::Config(_))));
        assert!(matches!(pipeline.extract().await, Err(CurationError::Config(_))));
        assert_eq!(pipeline.merge().unwrap().tasks.len(), 0);
    }

    #[tokio::test]
    async fn test_score_requires_judge() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = Pipeline::new(Arc::new(InMemoryHost::new()), config(dir.path()));
        assert!(matches!(
            pipeline.score(false).await,
            Err(CurationError::Config(_))
        ));
    }
}
