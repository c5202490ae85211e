//! End-to-end curation scenarios against an in-memory code host and a
//! scripted judge.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use regex::Regex;

use swe_curator::github::types::{CommitAuthor, CommitDetail, GitRef};
use swe_curator::github::{Issue, PullCommit, PullRequest, RepoSummary};
use swe_curator::llm::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
use swe_curator::swe::store::read_jsonl;
use swe_curator::swe::{RepoRecord, ScoreStatus, Shutdown};
use swe_curator::{CurationConfig, InMemoryHost, LlmError, Pipeline, ScoredTaskRecord, TaskRecord};

/// Scores an issue by the `SCOREn` marker in its text; answers with an
/// unparsable score when there is none.
struct MarkerJudge {
    calls: AtomicUsize,
}

impl MarkerJudge {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MarkerJudge {
    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = &request.messages[0].content;
        let marker = Regex::new(r"SCORE(\d+)").unwrap();
        let reply = match marker.captures(prompt) {
            Some(caps) => format!(
                "reason for evaluation: scripted\nissue score: {}",
                &caps[1]
            ),
            None => "reason for evaluation: unsure\nissue score: high".to_string(),
        };
        Ok(GenerationResponse {
            id: "scripted".to_string(),
            model: "marker".to_string(),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(reply),
                finish_reason: "stop".to_string(),
                reasoning: None,
            }],
            usage: Usage::default(),
        })
    }
}

fn repo(id: u64, name: &str, stars: u64) -> RepoSummary {
    RepoSummary {
        id,
        full_name: name.to_string(),
        stargazers_count: stars,
        forks_count: 40,
        open_issues_count: 5,
        language: Some("Python".to_string()),
        default_branch: "main".to_string(),
    }
}

fn pull(number: u64, body: &str) -> PullRequest {
    let created = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap() + chrono::Duration::days(number as i64);
    PullRequest {
        number,
        title: format!("PR {}", number),
        body: Some(body.to_string()),
        state: "closed".to_string(),
        created_at: created,
        merged_at: Some(created + chrono::Duration::hours(3)),
        merge_commit_sha: Some(format!("m{}", number)),
        base: GitRef {
            sha: format!("base-{}", number),
            ref_name: "main".to_string(),
        },
        head: GitRef {
            sha: format!("head-{}", number),
            ref_name: format!("topic-{}", number),
        },
    }
}

fn commit(repo: &str, sha: &str) -> PullCommit {
    PullCommit {
        sha: sha.to_string(),
        html_url: format!("https://github.com/{}/commit/{}", repo, sha),
        commit: CommitDetail {
            message: "fix".to_string(),
            author: None,
            committer: Some(CommitAuthor {
                date: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            }),
        },
    }
}

fn issue(repo: &str, number: u64, title: &str) -> Issue {
    Issue {
        number,
        title: title.to_string(),
        body: Some("Steps: run `tool --check`. Expected exit 0, got a traceback.".to_string()),
        html_url: format!("https://github.com/{}/issues/{}", repo, number),
        pull_request: None,
    }
}

fn diff(module: &str) -> String {
    format!(
        "diff --git a/pkg/{m}.py b/pkg/{m}.py\n--- a/pkg/{m}.py\n+++ b/pkg/{m}.py\n@@ -1 +1 @@\n-return 1\n+return 2\n\
diff --git a/tests/test_{m}.py b/tests/test_{m}.py\n--- a/tests/test_{m}.py\n+++ b/tests/test_{m}.py\n@@ -1 +1 @@\n-assert f() == 1\n+assert f() == 2\n",
        m = module
    )
}

fn add_fix(host: &InMemoryHost, repo: &str, pr: u64, issue_number: u64, issue_title: &str) {
    host.add_pull(repo, pull(pr, &format!("Fixes #{}", issue_number)));
    host.set_commits(repo, pr, vec![commit(repo, &format!("c{}", pr))]);
    host.set_diff(repo, pr, &diff(&format!("mod{}", pr)));
    host.add_issue(repo, issue(repo, issue_number, issue_title));
}

/// Three repositories around the 1000-star line; two qualify and hold
/// three fixing PRs between them.
fn scenario_host() -> InMemoryHost {
    let host = InMemoryHost::new();
    host.add_repo(repo(1, "acme/small", 500));
    host.add_repo(repo(2, "acme/mid", 1500));
    host.add_repo(repo(3, "acme/top", 2000));
    for name in ["acme/small", "acme/mid", "acme/top"] {
        host.set_repo_stats(name, 120, 90, &[("Python", 9_000), ("Shell", 1_000)]);
    }

    add_fix(&host, "acme/top", 1, 42, "Parser fails on empty file SCORE7");
    add_fix(&host, "acme/top", 2, 43, "Something is off SCORE3");
    add_fix(&host, "acme/mid", 5, 7, "Crash when config missing SCORE5");
    host.add_pull("acme/mid", pull(6, "Bump dependencies"));
    host
}

fn config(dir: &Path) -> CurationConfig {
    CurationConfig::new()
        .with_language("Python")
        .with_star_range(1000, None)
        .with_output_dir(dir)
}

fn instance_ids<T>(records: &[T], id: impl Fn(&T) -> &str) -> Vec<String> {
    let mut ids: Vec<String> = records.iter().map(|r| id(r).to_string()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn full_run_produces_scored_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let judge = Arc::new(MarkerJudge::new());
    let pipeline = Pipeline::new(Arc::new(scenario_host()), config(dir.path())).with_judge(judge.clone());

    pipeline.run_all().await.unwrap();
    let paths = pipeline.paths();

    let crawled = read_jsonl::<RepoRecord>(&paths.raw_repos()).unwrap().records;
    let names: Vec<&str> = crawled.iter().map(|r| r.full_name.as_str()).collect();
    assert_eq!(names, vec!["acme/top", "acme/mid"]);

    let tasks = read_jsonl::<TaskRecord>(&paths.tasks()).unwrap().records;
    assert_eq!(
        instance_ids(&tasks, |t| t.instance_id.as_str()),
        vec!["acme__mid-5", "acme__top-1", "acme__top-2"]
    );
    for task in &tasks {
        assert!(!task.issue_numbers.is_empty());
        assert_ne!(task.base_commit, format!("head-{}", task.pull_number));
        assert!(task.test_patch.contains("tests/test_"));
        assert!(!task.patch.contains("tests/test_"));
    }

    let scores = read_jsonl::<ScoredTaskRecord>(&paths.issue_scores()).unwrap().records;
    assert_eq!(scores.len(), 3);
    assert!(scores.iter().all(|s| s.status == ScoreStatus::Scored));

    let accepted = read_jsonl::<ScoredTaskRecord>(&paths.issue_filter_tasks()).unwrap().records;
    assert_eq!(
        instance_ids(&accepted, |r| r.instance_id()),
        vec!["acme__mid-5", "acme__top-1"]
    );
    assert_eq!(judge.calls(), 3);

    let summary = pipeline.summary(std::time::Instant::now());
    assert_eq!(summary.counts.fetched, 2);
    assert_eq!(summary.counts.admitted, 2);
    assert_eq!(summary.counts.extracted, 3);
    assert_eq!(summary.counts.accepted, 2);
    assert!(summary.skipped.iter().any(|s| s.key == "acme/mid#6"));
}

#[tokio::test]
async fn refilter_reuses_stored_scores() {
    let dir = tempfile::tempdir().unwrap();
    let judge = Arc::new(MarkerJudge::new());
    let pipeline = Pipeline::new(Arc::new(scenario_host()), config(dir.path())).with_judge(judge.clone());
    pipeline.run_all().await.unwrap();
    let calls = judge.calls();

    assert_eq!(pipeline.refilter(6.0).unwrap(), 1);
    assert_eq!(pipeline.refilter(0.0).unwrap(), 3);
    assert_eq!(judge.calls(), calls);
}

#[tokio::test]
async fn rerun_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let host = scenario_host();
    let judge = Arc::new(MarkerJudge::new());

    let first = Pipeline::new(Arc::new(host.clone()), config(dir.path())).with_judge(judge.clone());
    first.run_all().await.unwrap();
    let tasks_before = fs::read(first.paths().tasks()).unwrap();
    let accepted_before = fs::read(first.paths().issue_filter_tasks()).unwrap();
    let calls = judge.calls();

    let second = Pipeline::new(Arc::new(host), config(dir.path())).with_judge(judge.clone());
    second.run_all().await.unwrap();

    assert_eq!(fs::read(second.paths().tasks()).unwrap(), tasks_before);
    assert_eq!(fs::read(second.paths().issue_filter_tasks()).unwrap(), accepted_before);
    assert_eq!(judge.calls(), calls);
    let raw = read_jsonl::<RepoRecord>(&second.paths().raw_repos()).unwrap().records;
    assert_eq!(raw.len(), 2);
}

#[tokio::test]
async fn interrupted_run_resumes_to_same_output() {
    let reference_dir = tempfile::tempdir().unwrap();
    let reference = Pipeline::new(Arc::new(scenario_host()), config(reference_dir.path()))
        .with_judge(Arc::new(MarkerJudge::new()));
    reference.run_all().await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let shutdown = Shutdown::new();
    let interrupted = Pipeline::new(Arc::new(scenario_host()), config(dir.path()))
        .with_judge(Arc::new(MarkerJudge::new()))
        .with_shutdown(shutdown.clone());
    interrupted.crawl().await.unwrap();
    interrupted.filter().await.unwrap();
    shutdown.trigger();
    interrupted.run_all().await.unwrap();
    assert!(!interrupted.paths().tasks().exists());

    let resumed = Pipeline::new(Arc::new(scenario_host()), config(dir.path()))
        .with_judge(Arc::new(MarkerJudge::new()));
    resumed.run_all().await.unwrap();

    assert_eq!(
        fs::read(resumed.paths().tasks()).unwrap(),
        fs::read(reference.paths().tasks()).unwrap()
    );
    assert_eq!(
        fs::read(resumed.paths().issue_filter_tasks()).unwrap(),
        fs::read(reference.paths().issue_filter_tasks()).unwrap()
    );
}

#[tokio::test]
async fn unparsable_judgement_leaves_task_unscored() {
    let dir = tempfile::tempdir().unwrap();
    let host = InMemoryHost::new();
    host.add_repo(repo(9, "acme/lib", 3000));
    host.set_repo_stats("acme/lib", 100, 100, &[("Python", 1)]);
    add_fix(&host, "acme/lib", 11, 12, "Unclear report without marker");

    let judge = Arc::new(MarkerJudge::new());
    let pipeline = Pipeline::new(Arc::new(host), config(dir.path())).with_judge(judge.clone());
    pipeline.run_all().await.unwrap();

    let scores = read_jsonl::<ScoredTaskRecord>(&pipeline.paths().issue_scores()).unwrap().records;
    assert_eq!(scores.len(), 1);
    assert_eq!(scores[0].status, ScoreStatus::Unscored);
    assert!(!scores[0].accepted);
    assert_eq!(judge.calls(), 2);
    assert!(read_jsonl::<ScoredTaskRecord>(&pipeline.paths().issue_filter_tasks())
        .unwrap()
        .records
        .is_empty());
}
