//! Progress counters, periodic progress logging and the end-of-run summary.
//!
//! Workers increment shared atomic counters and record the units they had to
//! skip or give up on; a background monitor logs the counters periodically so
//! long crawls can be followed without reading individual log lines.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::JoinHandle;

/// Snapshot of the counters at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    /// Repositories emitted by the crawler.
    pub fetched: usize,
    /// Repositories the filter decided on.
    pub filtered: usize,
    /// Repositories the filter admitted.
    pub admitted: usize,
    /// Task records written by the extractor.
    pub extracted: usize,
    /// Records in the merged dataset.
    pub merged: usize,
    /// Tasks the judge produced a verdict for (scored or unscored).
    pub scored: usize,
    /// Tasks at or above the score threshold.
    pub accepted: usize,
    #[serde(skip)]
    pub elapsed: Duration,
}

/// A unit of work that was skipped or failed, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitIssue {
    pub stage: String,
    pub key: String,
    pub reason: String,
}

/// Shared atomic counters for pipeline progress tracking.
///
/// Cloned into workers; clones share state.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    pub fetched: Arc<AtomicUsize>,
    pub filtered: Arc<AtomicUsize>,
    pub admitted: Arc<AtomicUsize>,
    pub extracted: Arc<AtomicUsize>,
    pub merged: Arc<AtomicUsize>,
    pub scored: Arc<AtomicUsize>,
    pub accepted: Arc<AtomicUsize>,
    failures: Arc<Mutex<Vec<UnitIssue>>>,
    skips: Arc<Mutex<Vec<UnitIssue>>>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// A unit that could not be processed this run; it will be retried on the next.
    pub fn record_failure(&self, stage: &str, key: &str, reason: impl fmt::Display) {
        push_issue(&self.failures, stage, key, reason);
    }

    /// A unit deliberately left out (no linked issue, below threshold, ...).
    pub fn record_skip(&self, stage: &str, key: &str, reason: impl fmt::Display) {
        push_issue(&self.skips, stage, key, reason);
    }

    pub fn snapshot(&self, start: Instant) -> ProgressSnapshot {
        ProgressSnapshot {
            fetched: self.fetched.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            admitted: self.admitted.load(Ordering::Relaxed),
            extracted: self.extracted.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            scored: self.scored.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            elapsed: start.elapsed(),
        }
    }

    /// Final report of the run.
    pub fn summary(&self, start: Instant, interrupted: bool) -> RunSummary {
        let snapshot = self.snapshot(start);
        RunSummary {
            elapsed_secs: snapshot.elapsed.as_secs_f64(),
            counts: snapshot,
            interrupted,
            failures: lock_issues(&self.failures),
            skipped: lock_issues(&self.skips),
        }
    }
}

fn push_issue(list: &Mutex<Vec<UnitIssue>>, stage: &str, key: &str, reason: impl fmt::Display) {
    let issue = UnitIssue {
        stage: stage.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    };
    list.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(issue);
}

fn lock_issues(list: &Mutex<Vec<UnitIssue>>) -> Vec<UnitIssue> {
    list.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// End-of-run report: counts per stage plus every skipped or failed unit.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub counts: ProgressSnapshot,
    pub elapsed_secs: f64,
    pub interrupted: bool,
    pub failures: Vec<UnitIssue>,
    pub skipped: Vec<UnitIssue>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.counts;
        writeln!(f, "Run summary ({:.1}s)", self.elapsed_secs)?;
        if self.interrupted {
            writeln!(f, "  interrupted: yes (rerun to resume)")?;
        }
        writeln!(f, "  repositories fetched:  {}", c.fetched)?;
        writeln!(f, "  repositories filtered: {} ({} admitted)", c.filtered, c.admitted)?;
        writeln!(f, "  tasks extracted:       {}", c.extracted)?;
        writeln!(f, "  tasks merged:          {}", c.merged)?;
        writeln!(f, "  tasks scored:          {} ({} accepted)", c.scored, c.accepted)?;
        writeln!(f, "  skipped units:         {}", self.skipped.len())?;
        writeln!(f, "  failed units:          {}", self.failures.len())?;
        for failure in &self.failures {
            writeln!(f, "    [{}] {}: {}", failure.stage, failure.key, failure.reason)?;
        }
        Ok(())
    }
}

/// A background task that periodically logs pipeline progress.
///
/// Call [`ProgressMonitor::stop`] to cancel.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Start logging `counters` every `interval`.
    pub fn start(counters: ProgressCounters, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot(start);
                let elapsed_secs = snap.elapsed.as_secs_f64();
                let extracted_per_min = if elapsed_secs > 0.0 {
                    snap.extracted as f64 / elapsed_secs * 60.0
                } else {
                    0.0
                };

                tracing::info!(
                    fetched = snap.fetched,
                    filtered = snap.filtered,
                    admitted = snap.admitted,
                    extracted = snap.extracted,
                    merged = snap.merged,
                    scored = snap.scored,
                    accepted = snap.accepted,
                    elapsed_secs = snap.elapsed.as_secs(),
                    extracted_per_min = format!("{:.2}", extracted_per_min),
                    "Curation progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signal the background monitor to stop and wait for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
