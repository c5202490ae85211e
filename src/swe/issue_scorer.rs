//! LLM judgement of issue descriptions.
//!
//! The judge rates how well a task's problem statement specifies the fix on
//! a 0-10 scale. Scoring and thresholding are separate steps: raw scores are
//! stored once, and [`apply_threshold`] can be re-run with any threshold
//! without calling the judge again.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::{Stream, StreamExt};
use regex::Regex;
use serde::Deserialize;

use super::{ScoreStatus, ScoredTaskRecord, TaskRecord};
use crate::config::CurationConfig;
use crate::error::ScoringError;
use crate::github::client::backoff_delay;
use crate::llm::{GenerationRequest, LlmProvider, Message};

/// Rubric sent to the judge; `{issue}` is replaced by the problem statement.
pub const ISSUE_EVAL_PROMPT: &str = r#"**Role Definition**
You are an experienced software engineer. You need to evaluate the quality of an Issue to determine if it contains sufficient information for an engineer to unambiguously provide a solution.

**Issue Scoring Standards**
The full score is 10 points (Excellent quality: clear description, explicit requirements for the solution), and 0 points indicates very poor quality (impossible to understand the problem).
Note: If a solution cannot be implemented based on the Issue, the score should not exceed 5.

**Deduction Rules**
Check for deduction items item by item. If the issue has problems or violates the standards, point it out and deduct points in the subsequent evaluation.

**1. Major Deductions (Violating any item results in a 5-point deduction):**
- Key Information Missing:
  (1) Lack of expected results: No description of correct behavior/output; for data processing, missing input examples and expected/error outputs.
  (2) Lack of reproduction steps: No operation flow or runnable code to reproduce the issue.
  (3) Missing version info: Unspecified libraries, frameworks, OS, or environment details.
  (4) Incomplete error logs: Snippets provided without context or stack traces.
- Non-Issue Type Submission:
  (1) Misuse of PR description: Using Pull Request description text directly as an Issue.
  (2) Solved problem: The problem described is already fixed or closed.
  (3) Non-problem inquiry: Content involves release plans, future feature questions, etc., rather than actual defects.

**2. Common Deductions (Deduct points based on severity):**
- Unclear Description:
  (1) Mixed problems: Single Issue contains multiple unrelated problems or logical contradictions.
  (2) Undefined terminology: Uses unexplained jargon or abbreviations.
  (3) Unquantified requirements: Uses vague descriptions (e.g., "reasonable defaults", "user-friendly", "faster") without measurable acceptance criteria.
  (4) Low-quality test cases: Insufficient, overly broad, or missing test cases (passing the test does not prove the issue is resolved).
- Excessive Reliance on External Resources:
  (1) Core info relies on external links: Key descriptions/logs/steps are in links that may fail or be inaccessible.
  (2) Reliance on private repos: Reproduction depends on non-public codebases.

**Input Content**
Issue
{issue}

**Output Format**
Please provide your professional analysis and strictly output a number in the following format:
reason for evaluation: xxx
issue score: 0-10
"#;

/// Highest score on the rubric.
pub const MAX_SCORE: f64 = 10.0;

#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Empty means the provider's default model.
    pub model: String,
    pub temperature: f64,
    /// Attempts per task for transient judge failures.
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Append the pre-fix issue discussion to the prompt.
    pub include_hints: bool,
    pub max_workers: usize,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            temperature: 0.0,
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            include_hints: false,
            max_workers: 40,
        }
    }
}

impl From<&CurationConfig> for ScorerConfig {
    fn from(config: &CurationConfig) -> Self {
        Self {
            model: config.judge.model.clone(),
            temperature: config.judge.temperature,
            max_attempts: config.judge.max_attempts.max(1),
            base_delay: Duration::from_millis(config.judge.base_delay_ms),
            include_hints: config.judge.include_hints,
            max_workers: config.max_workers.max(1),
        }
    }
}

/// A parsed judgement.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub score: f64,
    pub rationale: String,
}

fn reason_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)reason for evaluation\s*:(.*?)issue score\s*:")
            .expect("Invalid regex for evaluation reason")
    })
}

fn score_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)issue score\s*:\s*\**\s*(-?\d+(?:\.\d+)?)")
            .expect("Invalid regex for issue score")
    })
}

fn fenced_json_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("Invalid regex for fenced JSON")
    })
}

#[derive(Debug, Deserialize)]
struct JsonVerdict {
    score: serde_json::Value,
    #[serde(default, alias = "reason")]
    rationale: Option<String>,
}

/// Build the judge prompt for a task.
pub fn build_prompt(task: &TaskRecord, include_hints: bool) -> String {
    let mut issue = task.problem_statement.clone();
    if include_hints && !task.hints_text.trim().is_empty() {
        issue.push_str("\nDiscussion:\n");
        issue.push_str(&task.hints_text);
    }
    ISSUE_EVAL_PROMPT.replace("{issue}", &issue)
}

/// Parse a judge response.
///
/// Accepts the rubric's `reason for evaluation: ... issue score: N` layout or
/// a JSON object `{"score": N, "rationale" | "reason": "..."}`, optionally in
/// a code fence. Scores outside `[0, 10]` are rejected.
pub fn parse_judge_response(content: &str) -> Result<JudgeVerdict, ScoringError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ScoringError::EmptyResponse);
    }

    let verdict = match parse_json_verdict(content) {
        Some(verdict) => verdict?,
        None => parse_text_verdict(content)?,
    };

    if !(0.0..=MAX_SCORE).contains(&verdict.score) {
        return Err(ScoringError::OutOfRange(verdict.score));
    }
    Ok(verdict)
}

/// `None` when the content holds no JSON object with a `score` field.
fn parse_json_verdict(content: &str) -> Option<Result<JudgeVerdict, ScoringError>> {
    let candidate = match fenced_json_regex().captures(content) {
        Some(caps) => caps.get(1)?.as_str().to_string(),
        None => {
            let start = content.find('{')?;
            let end = content.rfind('}')?;
            if end <= start {
                return None;
            }
            content[start..=end].to_string()
        }
    };

    let parsed: JsonVerdict = serde_json::from_str(&candidate).ok()?;
    let score = match &parsed.score {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    Some(match score {
        Some(score) => Ok(JudgeVerdict {
            score,
            rationale: parsed.rationale.unwrap_or_default().trim().to_string(),
        }),
        None => Err(ScoringError::Unparsable(format!(
            "non-numeric score {}",
            parsed.score
        ))),
    })
}

fn parse_text_verdict(content: &str) -> Result<JudgeVerdict, ScoringError> {
    let score = score_regex()
        .captures(content)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .ok_or_else(|| ScoringError::Unparsable(snippet(content)))?;
    let rationale = reason_regex()
        .captures(content)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    Ok(JudgeVerdict { score, rationale })
}

fn snippet(content: &str) -> String {
    const MAX_CHARS: usize = 120;
    let mut out: String = content.chars().take(MAX_CHARS).collect();
    if content.chars().count() > MAX_CHARS {
        out.push_str("...");
    }
    out
}

/// Set `accepted` on every record: scored and at or above `threshold`.
/// Unscored records are never accepted.
pub fn apply_threshold(records: Vec<ScoredTaskRecord>, threshold: f64) -> Vec<ScoredTaskRecord> {
    records
        .into_iter()
        .map(|mut record| {
            record.accepted = record.status == ScoreStatus::Scored
                && record.quality_score.is_some_and(|score| score >= threshold);
            record
        })
        .collect()
}

/// Judges issue descriptions through an [`LlmProvider`].
pub struct IssueQualityScorer {
    judge: Arc<dyn LlmProvider>,
    config: ScorerConfig,
}

impl IssueQualityScorer {
    pub fn new(judge: Arc<dyn LlmProvider>, config: ScorerConfig) -> Self {
        Self { judge, config }
    }

    pub fn config(&self) -> &ScorerConfig {
        &self.config
    }

    /// Judge one task.
    ///
    /// Transient failures are retried with exponential backoff up to
    /// `max_attempts`; an unusable response gets one more try.
    pub async fn judge(&self, task: &TaskRecord) -> Result<JudgeVerdict, ScoringError> {
        let prompt = build_prompt(task, self.config.include_hints);
        let max_attempts = self.config.max_attempts.max(1);
        let mut transient_failures = 0u32;
        let mut invalid_responses = 0u32;

        loop {
            let request = GenerationRequest::new(
                self.config.model.clone(),
                vec![Message::user(prompt.clone())],
            )
            .with_temperature(self.config.temperature);

            match self.judge.generate(request).await {
                Ok(response) => {
                    let content = response.first_content().unwrap_or_default();
                    match parse_judge_response(content) {
                        Ok(verdict) => return Ok(verdict),
                        Err(e) if invalid_responses == 0 => {
                            invalid_responses += 1;
                            tracing::warn!(
                                instance_id = %task.instance_id,
                                error = %e,
                                "Unusable judge response, asking again"
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_transient() => {
                    transient_failures += 1;
                    if transient_failures >= max_attempts {
                        return Err(e.into());
                    }
                    let delay = backoff_delay(self.config.base_delay, transient_failures);
                    tracing::warn!(
                        instance_id = %task.instance_id,
                        attempt = transient_failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Judge call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Judge one task, turning any failure into an unscored record.
    pub async fn score(&self, task: TaskRecord) -> ScoredTaskRecord {
        match self.judge(&task).await {
            Ok(verdict) => {
                tracing::debug!(instance_id = %task.instance_id, score = verdict.score, "Issue scored");
                ScoredTaskRecord::scored(task, verdict.score, verdict.rationale)
            }
            Err(e) => {
                tracing::warn!(instance_id = %task.instance_id, error = %e, "Issue left unscored");
                ScoredTaskRecord::unscored(task, e.to_string())
            }
        }
    }

    /// Judge tasks with at most `max_workers` in flight. Completion order.
    pub fn score_all<'a, I>(&'a self, tasks: I) -> impl Stream<Item = ScoredTaskRecord> + 'a
    where
        I: IntoIterator<Item = TaskRecord>,
        I::IntoIter: Send + 'a,
    {
        futures::stream::iter(tasks)
            .map(move |task| self.score(task))
            .buffer_unordered(self.config.max_workers.max(1))
    }
}
