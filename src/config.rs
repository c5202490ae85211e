//! Curation run configuration.
//!
//! Values come from an optional YAML file, then environment variables and
//! CLI flags override them. `validate` runs before any stage touches the
//! network so a bad setting fails fast.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default judge endpoint (OpenAI-compatible).
pub const DEFAULT_JUDGE_API_BASE: &str = "https://api.openai.com/v1";

/// Default judge model.
pub const DEFAULT_JUDGE_MODEL: &str = "deepseek-v3.2";

/// Settings for the GitHub client's transient-failure retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts per request before giving up on network/5xx errors.
    pub max_attempts: u32,
    /// First backoff delay; doubled on every further attempt.
    pub base_delay_ms: u64,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// API root, overridable for GitHub Enterprise.
    pub api_base: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            timeout_secs: 30,
            api_base: "https://api.github.com".to_string(),
        }
    }
}

impl FetchConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Settings for the LLM judge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub api_base: String,
    pub model: String,
    /// Attempts per task for transient judge failures.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub temperature: f64,
    /// Append the pre-fix issue discussion to the prompt.
    pub include_hints: bool,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_JUDGE_API_BASE.to_string(),
            model: DEFAULT_JUDGE_MODEL.to_string(),
            max_attempts: 3,
            base_delay_ms: 1000,
            temperature: 0.0,
            include_hints: false,
        }
    }
}

/// Full configuration of a curation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    // Crawl
    /// Target language, as GitHub reports it (e.g. "Python", "Rust").
    pub language: String,
    pub min_stars: u32,
    /// Upper star bound; `None` means open-ended.
    pub max_stars: Option<u32>,

    // Repository filter
    pub min_pr: u64,
    pub min_issues: u64,
    pub min_forks: u64,
    /// Minimum share of repository bytes written in `language`.
    pub min_language_ratio: f64,

    // Extraction
    /// Only PRs created on or after this date are mined. `None` mines all history.
    pub cutoff_date: Option<NaiveDate>,
    /// Drop instances without a test patch or code edit in `language`.
    pub require_test_patch: bool,

    // Scoring
    pub score_threshold: f64,

    // Shared
    pub max_workers: usize,
    pub credential_file: PathBuf,
    pub output_dir: PathBuf,
    pub fetch: FetchConfig,
    pub judge: JudgeConfig,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            language: "Python".to_string(),
            min_stars: 1000,
            max_stars: None,

            min_pr: 50,
            min_issues: 50,
            min_forks: 10,
            min_language_ratio: 0.5,

            cutoff_date: None,
            require_test_patch: true,

            score_threshold: 5.0,

            max_workers: 40,
            credential_file: PathBuf::from("tokens.txt"),
            output_dir: PathBuf::from("./curation-output"),
            fetch: FetchConfig::default(),
            judge: JudgeConfig::default(),
        }
    }
}

impl CurationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a YAML configuration file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply `CURATOR_*` environment overrides on top of the current values.
    ///
    /// # Environment Variables
    ///
    /// - `CURATOR_LANGUAGE`
    /// - `CURATOR_MIN_STARS`
    /// - `CURATOR_MAX_WORKERS`
    /// - `CURATOR_SCORE_THRESHOLD`
    /// - `CURATOR_CUTOFF_DATE` (YYYY-MM-DD)
    /// - `CURATOR_CREDENTIAL_FILE`
    /// - `OPENAI_API_BASE_URL`, `CURATOR_JUDGE_MODEL`
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(value) = env::var("CURATOR_LANGUAGE") {
            self.language = value;
        }
        if let Some(value) = parse_env_value::<u32>("CURATOR_MIN_STARS")? {
            self.min_stars = value;
        }
        if let Some(value) = parse_env_value::<usize>("CURATOR_MAX_WORKERS")? {
            self.max_workers = value;
        }
        if let Some(value) = parse_env_value::<f64>("CURATOR_SCORE_THRESHOLD")? {
            self.score_threshold = value;
        }
        if let Ok(value) = env::var("CURATOR_CUTOFF_DATE") {
            self.cutoff_date = Some(parse_date("CURATOR_CUTOFF_DATE", &value)?);
        }
        if let Ok(value) = env::var("CURATOR_CREDENTIAL_FILE") {
            self.credential_file = PathBuf::from(value);
        }
        if let Ok(value) = env::var("OPENAI_API_BASE_URL") {
            self.judge.api_base = value;
        }
        if let Ok(value) = env::var("CURATOR_JUDGE_MODEL") {
            self.judge.model = value;
        }
        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.language.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "language must not be empty".to_string(),
            ));
        }
        if let Some(max) = self.max_stars {
            if max < self.min_stars {
                return Err(ConfigError::ValidationFailed(format!(
                    "max_stars ({}) must be >= min_stars ({})",
                    max, self.min_stars
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.min_language_ratio) {
            return Err(ConfigError::ValidationFailed(format!(
                "min_language_ratio must be between 0.0 and 1.0, got {}",
                self.min_language_ratio
            )));
        }
        if !(0.0..=10.0).contains(&self.score_threshold) {
            return Err(ConfigError::ValidationFailed(format!(
                "score_threshold must be between 0 and 10, got {}",
                self.score_threshold
            )));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }
        if self.fetch.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "fetch.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.judge.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "judge.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.judge.model.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "judge.model must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_star_range(mut self, min_stars: u32, max_stars: Option<u32>) -> Self {
        self.min_stars = min_stars;
        self.max_stars = max_stars;
        self
    }

    pub fn with_thresholds(mut self, min_pr: u64, min_issues: u64, min_forks: u64) -> Self {
        self.min_pr = min_pr;
        self.min_issues = min_issues;
        self.min_forks = min_forks;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_cutoff_date(mut self, cutoff_date: NaiveDate) -> Self {
        self.cutoff_date = Some(cutoff_date);
        self
    }

    pub fn with_score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn with_credential_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credential_file = path.into();
        self
    }

    pub fn with_output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }
}

/// Parse `YYYY-MM-DD`.
pub fn parse_date(key: &str, value: &str) -> Result<NaiveDate, ConfigError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("expected YYYY-MM-DD: {}", e),
    })
}

fn parse_env_value<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
