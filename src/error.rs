//! Error types for swe-curator operations.
//!
//! One enum per concern:
//! - Configuration (fatal, aborts before any network activity)
//! - GitHub fetches (transient or terminal per request)
//! - Data integrity of mined records
//! - Issue quality scoring and the LLM judge
//! - JSONL stores and checkpoints

use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Credential file '{0}' is empty")]
    EmptyCredentialFile(String),

    #[error("No credentials supplied")]
    EmptyCredentials,

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors surfaced by the code host client after its own retry policy ran.
///
/// Rate limiting never appears here: the client rotates credentials and
/// retries the same request instead.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected HTTP status {status} for {url}: {message}")]
    Status {
        status: u16,
        url: String,
        message: String,
    },

    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl FetchError {
    /// Whether another attempt might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Network(_) | FetchError::Server { .. })
    }
}

/// Inconsistencies in mined data. The affected unit is skipped.
#[derive(Debug, Error)]
pub enum DataIntegrityError {
    #[error("Duplicate instance id '{0}'")]
    DuplicateInstance(String),

    #[error("Malformed diff: {0}")]
    MalformedDiff(String),

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Merge base equals PR head {0}")]
    BaseCommitEqualsHead(String),
}

/// Errors that can occur during LLM operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: OPENAI_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl LlmError {
    /// Network hiccups, rate limits and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::RequestFailed(msg) => {
                let lowered = msg.to_lowercase();
                lowered.contains("timeout")
                    || lowered.contains("timed out")
                    || lowered.contains("connection")
                    || lowered.contains("temporarily")
            }
            LlmError::RateLimited(_) => true,
            LlmError::ApiError { code, .. } => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Errors produced while judging an issue description.
#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("Judge call failed: {0}")]
    Judge(#[from] LlmError),

    #[error("Judge returned an empty response")]
    EmptyResponse,

    #[error("Could not find a score in judge response: {0}")]
    Unparsable(String),

    #[error("Score {0} is outside the 0-10 range")]
    OutOfRange(f64),
}

impl ScoringError {
    /// Responses that are well-formed HTTP but unusable content.
    pub fn is_invalid_response(&self) -> bool {
        matches!(
            self,
            ScoringError::EmptyResponse | ScoringError::Unparsable(_) | ScoringError::OutOfRange(_)
        )
    }
}

/// Errors reading or writing JSONL stores and checkpoints.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// Top-level error for a stage run.
#[derive(Debug, Error)]
pub enum CurationError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Integrity(#[from] DataIntegrityError),

    #[error(transparent)]
    Scoring(#[from] ScoringError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_transient() {
        assert!(FetchError::Network("connection reset".into()).is_transient());
        assert!(FetchError::Server {
            status: 502,
            message: "bad gateway".into()
        }
        .is_transient());
        assert!(!FetchError::NotFound("/repos/a/b".into()).is_transient());
        assert!(!FetchError::RetriesExhausted {
            attempts: 5,
            last: "x".into()
        }
        .is_transient());
    }

    #[test]
    fn test_llm_error_transient() {
        assert!(LlmError::RateLimited("slow down".into()).is_transient());
        assert!(LlmError::ApiError {
            code: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(LlmError::RequestFailed("operation timed out".into()).is_transient());
        assert!(!LlmError::ApiError {
            code: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!LlmError::ParseError("bad json".into()).is_transient());
        assert!(!LlmError::MissingApiKey.is_transient());
    }

    #[test]
    fn test_scoring_error_invalid_response() {
        assert!(ScoringError::OutOfRange(11.0).is_invalid_response());
        assert!(ScoringError::Unparsable("high".into()).is_invalid_response());
        assert!(!ScoringError::Judge(LlmError::MissingApiKey).is_invalid_response());
    }

    #[test]
    fn test_empty_credential_message() {
        let err = ConfigError::EmptyCredentialFile("tokens.txt".into());
        assert_eq!(err.to_string(), "Credential file 'tokens.txt' is empty");
    }
}
