//! swe-curator: mines GitHub history into issue-grounded SWE task instances.
//!
//! The pipeline crawls repositories of a language, filters them by activity,
//! extracts one task per merged pull request that resolves an issue, merges
//! the per-repository shards and judges issue quality with an LLM. Every
//! stage writes JSONL and keeps its own checkpoint, so runs can be resumed.

pub mod cli;
pub mod config;
pub mod error;
pub mod github;
pub mod llm;
pub mod swe;

pub use config::CurationConfig;
pub use error::{
    ConfigError, CurationError, DataIntegrityError, FetchError, LlmError, ScoringError, StoreError,
};
pub use github::{CodeHost, CredentialPool, GitHubClient};
#[cfg(any(test, feature = "test-support"))]
pub use github::InMemoryHost;
pub use swe::{Pipeline, RepoRecord, ScoredTaskRecord, TaskRecord};
