//! LLM integration for swe-curator.
//!
//! The issue quality judge talks to any OpenAI-compatible chat completions
//! endpoint through [`ChatCompletionsClient`]. Stages depend only on the
//! [`LlmProvider`] trait, so tests can script the judge.
//!
//! ```ignore
//! use swe_curator::llm::{ChatCompletionsClient, GenerationRequest, LlmProvider, Message};
//!
//! let client = ChatCompletionsClient::from_env("deepseek-v3.2".to_string())?;
//! let request = GenerationRequest::new("", vec![Message::user("Rate this issue")]);
//! let response = client.generate(request).await?;
//! ```

mod client;

pub use client::{
    mask_secret, ChatCompletionsClient, Choice, GenerationRequest, GenerationResponse,
    LlmProvider, Message, Usage,
};
