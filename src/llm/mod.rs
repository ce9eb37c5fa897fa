//! The LLM client contract and C7 LLM Pass Runner (§4.7, §6).
//!
//! `LlmClient` mirrors the teacher's `llm::LlmClient` trait (one async
//! `completion` method implemented by `GeminiClient`/`OllamaClient`), kept
//! as an interface-only contract since the wire format is out of scope here
//! too. The concrete HTTP adapters are not reimplemented; callers bring
//! their own.

pub mod pass;

use async_trait::async_trait;

use crate::error::ConversionError;

/// One LLM inference call. Implementations own their own HTTP client, auth,
/// and retry-irrelevant transport details; retries are applied by the
/// caller via [`crate::retry`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn completion(&self, prompt: &str) -> Result<String, ConversionError>;
}
