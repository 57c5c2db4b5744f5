//! The LLM Gateway: a uniform `complete`/`embed` interface over multiple
//! providers (cloud chat APIs and a local OpenAI-compatible server), with
//! provider-level rate limiting and a Transient/Permanent failure
//! taxonomy that the stage retry loop reads directly.

mod gateway;
mod rate_limiter;
pub mod providers;

pub use gateway::{LlmGateway, ProviderHealth};
pub use rate_limiter::TokenBucket;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LLMProviderType {
    Anthropic,
    OpenAi,
    Google,
    Ollama,
}

impl std::fmt::Display for LLMProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LLMProviderType::Anthropic => "anthropic",
            LLMProviderType::OpenAi => "openai",
            LLMProviderType::Google => "google",
            LLMProviderType::Ollama => "ollama",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A request against the gateway. `json_mode` asks the provider to
/// constrain output to a JSON object where supported; stages that need
/// structured output still validate the response themselves (a parse
/// failure is not a gateway error, per §4.2).
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub provider: LLMProviderType,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
    pub stop: Vec<String>,
    pub json_mode: bool,
}

#[derive(Debug, Clone)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub finish_reason: String,
    pub usage: Usage,
    pub latency_ms: u64,
}

/// Failure taxonomy for gateway calls (§4.2 "Failure semantics"):
/// network/5xx/429 are `Transient` (retry-eligible by the stage loop);
/// 4xx auth/bad-request are `Permanent`.
#[derive(Debug, Error, Clone)]
pub enum LlmError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("permanent provider error: {0}")]
    Permanent(String),
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }
}

pub type LlmResult<T> = std::result::Result<T, LlmError>;

/// The provider abstraction: each concrete client adapts its wire format
/// to [`CompletionRequest`]/[`CompletionResponse`] and maps its own error
/// surface onto [`LlmError`].
#[async_trait::async_trait]
pub trait LlmProviderClient: Send + Sync {
    fn provider_type(&self) -> LLMProviderType;
    async fn complete(&self, request: &CompletionRequest, api_key: &str) -> LlmResult<CompletionResponse>;
    async fn embed(&self, text: &str, model: &str, api_key: &str) -> LlmResult<Vec<f32>>;
}
