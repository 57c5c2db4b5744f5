//! Concrete [`LlmProviderClient`](crate::llm::LlmProviderClient)
//! implementations. Each adapts its provider's wire format to the
//! gateway's uniform request/response shape and maps its own error
//! surface onto [`crate::llm::LlmError`]'s Transient/Permanent taxonomy
//! (§4.2 "Provider abstraction").

mod anthropic;
mod google;
mod ollama;
mod openai;

pub use anthropic::AnthropicClient;
pub use google::GoogleClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

use crate::llm::LlmError;

/// Maps an HTTP status code to the Transient/Permanent split common to
/// every provider client: network/5xx/429 are retry-eligible, 4xx
/// (auth, bad request) are not.
pub(super) fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmError {
    if status.as_u16() == 429 || status.is_server_error() {
        LlmError::Transient(format!("http {status}: {body}"))
    } else {
        LlmError::Permanent(format!("http {status}: {body}"))
    }
}

pub(super) fn classify_transport_error(err: &reqwest::Error) -> LlmError {
    if err.is_timeout() || err.is_connect() {
        LlmError::Transient(err.to_string())
    } else {
        LlmError::Permanent(err.to_string())
    }
}
