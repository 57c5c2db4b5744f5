use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::llm::{
    CompletionRequest, CompletionResponse, LLMProviderType, LlmProviderClient, LlmResult, MessageRole, Usage,
};

use super::classify_transport_error;

const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// Client for a local OpenAI-compatible server (§2.3 "a local
/// OpenAI-compatible server") — vLLM, Ollama, LM Studio, etc. all speak
/// this dialect, so one client covers them; no API key is required.
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(http: reqwest::Client) -> Self {
        let base_url = std::env::var("OLLAMA_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self { http, base_url }
    }
}

#[derive(Serialize)]
struct ChatMessageWire {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessageWire>,
    temperature: f32,
    top_p: f32,
    #[serde(rename = "max_tokens")]
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait::async_trait]
impl LlmProviderClient for OllamaClient {
    fn provider_type(&self) -> LLMProviderType {
        LLMProviderType::Ollama
    }

    async fn complete(&self, request: &CompletionRequest, _api_key: &str) -> LlmResult<CompletionResponse> {
        let messages = request
            .messages
            .iter()
            .map(|m| ChatMessageWire {
                role: match m.role {
                    MessageRole::System => "system",
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                content: m.content.clone(),
            })
            .collect();

        let body = ChatRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            top_p: request.top_p,
            max_tokens: request.max_tokens,
            stream: false,
        };

        let started = Instant::now();
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(Duration::from_secs(180))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = resp.status();
        let text_body = resp.text().await.map_err(|e| classify_transport_error(&e))?;
        if !status.is_success() {
            return Err(super::classify_status(status, &text_body));
        }

        let parsed: ChatResponse = serde_json::from_str(&text_body)
            .map_err(|e| crate::llm::LlmError::Permanent(format!("unparseable local-server response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| crate::llm::LlmError::Permanent("local server response had no choices".to_string()))?;

        Ok(CompletionResponse {
            text: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: Usage { prompt_tokens: 0, completion_tokens: 0 },
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn embed(&self, _text: &str, _model: &str, _api_key: &str) -> LlmResult<Vec<f32>> {
        Err(crate::llm::LlmError::Permanent(
            "local server embeddings not configured".to_string(),
        ))
    }
}
