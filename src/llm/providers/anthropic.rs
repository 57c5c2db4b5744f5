use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::llm::{
    CompletionRequest, CompletionResponse, LLMProviderType, LlmProviderClient, LlmResult, MessageRole, Usage,
};

use super::{classify_status, classify_transport_error};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    http: reqwest::Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client) -> Self {
        let base_url = std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self { http, base_url }
    }
}

#[derive(Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_sequences: Vec<String>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct AnthropicContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[async_trait::async_trait]
impl LlmProviderClient for AnthropicClient {
    fn provider_type(&self) -> LLMProviderType {
        LLMProviderType::Anthropic
    }

    async fn complete(&self, request: &CompletionRequest, api_key: &str) -> LlmResult<CompletionResponse> {
        let system = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| AnthropicMessage {
                role: match m.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                    MessageRole::System => unreachable!(),
                },
                content: m.content.clone(),
            })
            .collect();

        let body = AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            top_p: request.top_p,
            system: if system.is_empty() { None } else { Some(system) },
            messages,
            stop_sequences: request.stop.clone(),
        };

        let started = Instant::now();
        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .timeout(Duration::from_secs(120))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = resp.status();
        let text_body = resp.text().await.map_err(|e| classify_transport_error(&e))?;
        if !status.is_success() {
            return Err(classify_status(status, &text_body));
        }

        let parsed: AnthropicResponse = serde_json::from_str(&text_body)
            .map_err(|e| crate::llm::LlmError::Permanent(format!("unparseable anthropic response: {e}")))?;

        Ok(CompletionResponse {
            text: parsed.content.into_iter().map(|b| b.text).collect::<Vec<_>>().join(""),
            finish_reason: parsed.stop_reason.unwrap_or_else(|| "stop".to_string()),
            usage: Usage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
            },
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn embed(&self, _text: &str, _model: &str, _api_key: &str) -> LlmResult<Vec<f32>> {
        Err(crate::llm::LlmError::Permanent(
            "Anthropic does not expose an embeddings endpoint".to_string(),
        ))
    }
}
