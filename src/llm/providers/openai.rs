use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::llm::{
    CompletionRequest, CompletionResponse, LLMProviderType, LlmProviderClient, LlmResult, MessageRole, Usage,
};

use super::{classify_status, classify_transport_error};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(http: reqwest::Client) -> Self {
        let base_url = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
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
    max_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
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

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl LlmProviderClient for OpenAiClient {
    fn provider_type(&self) -> LLMProviderType {
        LLMProviderType::OpenAi
    }

    async fn complete(&self, request: &CompletionRequest, api_key: &str) -> LlmResult<CompletionResponse> {
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
            stop: request.stop.clone(),
            response_format: request.json_mode.then_some(ResponseFormat { kind: "json_object" }),
        };

        let started = Instant::now();
        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
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

        let parsed: ChatResponse = serde_json::from_str(&text_body)
            .map_err(|e| crate::llm::LlmError::Permanent(format!("unparseable openai response: {e}")))?;

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| crate::llm::LlmError::Permanent("openai response had no choices".to_string()))?;

        Ok(CompletionResponse {
            text: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason.unwrap_or_else(|| "stop".to_string()),
            usage: parsed
                .usage
                .map(|u| Usage { prompt_tokens: u.prompt_tokens, completion_tokens: u.completion_tokens })
                .unwrap_or(Usage { prompt_tokens: 0, completion_tokens: 0 }),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn embed(&self, text: &str, model: &str, api_key: &str) -> LlmResult<Vec<f32>> {
        let resp = self
            .http
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(api_key)
            .timeout(Duration::from_secs(60))
            .json(&EmbeddingRequest { model, input: text })
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = resp.status();
        let text_body = resp.text().await.map_err(|e| classify_transport_error(&e))?;
        if !status.is_success() {
            return Err(classify_status(status, &text_body));
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&text_body)
            .map_err(|e| crate::llm::LlmError::Permanent(format!("unparseable embedding response: {e}")))?;

        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| crate::llm::LlmError::Permanent("embedding response had no data".to_string()))
    }
}
