use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::llm::{
    CompletionRequest, CompletionResponse, LLMProviderType, LlmProviderClient, LlmResult, MessageRole, Usage,
};

use super::{classify_status, classify_transport_error};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleClient {
    http: reqwest::Client,
    base_url: String,
}

impl GoogleClient {
    pub fn new(http: reqwest::Client) -> Self {
        let base_url = std::env::var("GOOGLE_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self { http, base_url }
    }
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "topP")]
    top_p: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Vec::is_empty", rename = "stopSequences")]
    stop_sequences: Vec<String>,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "systemInstruction")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct UsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u32,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u32,
}

#[derive(Serialize)]
struct EmbedRequest {
    content: Content,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: EmbedValues,
}

#[derive(Deserialize)]
struct EmbedValues {
    values: Vec<f32>,
}

#[async_trait::async_trait]
impl LlmProviderClient for GoogleClient {
    fn provider_type(&self) -> LLMProviderType {
        LLMProviderType::Google
    }

    async fn complete(&self, request: &CompletionRequest, api_key: &str) -> LlmResult<CompletionResponse> {
        let system_instruction = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.clone())
            .collect::<Vec<_>>()
            .join("\n\n");

        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| Content {
                role: match m.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "model",
                    MessageRole::System => unreachable!(),
                },
                parts: vec![Part { text: m.content.clone() }],
            })
            .collect();

        let body = GenerateRequest {
            contents,
            system_instruction: (!system_instruction.is_empty())
                .then(|| Content { role: "system", parts: vec![Part { text: system_instruction }] }),
            generation_config: GenerationConfig {
                temperature: request.temperature,
                top_p: request.top_p,
                max_output_tokens: request.max_tokens,
                stop_sequences: request.stop.clone(),
            },
        };

        let started = Instant::now();
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, request.model, api_key
        );
        let resp = self
            .http
            .post(url)
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

        let parsed: GenerateResponse = serde_json::from_str(&text_body)
            .map_err(|e| crate::llm::LlmError::Permanent(format!("unparseable google response: {e}")))?;

        let candidate = parsed
            .candidates
            .into_iter()
            .next()
            .ok_or_else(|| crate::llm::LlmError::Permanent("google response had no candidates".to_string()))?;

        let text = candidate.content.parts.into_iter().map(|p| p.text).collect::<Vec<_>>().join("");

        Ok(CompletionResponse {
            text,
            finish_reason: candidate.finish_reason.unwrap_or_else(|| "STOP".to_string()),
            usage: parsed
                .usage_metadata
                .map(|u| Usage { prompt_tokens: u.prompt_token_count, completion_tokens: u.candidates_token_count })
                .unwrap_or(Usage { prompt_tokens: 0, completion_tokens: 0 }),
            latency_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn embed(&self, text: &str, model: &str, api_key: &str) -> LlmResult<Vec<f32>> {
        let url = format!("{}/models/{}:embedContent?key={}", self.base_url, model, api_key);
        let resp = self
            .http
            .post(url)
            .timeout(Duration::from_secs(60))
            .json(&EmbedRequest { content: Content { role: "user", parts: vec![Part { text: text.to_string() }] } })
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = resp.status();
        let text_body = resp.text().await.map_err(|e| classify_transport_error(&e))?;
        if !status.is_success() {
            return Err(classify_status(status, &text_body));
        }

        let parsed: EmbedResponse = serde_json::from_str(&text_body)
            .map_err(|e| crate::llm::LlmError::Permanent(format!("unparseable embedding response: {e}")))?;
        Ok(parsed.embedding.values)
    }
}
