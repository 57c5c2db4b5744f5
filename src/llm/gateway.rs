use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::providers::{AnthropicClient, GoogleClient, OllamaClient, OpenAiClient};
use super::rate_limiter::TokenBucket;
use super::{CompletionRequest, CompletionResponse, LLMProviderType, LlmError, LlmProviderClient, LlmResult};

/// Per-provider health, kept for observability only (§4.2): consecutive
/// failures are never used to silently drop a provider mid-retry, only
/// logged and exposed via [`LlmGateway::health`].
#[derive(Debug, Clone, Default)]
pub struct ProviderHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

/// The uniform LLM Gateway (§4.2): `complete`/`embed` over whichever
/// provider a request names, with a per-provider token-bucket rate
/// limiter and wall-clock timeouts. Transient/Permanent failure
/// classification happens at the provider-client layer; this struct only
/// adds rate limiting, timeouts, and cancellation.
pub struct LlmGateway {
    providers: DashMap<LLMProviderType, Arc<dyn LlmProviderClient>>,
    buckets: DashMap<LLMProviderType, Arc<TokenBucket>>,
    health: DashMap<LLMProviderType, ProviderHealth>,
    rate_limit_budget: Duration,
    request_timeout: Duration,
}

impl LlmGateway {
    /// Builds a gateway with the standard provider registry (§2.3:
    /// "cloud chat APIs and a local OpenAI-compatible server").
    pub fn new() -> Self {
        let http = reqwest::Client::new();
        let providers: DashMap<LLMProviderType, Arc<dyn LlmProviderClient>> = DashMap::new();
        providers.insert(LLMProviderType::Anthropic, Arc::new(AnthropicClient::new(http.clone())));
        providers.insert(LLMProviderType::OpenAi, Arc::new(OpenAiClient::new(http.clone())));
        providers.insert(LLMProviderType::Google, Arc::new(GoogleClient::new(http.clone())));
        providers.insert(LLMProviderType::Ollama, Arc::new(OllamaClient::new(http)));

        let buckets = DashMap::new();
        for provider in [LLMProviderType::Anthropic, LLMProviderType::OpenAi, LLMProviderType::Google, LLMProviderType::Ollama] {
            buckets.insert(provider, Arc::new(TokenBucket::new(10.0, 2.0)));
        }

        Self {
            providers,
            buckets,
            health: DashMap::new(),
            rate_limit_budget: Duration::from_secs(30),
            request_timeout: Duration::from_secs(150),
        }
    }

    /// Builds a gateway whose provider registry all points at a single
    /// client, bypassing the HTTP provider constructors and their
    /// `*_API_KEY` environment reads. Used by workflow engine tests to
    /// inject a scripted [`LlmProviderClient`] without a live network call.
    pub fn with_client(client: Arc<dyn LlmProviderClient>) -> Self {
        let providers: DashMap<LLMProviderType, Arc<dyn LlmProviderClient>> = DashMap::new();
        let buckets = DashMap::new();
        for provider in [LLMProviderType::Anthropic, LLMProviderType::OpenAi, LLMProviderType::Google, LLMProviderType::Ollama] {
            providers.insert(provider, client.clone());
            buckets.insert(provider, Arc::new(TokenBucket::new(1000.0, 1000.0)));
        }
        Self {
            providers,
            buckets,
            health: DashMap::new(),
            rate_limit_budget: Duration::from_secs(30),
            request_timeout: Duration::from_secs(150),
        }
    }

    pub fn health(&self, provider: LLMProviderType) -> ProviderHealth {
        self.health.get(&provider).map(|h| h.clone()).unwrap_or_default()
    }

    fn api_key_for(&self, provider: LLMProviderType) -> String {
        let env_var = match provider {
            LLMProviderType::Anthropic => "ANTHROPIC_API_KEY",
            LLMProviderType::OpenAi => "OPENAI_API_KEY",
            LLMProviderType::Google => "GOOGLE_API_KEY",
            LLMProviderType::Ollama => "OLLAMA_API_KEY",
        };
        std::env::var(env_var).unwrap_or_default()
    }

    fn record_outcome(&self, provider: LLMProviderType, result: &LlmResult<CompletionResponse>) {
        let mut entry = self.health.entry(provider).or_default();
        match result {
            Ok(_) => {
                entry.consecutive_failures = 0;
                entry.last_error = None;
            }
            Err(e) => {
                entry.consecutive_failures += 1;
                entry.last_error = Some(e.to_string());
            }
        }
    }

    /// `complete(request) -> response` (§4.2). One attempt, no retries:
    /// the retry loop lives in [`crate::engine::retry`] and decides
    /// whether to call this again based on [`LlmError::is_transient`].
    pub async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> LlmResult<CompletionResponse> {
        let client = self
            .providers
            .get(&request.provider)
            .ok_or_else(|| LlmError::Permanent(format!("no client registered for provider {}", request.provider)))?
            .clone();

        let bucket = self.buckets.get(&request.provider).map(|b| b.clone());
        if let Some(bucket) = bucket {
            if !bucket.acquire(self.rate_limit_budget).await {
                let err = LlmError::Transient(format!("rate limit budget exhausted for {}", request.provider));
                self.record_outcome(request.provider, &Err(err.clone()));
                return Err(err);
            }
        }

        let api_key = self.api_key_for(request.provider);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Transient("cancelled".to_string())),
            r = tokio::time::timeout(self.request_timeout, client.complete(request, &api_key)) => {
                match r {
                    Ok(inner) => inner,
                    Err(_) => Err(LlmError::Transient(format!("{} request timed out", request.provider))),
                }
            }
        };

        if let Err(ref e) = result {
            warn!(provider = %request.provider, model = %request.model, error = %e, "llm completion failed");
        } else {
            info!(provider = %request.provider, model = %request.model, "llm completion succeeded");
        }
        self.record_outcome(request.provider, &result);
        result
    }

    /// `embed(text) -> vector` (§4.2), used by SimilarityMatch to embed
    /// generated Sigma rules before the k-NN query.
    pub async fn embed(&self, provider: LLMProviderType, model: &str, text: &str) -> LlmResult<Vec<f32>> {
        let client = self
            .providers
            .get(&provider)
            .ok_or_else(|| LlmError::Permanent(format!("no client registered for provider {provider}")))?
            .clone();
        let api_key = self.api_key_for(provider);
        tokio::time::timeout(self.request_timeout, client.embed(text, model, &api_key))
            .await
            .unwrap_or_else(|_| Err(LlmError::Transient(format!("{provider} embed request timed out"))))
    }
}

impl Default for LlmGateway {
    fn default() -> Self {
        Self::new()
    }
}
