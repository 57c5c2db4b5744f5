//! The scheduled-sweeper half of the Trigger Surface (§4.4): periodically
//! enqueues triggers for newly-ingested articles that clear the
//! auto-trigger score threshold and have no successful execution at the
//! current `config_version`. The HTTP half lives in [`crate::api`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::workflow_engine::{TriggerOptions, WorkflowEngine};

/// Runs [`WorkflowEngine::trigger`] over every eligible article once per
/// `interval`, forever. Intended to be `tokio::spawn`ed once per process.
pub async fn run_sweeper(engine: Arc<WorkflowEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        if let Err(err) = sweep_once(&engine).await {
            warn!(%err, "sweeper pass failed");
        }
    }
}

/// One sweep pass: fetches the latest config to know the current
/// `auto_trigger_threshold` and `config_version`, then triggers every
/// article the catalog store reports as unprocessed at that version
/// (§4.4 "Scheduled sweeper").
async fn sweep_once(engine: &Arc<WorkflowEngine>) -> crate::Result<()> {
    let config = engine.store().latest_workflow_config().await?;
    let candidates = engine
        .store()
        .list_unprocessed_articles(config.auto_trigger_threshold, config.version)
        .await?;

    if candidates.is_empty() {
        return Ok(());
    }
    info!(count = candidates.len(), config_version = config.version, "sweeper found eligible articles");

    for article in candidates {
        match engine.trigger(article.id, TriggerOptions::default()).await {
            Ok(outcome) if outcome.accepted => {
                info!(article_id = %article.id, execution_id = %outcome.execution_id, "sweeper triggered execution");
            }
            Ok(_) => {
                // Another trigger (HTTP or a concurrent sweep) already claimed
                // this article; idempotent trigger means this is a no-op.
            }
            Err(err) => {
                warn!(article_id = %article.id, %err, "sweeper failed to trigger article");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::engine::{InMemoryCatalogStore, InMemoryWorkQueue};
    use crate::llm::{CompletionRequest, CompletionResponse, LLMProviderType, LlmGateway, LlmProviderClient, LlmResult, Usage};
    use crate::models::{Article, Thresholds, WorkflowConfig};

    struct StubClient;

    #[async_trait::async_trait]
    impl LlmProviderClient for StubClient {
        fn provider_type(&self) -> LLMProviderType {
            LLMProviderType::Anthropic
        }
        async fn complete(&self, _req: &CompletionRequest, _key: &str) -> LlmResult<CompletionResponse> {
            Ok(CompletionResponse {
                text: "windows".to_string(),
                finish_reason: "stop".to_string(),
                usage: Usage { prompt_tokens: 1, completion_tokens: 1 },
                latency_ms: 1,
            })
        }
        async fn embed(&self, _text: &str, _model: &str, _key: &str) -> LlmResult<Vec<f32>> {
            Ok(vec![0.0])
        }
    }

    fn sample_config() -> WorkflowConfig {
        WorkflowConfig {
            version: 1,
            agent_models: HashMap::new(),
            agent_prompts: HashMap::new(),
            thresholds: Thresholds::default(),
            qa_enabled: HashMap::new(),
            enabled_subagents: HashSet::new(),
            sigma_fallback_enabled: false,
            similarity_k: 10,
            os_detect_proceed_on_unknown: true,
            auto_trigger_threshold: 5.0,
        }
    }

    fn sample_article(score: f64) -> Article {
        Article {
            id: Uuid::new_v4(),
            source_id: Uuid::new_v4(),
            canonical_url: "https://example.test/a".to_string(),
            title: "t".to_string(),
            content: "c".to_string(),
            filtered_content: None,
            content_hash: "hash".to_string(),
            published_at: Utc::now(),
            threat_hunting_score: score,
            ml_hunt_score: score,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn sweep_triggers_only_articles_above_threshold() {
        let store = Arc::new(InMemoryCatalogStore::new());
        store.set_workflow_config(sample_config()).await;
        let above = sample_article(7.0);
        let below = sample_article(1.0);
        store.insert_article(above.clone()).await.unwrap();
        store.insert_article(below.clone()).await.unwrap();

        let queue = Arc::new(InMemoryWorkQueue::new());
        let gateway = Arc::new(LlmGateway::with_client(Arc::new(StubClient)));
        let engine = Arc::new(WorkflowEngine::new(store.clone(), queue, gateway, None));

        sweep_once(&engine).await.unwrap();

        assert!(store.active_execution_for_article(above.id).await.unwrap().is_some());
        assert!(store.active_execution_for_article(below.id).await.unwrap().is_none());
    }
}
