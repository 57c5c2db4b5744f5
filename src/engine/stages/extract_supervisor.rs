use std::collections::BTreeMap;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::llm::{ChatMessage, CompletionRequest, MessageRole};
use crate::models::{
    ExtractionResult, HuntQuery, Observable, ObservableType, ProcessLineageEntry, StageName, StageOutput,
    SubAgentResult,
};
use crate::validation::parse_strict_json;

use super::{StageContext, StageError, StageExecutor, StageOutcome};

const CMDLINE_AGENT: &str = "cmdline_extract";
const PROCTREE_AGENT: &str = "proctree_extract";
const HUNT_QUERIES_AGENT: &str = "hunt_queries_extract";
const QA_AGENT: &str = "qa";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum QaVerdict {
    Pass,
    Fail,
    NeedsRevision,
}

#[derive(Debug, Deserialize)]
struct QaResponse<I> {
    #[allow(dead_code)]
    verdict: QaVerdict,
    corrections: Vec<I>,
}

#[derive(Debug, Deserialize)]
struct CmdlineResponse {
    #[allow(dead_code)]
    count: usize,
    items: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProcTreeResponse {
    process_lineage: Vec<ProcessLineageEntry>,
    #[allow(dead_code)]
    count: usize,
}

#[derive(Debug, Deserialize)]
struct HuntQueriesResponse {
    queries: Vec<HuntQuery>,
    #[allow(dead_code)]
    query_count: usize,
}

/// Runs the enabled extraction sub-agents concurrently and merges their
/// typed outputs into one [`ExtractionResult`] (§4.3.d). A sub-agent
/// failure is isolated to its own entry in `subresults`; the stage only
/// fails (and is retried as a whole) when every enabled sub-agent failed.
pub struct ExtractSupervisorStage;

#[async_trait::async_trait]
impl StageExecutor for ExtractSupervisorStage {
    fn stage_name(&self) -> StageName {
        StageName::ExtractSupervisor
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, StageError> {
        let content = ctx.article.effective_content().to_string();
        let mut futures_list: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = (ObservableType, SubAgentResult)> + Send + '_>>> =
            Vec::new();

        if ctx.config.is_subagent_enabled(CMDLINE_AGENT) {
            futures_list.push(Box::pin(async move {
                (ObservableType::Cmdline, run_cmdline_extract(ctx, &content).await)
            }));
        }
        let content2 = ctx.article.effective_content().to_string();
        if ctx.config.is_subagent_enabled(PROCTREE_AGENT) {
            futures_list.push(Box::pin(async move {
                (ObservableType::ProcessLineage, run_proctree_extract(ctx, &content2).await)
            }));
        }
        let content3 = ctx.article.effective_content().to_string();
        if ctx.config.is_subagent_enabled(HUNT_QUERIES_AGENT) {
            futures_list.push(Box::pin(async move {
                (ObservableType::HuntQueries, run_hunt_queries_extract(ctx, &content3).await)
            }));
        }

        if futures_list.is_empty() {
            return Err(StageError::ConfigError("no extraction sub-agents enabled".to_string()));
        }

        let results = join_all(futures_list).await;
        let subresults: BTreeMap<ObservableType, SubAgentResult> = results.into_iter().collect();

        let extraction = ExtractionResult::merge(subresults);
        if !extraction.has_any_success() {
            return Err(StageError::Transient(
                "all extraction sub-agents failed this attempt".to_string(),
            ));
        }

        Ok(StageOutcome::ok(StageOutput::Extract(extraction), None))
    }
}

async fn run_cmdline_extract(ctx: &StageContext<'_>, content: &str) -> SubAgentResult {
    let model_config = match ctx.config.agent_model(CMDLINE_AGENT) {
        Some(m) => m,
        None => return SubAgentResult::failed("no model configured for cmdline_extract"),
    };
    let prompt = match ctx.config.agent_prompt(CMDLINE_AGENT) {
        Some(p) => p,
        None => return SubAgentResult::failed("no prompt configured for cmdline_extract"),
    };

    let response = match call_extractor(ctx, model_config, prompt, content).await {
        Ok(r) => r,
        Err(e) => return SubAgentResult::failed(e.to_string()),
    };

    let parsed: CmdlineResponse = match parse_strict_json(&response) {
        Ok(p) => p,
        Err(e) => return SubAgentResult::failed(format!("cmdline_extract: {e}")),
    };

    let mut items = parsed.items;
    if ctx.config.is_qa_enabled(CMDLINE_AGENT) {
        match run_qa::<String>(ctx, CMDLINE_AGENT, &items, content).await {
            Ok(corrected) => items = corrected,
            Err(e) => tracing::warn!(error = %e, "cmdline_extract QA pass failed, keeping pre-QA items"),
        }
    }

    SubAgentResult::ok(
        items
            .into_iter()
            .map(|value| Observable::Cmdline { value, source: Observable::SOURCE_SUPERVISOR_AGGREGATION.to_string() })
            .collect(),
    )
}

async fn run_proctree_extract(ctx: &StageContext<'_>, content: &str) -> SubAgentResult {
    let model_config = match ctx.config.agent_model(PROCTREE_AGENT) {
        Some(m) => m,
        None => return SubAgentResult::failed("no model configured for proctree_extract"),
    };
    let prompt = match ctx.config.agent_prompt(PROCTREE_AGENT) {
        Some(p) => p,
        None => return SubAgentResult::failed("no prompt configured for proctree_extract"),
    };

    let response = match call_extractor(ctx, model_config, prompt, content).await {
        Ok(r) => r,
        Err(e) => return SubAgentResult::failed(e.to_string()),
    };

    let parsed: ProcTreeResponse = match parse_strict_json(&response) {
        Ok(p) => p,
        Err(e) => return SubAgentResult::failed(format!("proctree_extract: {e}")),
    };

    let mut items = filter_proctree_policy(parsed.process_lineage);
    if ctx.config.is_qa_enabled(PROCTREE_AGENT) {
        match run_qa::<ProcessLineageEntry>(ctx, PROCTREE_AGENT, &items, content).await {
            Ok(corrected) => items = filter_proctree_policy(corrected),
            Err(e) => tracing::warn!(error = %e, "proctree_extract QA pass failed, keeping pre-QA items"),
        }
    }

    SubAgentResult::ok(
        items
            .into_iter()
            .map(|value| Observable::ProcessLineage {
                value,
                source: Observable::SOURCE_SUPERVISOR_AGGREGATION.to_string(),
            })
            .collect(),
    )
}

async fn run_hunt_queries_extract(ctx: &StageContext<'_>, content: &str) -> SubAgentResult {
    let model_config = match ctx.config.agent_model(HUNT_QUERIES_AGENT) {
        Some(m) => m,
        None => return SubAgentResult::failed("no model configured for hunt_queries_extract"),
    };
    let prompt = match ctx.config.agent_prompt(HUNT_QUERIES_AGENT) {
        Some(p) => p,
        None => return SubAgentResult::failed("no prompt configured for hunt_queries_extract"),
    };

    let response = match call_extractor(ctx, model_config, prompt, content).await {
        Ok(r) => r,
        Err(e) => return SubAgentResult::failed(e.to_string()),
    };

    let parsed: HuntQueriesResponse = match parse_strict_json(&response) {
        Ok(p) => p,
        Err(e) => return SubAgentResult::failed(format!("hunt_queries_extract: {e}")),
    };

    let mut items = parsed.queries;
    if ctx.config.is_qa_enabled(HUNT_QUERIES_AGENT) {
        match run_qa::<HuntQuery>(ctx, HUNT_QUERIES_AGENT, &items, content).await {
            Ok(corrected) => items = corrected,
            Err(e) => tracing::warn!(error = %e, "hunt_queries_extract QA pass failed, keeping pre-QA items"),
        }
    }

    SubAgentResult::ok(
        items
            .into_iter()
            .map(|value| Observable::HuntQuery { value, source: Observable::SOURCE_SUPERVISOR_AGGREGATION.to_string() })
            .collect(),
    )
}

/// `cmd.exe` is forbidden as a parent, both processes must be explicitly
/// named, and `source_text` is required (§4.3.d ProcTreeExtract rules).
/// Entries violating these are dropped, potentially down to zero
/// (§8 "if all items filtered, sub-agent contributes empty items").
fn filter_proctree_policy(entries: Vec<ProcessLineageEntry>) -> Vec<ProcessLineageEntry> {
    entries
        .into_iter()
        .filter(|e| {
            !e.parent.trim().is_empty()
                && !e.child.trim().is_empty()
                && !e.source_text.trim().is_empty()
                && !e.parent.to_ascii_lowercase().contains("cmd.exe")
        })
        .collect()
}

async fn call_extractor(
    ctx: &StageContext<'_>,
    model_config: &crate::models::AgentModelConfig,
    prompt: &str,
    content: &str,
) -> Result<String, crate::llm::LlmError> {
    let mut messages = vec![
        ChatMessage { role: MessageRole::System, content: prompt.to_string() },
        ChatMessage { role: MessageRole::User, content: content.to_string() },
    ];
    if let Some(feedback) = &ctx.retry_feedback {
        messages.push(ChatMessage {
            role: MessageRole::User,
            content: format!("Your previous response was invalid: {feedback}. Produce ONLY valid JSON."),
        });
    }
    let request = CompletionRequest {
        provider: model_config.provider,
        model: model_config.model.clone(),
        messages,
        temperature: model_config.temperature,
        top_p: model_config.top_p,
        max_tokens: model_config.max_tokens,
        stop: Vec::new(),
        json_mode: true,
    };
    ctx.gateway.complete(&request, ctx.cancel).await.map(|r| r.text)
}

async fn run_qa<I>(ctx: &StageContext<'_>, agent: &str, items: &[I], article_text: &str) -> Result<Vec<I>, String>
where
    I: Serialize + for<'de> Deserialize<'de>,
{
    let model_config = ctx
        .config
        .agent_model(QA_AGENT)
        .ok_or_else(|| "no model configured for qa".to_string())?;
    let prompt = ctx
        .config
        .agent_prompt(QA_AGENT)
        .ok_or_else(|| "no prompt configured for qa".to_string())?;

    let items_json = serde_json::to_string(items).map_err(|e| e.to_string())?;
    let user_content = format!(
        "Agent: {agent}\nArticle:\n{article_text}\n\nExtracted items to review:\n{items_json}\n\n\
         Return ONLY JSON: {{\"verdict\": \"pass\"|\"fail\"|\"needs_revision\", \"corrections\": <corrected items, same schema>}}."
    );

    let request = CompletionRequest {
        provider: model_config.provider,
        model: model_config.model.clone(),
        messages: vec![
            ChatMessage { role: MessageRole::System, content: prompt.to_string() },
            ChatMessage { role: MessageRole::User, content: user_content },
        ],
        temperature: model_config.temperature,
        top_p: model_config.top_p,
        max_tokens: model_config.max_tokens,
        stop: Vec::new(),
        json_mode: true,
    };

    let response = ctx.gateway.complete(&request, ctx.cancel).await.map_err(|e| e.to_string())?;
    let parsed: QaResponse<I> = parse_strict_json(&response.text).map_err(|e| e.to_string())?;
    Ok(parsed.corrections)
}
