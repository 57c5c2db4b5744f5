use serde::Deserialize;

use crate::llm::{ChatMessage, CompletionRequest, MessageRole};
use crate::models::{LlmTelemetry, StageName, StageOutput, TerminationReason};
use crate::validation::parse_strict_json;

use super::{require_agent_model, require_agent_prompt, StageContext, StageError, StageExecutor, StageOutcome};

const AGENT: &str = "rank";

#[derive(Debug, Deserialize)]
struct RankResponse {
    score: f64,
    rationale: String,
}

/// Scores the article's hunt-worthiness in `[0,10]` with a rationale
/// (§4.3.c). Missing or out-of-range scores are a `ValidationFailure`
/// (retried with feedback); terminates early below
/// `thresholds.ranking`.
pub struct RankStage;

#[async_trait::async_trait]
impl StageExecutor for RankStage {
    fn stage_name(&self) -> StageName {
        StageName::Rank
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, StageError> {
        let model_config = require_agent_model(ctx.config, AGENT)?;
        let prompt = require_agent_prompt(ctx.config, AGENT)?;

        let mut messages = vec![
            ChatMessage { role: MessageRole::System, content: prompt.to_string() },
            ChatMessage { role: MessageRole::User, content: ctx.article.effective_content().to_string() },
        ];
        if let Some(feedback) = &ctx.retry_feedback {
            messages.push(ChatMessage {
                role: MessageRole::User,
                content: format!(
                    "Your previous response was invalid ({feedback}). Produce ONLY valid JSON matching \
                     {{\"score\": <number 0-10>, \"rationale\": <string>}}."
                ),
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

        let response = ctx.gateway.complete(&request, ctx.cancel).await?;
        let parsed: RankResponse = parse_strict_json(&response.text)
            .map_err(|e| StageError::ValidationFailure(e.to_string()))?;

        if !(0.0..=10.0).contains(&parsed.score) || parsed.score.is_nan() {
            return Err(StageError::ValidationFailure(format!(
                "score {} out of range [0,10]",
                parsed.score
            )));
        }

        let telemetry = Some(LlmTelemetry {
            model: model_config.model.clone(),
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            latency_ms: response.latency_ms,
        });

        let output = StageOutput::Rank { score: parsed.score, rationale: parsed.rationale };

        if parsed.score < ctx.config.thresholds.ranking {
            Ok(StageOutcome::terminate(output, telemetry, TerminationReason::BelowRankThreshold))
        } else {
            Ok(StageOutcome::ok(output, telemetry))
        }
    }
}
