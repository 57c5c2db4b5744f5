use crate::llm::{ChatMessage, CompletionRequest, MessageRole};
use crate::models::{LlmTelemetry, OsClass, StageName, StageOutput, TerminationReason};

use super::{require_agent_model, require_agent_prompt, StageContext, StageError, StageExecutor, StageOutcome};

/// Classifies an article's target OS via a one-word LLM label (§4.3.a).
/// Terminates early on `linux`/`macos`; `unknown` proceeds or terminates
/// per the `os_detect_proceed_on_unknown` config flag (open question,
/// resolved in DESIGN.md).
pub struct OsDetectStage;

const AGENT: &str = "os_detect";

#[async_trait::async_trait]
impl StageExecutor for OsDetectStage {
    fn stage_name(&self) -> StageName {
        StageName::OsDetect
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, StageError> {
        let model_config = require_agent_model(ctx.config, AGENT)?;
        let prompt = require_agent_prompt(ctx.config, AGENT)?;

        let mut messages = vec![
            ChatMessage { role: MessageRole::System, content: prompt.to_string() },
            ChatMessage { role: MessageRole::User, content: ctx.article.content.clone() },
        ];
        if let Some(feedback) = &ctx.retry_feedback {
            messages.push(ChatMessage {
                role: MessageRole::User,
                content: format!("Your previous answer was invalid: {feedback}. Reply with exactly one word."),
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
            json_mode: false,
        };

        let response = ctx.gateway.complete(&request, ctx.cancel).await?;
        let os = OsClass::from_label(&response.text);

        let telemetry = Some(LlmTelemetry {
            model: model_config.model.clone(),
            prompt_tokens: response.usage.prompt_tokens,
            completion_tokens: response.usage.completion_tokens,
            latency_ms: response.latency_ms,
        });

        let output = StageOutput::OsDetect { os };

        let should_terminate = os.terminates_early()
            || (os == OsClass::Unknown && !ctx.config.os_detect_proceed_on_unknown);

        if should_terminate {
            Ok(StageOutcome::terminate(output, telemetry, TerminationReason::NonWindowsOsDetected))
        } else {
            Ok(StageOutcome::ok(output, telemetry))
        }
    }
}
