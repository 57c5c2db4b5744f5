use futures::future::join_all;

use crate::llm::{ChatMessage, CompletionRequest, MessageRole};
use crate::models::{GeneratedSigmaRule, StageName, StageOutput};
use crate::validation::validate_sigma_rule;

use super::{require_agent_model, require_agent_prompt, StageContext, StageError, StageExecutor, StageOutcome};

const AGENT: &str = "sigma_gen";
const CANDIDATES_PER_RUN: usize = 3;
const MAX_ATTEMPTS_PER_CANDIDATE: u32 = 3;

/// Generates Sigma YAML candidates and validates each with the Sigma
/// Validator, feeding validation errors back for up to
/// `MAX_ATTEMPTS_PER_CANDIDATE` attempts per candidate (§4.3.e). Input is
/// the extraction content when huntables were found, else
/// `filtered_content` if `sigma_fallback_enabled`; an empty input yields
/// an empty rule list rather than an error (open question resolution,
/// see DESIGN.md: "skip Sigma cleanly" when the fallback content is also
/// empty).
pub struct SigmaGenStage;

#[async_trait::async_trait]
impl StageExecutor for SigmaGenStage {
    fn stage_name(&self) -> StageName {
        StageName::SigmaGen
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, StageError> {
        let model_config = require_agent_model(ctx.config, AGENT)?;
        let prompt = require_agent_prompt(ctx.config, AGENT)?;

        let input = sigma_input(ctx);
        if input.trim().is_empty() {
            return Ok(StageOutcome::ok(StageOutput::Sigma { rules: Vec::new() }, None));
        }

        let candidates = join_all((0..CANDIDATES_PER_RUN).map(|_| generate_one_rule(ctx, model_config, prompt, &input)))
            .await;

        let rules: Vec<GeneratedSigmaRule> = candidates.into_iter().flatten().collect();

        if rules.is_empty() {
            return Err(StageError::ValidationFailure(
                "no candidate rule passed Sigma validation after all attempts".to_string(),
            ));
        }

        Ok(StageOutcome::ok(StageOutput::Sigma { rules }, None))
    }
}

fn sigma_input(ctx: &StageContext<'_>) -> String {
    use crate::models::StageOutput as SO;
    if let Some(SO::Extract(extraction)) = ctx.prior_output(StageName::ExtractSupervisor) {
        if extraction.discrete_huntables_count > 0 {
            return extraction.content.clone();
        }
    }
    if ctx.config.sigma_fallback_enabled {
        return ctx.article.effective_content().to_string();
    }
    String::new()
}

/// One candidate's generate-validate-correct loop, independent of the
/// engine-level stage retry (that loop governs the whole stage's
/// transient failures; this one governs a single candidate's
/// YAML-shape correctness).
async fn generate_one_rule(
    ctx: &StageContext<'_>,
    model_config: &crate::models::AgentModelConfig,
    prompt: &str,
    input: &str,
) -> Option<GeneratedSigmaRule> {
    let mut feedback: Option<String> = None;

    for attempt in 1..=MAX_ATTEMPTS_PER_CANDIDATE {
        let mut messages = vec![
            ChatMessage { role: MessageRole::System, content: prompt.to_string() },
            ChatMessage { role: MessageRole::User, content: input.to_string() },
        ];
        if let Some(err) = &feedback {
            messages.push(ChatMessage {
                role: MessageRole::User,
                content: format!(
                    "Your previous rule failed Sigma validation with these errors: {err}. \
                     Produce a corrected Sigma rule as raw YAML only."
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
            json_mode: false,
        };

        let response = match ctx.gateway.complete(&request, ctx.cancel).await {
            Ok(r) => r,
            Err(e) => {
                feedback = Some(e.to_string());
                continue;
            }
        };

        let yaml_text = strip_code_fence(response.text.trim());
        let errors = validate_sigma_rule(yaml_text);
        if errors.is_empty() {
            return Some(GeneratedSigmaRule { yaml_text: yaml_text.to_string(), attempts: attempt });
        }
        feedback = Some(errors.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "));
    }

    None
}

fn strip_code_fence(text: &str) -> &str {
    let text = text
        .strip_prefix("```yaml")
        .or_else(|| text.strip_prefix("```yml"))
        .or_else(|| text.strip_prefix("```"))
        .unwrap_or(text);
    text.strip_suffix("```").unwrap_or(text).trim()
}
