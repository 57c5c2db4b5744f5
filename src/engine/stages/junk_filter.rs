use futures::future::try_join_all;

use crate::llm::{ChatMessage, CompletionRequest, MessageRole};
use crate::models::{LlmTelemetry, StageName, StageOutput, TerminationReason};

use super::{require_agent_model, require_agent_prompt, StageContext, StageError, StageExecutor, StageOutcome};

const AGENT: &str = "junk_filter";
const CHUNK_SIZE: usize = 1000;
const CHUNK_OVERLAP: usize = 200;

/// Chunks the article into fixed-size overlapping windows and classifies
/// each `{huntable|junk}` (§4.3.b). The article is junk iff fewer than
/// `min_huntable_chunks` chunks classify huntable; `filtered_content` is
/// the concatenation of huntable chunks, boundary-delimited.
pub struct JunkFilterStage;

#[async_trait::async_trait]
impl StageExecutor for JunkFilterStage {
    fn stage_name(&self) -> StageName {
        StageName::JunkFilter
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, StageError> {
        let model_config = require_agent_model(ctx.config, AGENT)?;
        let prompt = require_agent_prompt(ctx.config, AGENT)?;

        let chunks = chunk_text(&ctx.article.content, CHUNK_SIZE, CHUNK_OVERLAP);
        let total_chunks = chunks.len() as u32;

        let classify_calls = chunks.iter().map(|chunk| {
            classify_chunk(ctx, model_config, prompt, chunk)
        });
        let classifications = try_join_all(classify_calls).await?;

        let huntable_chunks: Vec<&String> = chunks
            .iter()
            .zip(classifications.iter())
            .filter(|(_, huntable)| **huntable)
            .map(|(chunk, _)| chunk)
            .collect();
        let huntable_count = huntable_chunks.len() as u32;

        let filtered_content = huntable_chunks
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");

        let output = StageOutput::JunkFilter {
            filtered_content,
            huntable_chunks: huntable_count,
            total_chunks,
        };

        let min_huntable = ctx.config.thresholds.junk_min_huntable_chunks;
        if huntable_count < min_huntable {
            Ok(StageOutcome::terminate(output, None, TerminationReason::JunkFiltered))
        } else {
            Ok(StageOutcome::ok(output, None))
        }
    }
}

async fn classify_chunk(
    ctx: &StageContext<'_>,
    model_config: &crate::models::AgentModelConfig,
    prompt: &str,
    chunk: &str,
) -> Result<bool, StageError> {
    let request = CompletionRequest {
        provider: model_config.provider,
        model: model_config.model.clone(),
        messages: vec![
            ChatMessage { role: MessageRole::System, content: prompt.to_string() },
            ChatMessage { role: MessageRole::User, content: chunk.to_string() },
        ],
        temperature: model_config.temperature,
        top_p: model_config.top_p,
        max_tokens: model_config.max_tokens,
        stop: Vec::new(),
        json_mode: false,
    };
    let response = ctx.gateway.complete(&request, ctx.cancel).await?;
    Ok(response.text.trim().to_ascii_lowercase().contains("huntable"))
}

/// Fixed-size overlapping chunker. Empty content yields zero chunks,
/// which drives the "empty article -> junk_filtered" boundary behavior
/// (§8) since zero huntable chunks is always below any positive
/// threshold.
fn chunk_text(content: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let stride = chunk_size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        if end == chars.len() {
            break;
        }
        start += stride;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_content_yields_no_chunks() {
        assert!(chunk_text("", 1000, 200).is_empty());
    }

    #[test]
    fn short_content_yields_one_chunk() {
        let chunks = chunk_text("short article body", 1000, 200);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn long_content_yields_overlapping_chunks() {
        let content = "a".repeat(2500);
        let chunks = chunk_text(&content, 1000, 200);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks.last().unwrap().len(), 900);
    }
}
