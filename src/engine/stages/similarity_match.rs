use crate::models::{StageName, StageOutput};
use crate::similarity::{classify, compute_metrics};

use super::{require_agent_model, StageContext, StageError, StageExecutor, StageOutcome};

const EMBEDDING_AGENT: &str = "embedding";
const DEFAULT_K: u32 = 10;

/// For each validated Sigma rule from the SigmaGen stage, embeds it and
/// queries the Rule Corpus Index for its k nearest neighbors, then
/// classifies each match `{DUPLICATE, SIMILAR, NOVEL}` (§4.3.f).
pub struct SimilarityMatchStage;

#[async_trait::async_trait]
impl StageExecutor for SimilarityMatchStage {
    fn stage_name(&self) -> StageName {
        StageName::SimilarityMatch
    }

    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, StageError> {
        let rules = match ctx.prior_output(StageName::SigmaGen) {
            Some(StageOutput::Sigma { rules }) => rules.clone(),
            _ => Vec::new(),
        };

        if rules.is_empty() {
            return Ok(StageOutcome::ok(StageOutput::Similarity { matches: Vec::new() }, None));
        }

        let Some(corpus) = ctx.corpus.as_ref() else {
            return Err(StageError::ConfigError("no rule corpus index configured".to_string()));
        };

        let model_config = require_agent_model(ctx.config, EMBEDDING_AGENT)?;
        let k = if ctx.config.similarity_k == 0 { DEFAULT_K } else { ctx.config.similarity_k } as usize;

        let mut all_matches = Vec::new();
        for (rule_index, rule) in rules.iter().enumerate() {
            let embedding = ctx
                .gateway
                .embed(model_config.provider, &model_config.model, &rule.yaml_text)
                .await?;

            let neighbors = corpus
                .knn(&embedding, k)
                .await
                .map_err(|e| StageError::Unexpected(e.to_string()))?;

            let mut rule_matches: Vec<_> = neighbors
                .iter()
                .map(|neighbor| {
                    let metrics = compute_metrics(&rule.yaml_text, &neighbor.rule.yaml_text);
                    let classification = classify(
                        &metrics,
                        ctx.config.thresholds.similarity_duplicate,
                        ctx.config.thresholds.similarity_similar,
                    );
                    crate::models::SimilarityMatchResult {
                        rule_index,
                        matched_corpus_id: neighbor.rule.id,
                        metrics,
                        classification,
                    }
                })
                .collect();

            rule_matches.sort_by(|a, b| b.metrics.weighted_similarity.total_cmp(&a.metrics.weighted_similarity));
            all_matches.extend(rule_matches);
        }

        Ok(StageOutcome::ok(StageOutput::Similarity { matches: all_matches }, None))
    }
}
