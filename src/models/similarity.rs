use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `DUPLICATE ⟹ SIMILAR ⟹ ¬NOVEL` is a strict hierarchy (tested property
/// #7); the variant ordering here mirrors that, most-similar first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoveltyClass {
    Duplicate,
    Similar,
    Novel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimilarityMetrics {
    pub atom_jaccard: f64,
    /// `None` when the two rules' atom sets are identical (the source's
    /// own behavior is preserved here rather than collapsing to 0.0).
    pub logic_shape_similarity: Option<f64>,
    pub weighted_similarity: f64,
}

/// One corpus match for one generated Sigma rule, ordered by descending
/// `weighted_similarity` within a rule's match list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityMatchResult {
    pub rule_index: usize,
    pub matched_corpus_id: Uuid,
    pub metrics: SimilarityMetrics,
    pub classification: NoveltyClass,
}
