use tokio::sync::RwLock;

use crate::models::SigmaRule;
use crate::Result;

/// One k-NN neighbor returned by [`CorpusIndex::knn`], paired with the
/// cosine similarity of its embedding to the query vector.
#[derive(Debug, Clone)]
pub struct CorpusMatch {
    pub rule: SigmaRule,
    pub cosine_similarity: f32,
}

/// Read surface over the Rule Corpus Index (§2.5). The index itself is
/// managed by an external SigmaHQ sync + embedding backfill process,
/// which is out of scope here (§1 "Surrounding functionality"); the
/// engine only ever performs k-NN reads.
#[async_trait::async_trait]
pub trait CorpusIndex: Send + Sync {
    async fn knn(&self, embedding: &[f32], k: usize) -> Result<Vec<CorpusMatch>>;
}

/// An in-memory corpus sufficient for the engine's read path and for
/// tests; a production deployment would back this with a vector database
/// populated by the external sync job.
#[derive(Default)]
pub struct InMemoryCorpusIndex {
    rules: RwLock<Vec<SigmaRule>>,
}

impl InMemoryCorpusIndex {
    pub fn new(rules: Vec<SigmaRule>) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    pub async fn insert(&self, rule: SigmaRule) {
        self.rules.write().await.push(rule);
    }
}

#[async_trait::async_trait]
impl CorpusIndex for InMemoryCorpusIndex {
    async fn knn(&self, embedding: &[f32], k: usize) -> Result<Vec<CorpusMatch>> {
        let rules = self.rules.read().await;
        let mut scored: Vec<CorpusMatch> = rules
            .iter()
            .map(|rule| CorpusMatch {
                rule: rule.clone(),
                cosine_similarity: cosine_similarity(embedding, &rule.embedding),
            })
            .collect();
        scored.sort_by(|a, b| b.cosine_similarity.total_cmp(&a.cosine_similarity));
        scored.truncate(k);
        Ok(scored)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn rule(tag: &str, embedding: Vec<f32>) -> SigmaRule {
        SigmaRule {
            id: Uuid::new_v4(),
            yaml_text: format!("title: {tag}\n"),
            embedding,
            tags: vec![tag.to_string()],
        }
    }

    #[tokio::test]
    async fn knn_orders_by_descending_cosine_similarity() {
        let index = InMemoryCorpusIndex::new(vec![
            rule("far", vec![0.0, 1.0]),
            rule("near", vec![1.0, 0.01]),
            rule("mid", vec![0.7, 0.7]),
        ]);
        let matches = index.knn(&[1.0, 0.0], 2).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].rule.tags[0], "near");
    }
}
