use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A corpus rule as indexed by the (external) Rule Corpus Index. Managed
/// by an external sync process; the engine only ever reads these via
/// [`crate::similarity::CorpusIndex`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigmaRule {
    pub id: Uuid,
    pub yaml_text: String,
    pub embedding: Vec<f32>,
    pub tags: Vec<String>,
}

/// One SigmaGen-produced, validator-passing candidate, plus the attempt
/// log that produced it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedSigmaRule {
    pub yaml_text: String,
    pub attempts: u32,
}
