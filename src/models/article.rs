use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A unit of CTI content. Content is immutable once stored; `metadata`
/// may be appended to by collectors after ingestion, but the engine never
/// writes to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: Uuid,
    pub source_id: Uuid,
    pub canonical_url: String,
    pub title: String,
    pub content: String,
    /// Set by the JunkFilter stage's huntable-chunk concatenation.
    /// `None` until that stage has run for some execution.
    pub filtered_content: Option<String>,
    pub content_hash: String,
    pub published_at: DateTime<Utc>,
    pub threat_hunting_score: f64,
    pub ml_hunt_score: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Article {
    /// Text handed to the extraction stages: filtered content if present,
    /// else the raw content.
    pub fn effective_content(&self) -> &str {
        self.filtered_content.as_deref().unwrap_or(&self.content)
    }
}
