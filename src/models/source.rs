use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A feed configuration. Created and edited externally (collector
/// configuration UI); the engine only ever reads these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub identifier: String,
    pub url: String,
    pub rss_url: Option<String>,
    pub active: bool,
    pub check_frequency_s: u64,
    pub lookback_days: u32,
    pub allow_filters: Vec<String>,
    pub deny_filters: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
