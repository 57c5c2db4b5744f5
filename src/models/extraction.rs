use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::observable::{Observable, ObservableType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    Kql,
    Splunk,
    Elastic,
    Falcon,
    Sentinelone,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLineageEntry {
    pub parent: String,
    pub child: String,
    pub arguments: Option<String>,
    pub context: Option<String>,
    pub source_text: String,
}

/// Sub-agents sometimes emit `query_text`/`platform` instead of the
/// canonical `query`/`type` (§9 "Dynamic field-name normalization"); the
/// `alias` attributes below accept both without a separate adapter pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HuntQuery {
    #[serde(alias = "query_text")]
    pub query: String,
    #[serde(rename = "type", alias = "platform")]
    pub query_type: QueryType,
    pub context: Option<String>,
}

/// The per-subtype result of one ExtractSupervisor sub-agent, after any QA
/// correction pass has been applied. A sub-agent failure isolates to this
/// struct: `items` becomes empty and `error` is populated, while sibling
/// sub-agents still contribute normally.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub items: Vec<Observable>,
    pub count: usize,
    pub error: Option<String>,
}

impl SubAgentResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            items: Vec::new(),
            count: 0,
            error: Some(error.into()),
        }
    }

    pub fn ok(items: Vec<Observable>) -> Self {
        let count = items.len();
        Self {
            items,
            count,
            error: None,
        }
    }
}

/// The ExtractSupervisor's fan-in aggregate: the merged, deterministically
/// ordered observable set plus the per-type breakdown it was built from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub subresults: BTreeMap<ObservableType, SubAgentResult>,
    pub observables: Vec<Observable>,
    pub content: String,
    pub discrete_huntables_count: usize,
}

impl ExtractionResult {
    /// Builds the merged aggregate from per-type sub-agent results,
    /// following the fan-in rule: observables sorted by type then by
    /// position in each type's items list, `content` is a newline-joined
    /// rendering, and the huntable count is the sum of per-type counts.
    pub fn merge(subresults: BTreeMap<ObservableType, SubAgentResult>) -> Self {
        let mut observables = Vec::new();
        for (_, result) in subresults.iter() {
            observables.extend(result.items.iter().cloned());
        }
        let content = observables
            .iter()
            .map(Observable::render)
            .collect::<Vec<_>>()
            .join("\n");
        let discrete_huntables_count = subresults.values().map(|r| r.count).sum();
        Self {
            subresults,
            observables,
            content,
            discrete_huntables_count,
        }
    }

    pub fn has_any_success(&self) -> bool {
        self.subresults.values().any(|r| r.error.is_none())
    }
}
