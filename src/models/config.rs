use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::llm::LLMProviderType;

/// Per-agent model selection, one entry per named agent (`os_detect`,
/// `junk_filter`, `rank`, `cmdline_extract`, `proctree_extract`,
/// `hunt_queries_extract`, `qa`, `sigma_gen`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentModelConfig {
    pub provider: LLMProviderType,
    pub model: String,
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub ranking: f64,
    pub junk_min_huntable_chunks: u32,
    pub similarity_duplicate: f64,
    pub similarity_similar: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            ranking: 5.0,
            junk_min_huntable_chunks: 1,
            similarity_duplicate: 0.95,
            similarity_similar: 0.80,
        }
    }
}

/// A versioned snapshot of engine-tunable configuration. Edited externally
/// (each edit creates a new version row); an [`crate::Execution`] captures
/// one version by value at trigger time and never re-reads live edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub version: u32,
    pub agent_models: HashMap<String, AgentModelConfig>,
    pub agent_prompts: HashMap<String, String>,
    pub thresholds: Thresholds,
    pub qa_enabled: HashMap<String, bool>,
    pub enabled_subagents: HashSet<String>,
    pub sigma_fallback_enabled: bool,
    pub similarity_k: u32,
    /// Whether OSDetect should proceed on an `unknown` classification
    /// rather than terminate early. Open question in the original design;
    /// defaults to `true` (proceed).
    pub os_detect_proceed_on_unknown: bool,
    pub auto_trigger_threshold: f64,
}

impl WorkflowConfig {
    pub fn agent_model(&self, agent: &str) -> Option<&AgentModelConfig> {
        self.agent_models.get(agent)
    }

    pub fn agent_prompt(&self, agent: &str) -> Option<&str> {
        self.agent_prompts.get(agent).map(String::as_str)
    }

    pub fn is_qa_enabled(&self, agent: &str) -> bool {
        self.qa_enabled.get(agent).copied().unwrap_or(false)
    }

    pub fn is_subagent_enabled(&self, name: &str) -> bool {
        self.enabled_subagents.contains(name)
    }
}
