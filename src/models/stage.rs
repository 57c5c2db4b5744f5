use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extraction::ExtractionResult;
use super::sigma::GeneratedSigmaRule;
use super::similarity::SimilarityMatchResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    OsDetect,
    JunkFilter,
    Rank,
    ExtractSupervisor,
    SigmaGen,
    SimilarityMatch,
}

impl StageName {
    pub const DAG_ORDER: [StageName; 6] = [
        StageName::OsDetect,
        StageName::JunkFilter,
        StageName::Rank,
        StageName::ExtractSupervisor,
        StageName::SigmaGen,
        StageName::SimilarityMatch,
    ];

    pub fn index(&self) -> u32 {
        Self::DAG_ORDER.iter().position(|s| s == self).unwrap() as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::OsDetect => "os_detect",
            StageName::JunkFilter => "junk_filter",
            StageName::Rank => "rank",
            StageName::ExtractSupervisor => "extract_supervisor",
            StageName::SigmaGen => "sigma_gen",
            StageName::SimilarityMatch => "similarity_match",
        }
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

/// `StageOutput = OSDetect(enum) | JunkFilter(record) | Rank(record) |
/// Extract(record) | Sigma(list) | Similarity(list)` (design note §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    OsDetect { os: OsClass },
    JunkFilter { filtered_content: String, huntable_chunks: u32, total_chunks: u32 },
    Rank { score: f64, rationale: String },
    Extract(ExtractionResult),
    Sigma { rules: Vec<GeneratedSigmaRule> },
    Similarity { matches: Vec<SimilarityMatchResult> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsClass {
    Windows,
    Linux,
    Macos,
    CrossPlatform,
    Unknown,
}

impl OsClass {
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "windows" => OsClass::Windows,
            "linux" => OsClass::Linux,
            "macos" | "mac" | "osx" => OsClass::Macos,
            "cross_platform" | "cross-platform" => OsClass::CrossPlatform,
            _ => OsClass::Unknown,
        }
    }

    /// OSDetect terminates the execution early only for `linux` or
    /// `macos` (§4.3.a); `unknown` is governed by the config flag.
    pub fn terminates_early(&self) -> bool {
        matches!(self, OsClass::Linux | OsClass::Macos)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmTelemetry {
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
}

/// One attempt of one stage of one execution. Append-only: a retried
/// stage writes a new row with an incremented `attempt`, never mutates a
/// prior one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub execution_id: Uuid,
    pub stage_name: StageName,
    pub attempt: u32,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub input_fingerprint: String,
    /// Stable per-attempt nonce so downstream tracing can dedupe
    /// non-idempotent LLM calls (§4.1 "Idempotence").
    pub nonce: Uuid,
    pub output: Option<StageOutput>,
    pub llm_telemetry: Option<LlmTelemetry>,
    pub error: Option<String>,
}

impl StageResult {
    pub fn started(execution_id: Uuid, stage_name: StageName, attempt: u32, input_fingerprint: String) -> Self {
        Self {
            execution_id,
            stage_name,
            attempt,
            status: StageStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            input_fingerprint,
            nonce: Uuid::new_v4(),
            output: None,
            llm_telemetry: None,
            error: None,
        }
    }

    pub fn succeed(mut self, output: StageOutput, telemetry: Option<LlmTelemetry>) -> Self {
        self.status = StageStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.output = Some(output);
        self.llm_telemetry = telemetry;
        self
    }

    pub fn fail(mut self, error: impl Into<String>, timed_out: bool) -> Self {
        self.status = if timed_out { StageStatus::TimedOut } else { StageStatus::Failed };
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
        self
    }
}
