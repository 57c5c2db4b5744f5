use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::extraction::ExtractionResult;
use super::sigma::GeneratedSigmaRule;
use super::similarity::SimilarityMatchResult;
use super::stage::StageName;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TerminatedEarly,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Queued | ExecutionStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    NonWindowsOsDetected,
    JunkFiltered,
    BelowRankThreshold,
    Cancelled,
    DeadlineExceeded,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::NonWindowsOsDetected => "non_windows_os_detected",
            TerminationReason::JunkFiltered => "junk_filtered",
            TerminationReason::BelowRankThreshold => "below_rank_threshold",
            TerminationReason::Cancelled => "cancelled",
            TerminationReason::DeadlineExceeded => "deadline_exceeded",
        }
    }
}

/// `error.stage` / `error.kind` surfaced on a `failed` execution (§7
/// "User-visible behavior").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionError {
    pub stage: StageName,
    pub kind: String,
    pub detail: String,
}

/// One workflow run bound to exactly one article and one config version.
/// Exclusively owned, once `running`, by the worker that performed the
/// `queued -> running` claim (§3 "Ownership"); all other readers are
/// read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub article_id: Uuid,
    pub status: ExecutionStatus,
    pub termination_reason: Option<TerminationReason>,
    pub config_version: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub discrete_huntables_count: u32,
    pub extraction_result: Option<ExtractionResult>,
    pub sigma_rules: Vec<GeneratedSigmaRule>,
    pub similarity_results: Vec<SimilarityMatchResult>,
    pub error: Option<ExecutionError>,
    pub created_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(article_id: Uuid, config_version: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            article_id,
            status: ExecutionStatus::Queued,
            termination_reason: None,
            config_version,
            started_at: None,
            finished_at: None,
            discrete_huntables_count: 0,
            extraction_result: None,
            sigma_rules: Vec::new(),
            similarity_results: Vec::new(),
            error: None,
            created_at: now,
        }
    }

    pub fn claim(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn complete(&mut self) {
        self.status = ExecutionStatus::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn terminate_early(&mut self, reason: TerminationReason) {
        self.status = ExecutionStatus::TerminatedEarly;
        self.termination_reason = Some(reason);
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: ExecutionError) {
        self.status = ExecutionStatus::Failed;
        self.error = Some(error);
        self.finished_at = Some(Utc::now());
    }
}
