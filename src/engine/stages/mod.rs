//! Stage executors (§4.3): one per DAG node, each a (mostly) pure
//! function of `(article, prior outputs, agent config, LLM gateway)`.
//!
//! Every executor implements [`StageExecutor`] and returns a
//! [`StageOutcome`] on success or a [`StageError`] that the engine's
//! retry loop (`engine::workflow_engine`) classifies.

mod extract_supervisor;
mod junk_filter;
mod os_detect;
mod rank;
mod sigma_gen;
mod similarity_match;

pub use extract_supervisor::ExtractSupervisorStage;
pub use junk_filter::JunkFilterStage;
pub use os_detect::OsDetectStage;
pub use rank::RankStage;
pub use sigma_gen::SigmaGenStage;
pub use similarity_match::SimilarityMatchStage;

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::LlmGateway;
use crate::models::{Article, LlmTelemetry, StageName, StageOutput, TerminationReason, WorkflowConfig};
use crate::similarity::CorpusIndex;

/// The error taxonomy of §7, narrowed to what the stage retry loop needs
/// to branch on. `PolicyViolation` is folded into `ValidationFailure` at
/// construction (§7) since both retry with feedback the same way;
/// `Cancelled` and `Unexpected` are both terminal for the stage.
#[derive(Debug, Error, Clone)]
pub enum StageError {
    /// Network, 5xx, rate-limit, timeout: retried with backoff, no
    /// feedback text (§4.1 retry table).
    #[error("transient: {0}")]
    Transient(String),
    /// Structured-output or Sigma validation failed: retried with the
    /// failure text fed back into the next attempt's prompt.
    #[error("validation failure: {0}")]
    ValidationFailure(String),
    /// Missing model/prompt/disabled provider: not retried.
    #[error("config error: {0}")]
    ConfigError(String),
    /// Operator cancel or deadline exceeded: terminal, not a stage bug.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// Anything else: captured verbatim, terminal for the stage.
    #[error("unexpected: {0}")]
    Unexpected(String),
}

impl StageError {
    /// A stage producing output that violates an invariant (e.g. ProcTree
    /// with a `cmd.exe` parent surviving QA) is a `PolicyViolation`,
    /// which this crate represents as a `ValidationFailure` (§7).
    pub fn policy_violation(detail: impl Into<String>) -> Self {
        StageError::ValidationFailure(detail.into())
    }

    pub fn is_retryable_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn is_retryable_with_feedback(&self) -> bool {
        matches!(self, StageError::ValidationFailure(_))
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            StageError::Transient(_) => "transient",
            StageError::ValidationFailure(_) => "validation_failure",
            StageError::ConfigError(_) => "config_error",
            StageError::Cancelled(_) => "cancelled",
            StageError::Unexpected(_) => "unexpected",
        }
    }

    pub fn detail(&self) -> String {
        match self {
            StageError::Transient(d)
            | StageError::ValidationFailure(d)
            | StageError::ConfigError(d)
            | StageError::Cancelled(d)
            | StageError::Unexpected(d) => d.clone(),
        }
    }
}

impl From<crate::llm::LlmError> for StageError {
    fn from(err: crate::llm::LlmError) -> Self {
        if err.is_transient() {
            StageError::Transient(err.to_string())
        } else {
            StageError::ConfigError(err.to_string())
        }
    }
}

/// Everything a stage executor needs, rebuilt fresh by the engine for
/// each attempt so `retry_feedback` can carry the prior attempt's error
/// text into the next prompt (§4.1 "feeding the prior parse error back
/// into the prompt").
pub struct StageContext<'a> {
    pub article: &'a Article,
    pub config: &'a WorkflowConfig,
    pub gateway: &'a LlmGateway,
    pub corpus: Option<Arc<dyn CorpusIndex>>,
    pub cancel: &'a CancellationToken,
    /// Prior attempt's error text, for stages that retry-with-feedback.
    pub retry_feedback: Option<String>,
    /// Prior stage outputs this stage may read (e.g. ExtractSupervisor's
    /// output for SigmaGen, SigmaGen's output for SimilarityMatch).
    pub prior_outputs: &'a [StageOutput],
}

impl<'a> StageContext<'a> {
    pub fn prior_output(&self, stage: StageName) -> Option<&StageOutput> {
        self.prior_outputs.iter().find(|o| stage_name_of(o) == stage)
    }
}

fn stage_name_of(output: &StageOutput) -> StageName {
    match output {
        StageOutput::OsDetect { .. } => StageName::OsDetect,
        StageOutput::JunkFilter { .. } => StageName::JunkFilter,
        StageOutput::Rank { .. } => StageName::Rank,
        StageOutput::Extract(_) => StageName::ExtractSupervisor,
        StageOutput::Sigma { .. } => StageName::SigmaGen,
        StageOutput::Similarity { .. } => StageName::SimilarityMatch,
    }
}

/// The successful result of one stage attempt: its typed output, any LLM
/// telemetry to attach to the `StageResult` row, and an optional early
/// termination signal (§4.1 "Early termination rules").
pub struct StageOutcome {
    pub output: StageOutput,
    pub telemetry: Option<LlmTelemetry>,
    pub terminate: Option<TerminationReason>,
}

impl StageOutcome {
    pub fn ok(output: StageOutput, telemetry: Option<LlmTelemetry>) -> Self {
        Self { output, telemetry, terminate: None }
    }

    pub fn terminate(output: StageOutput, telemetry: Option<LlmTelemetry>, reason: TerminationReason) -> Self {
        Self { output, telemetry, terminate: Some(reason) }
    }
}

#[async_trait::async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage_name(&self) -> StageName;
    async fn execute(&self, ctx: &StageContext<'_>) -> Result<StageOutcome, StageError>;
}

/// Looks up `agent` in the config snapshot's model table, surfacing a
/// non-retryable [`StageError::ConfigError`] when absent or disabled —
/// every stage's first step (§7 "ConfigError: missing model, missing
/// prompt, disabled provider. Not recovered; stage fails permanently.").
pub(super) fn require_agent_model<'a>(
    config: &'a WorkflowConfig,
    agent: &str,
) -> Result<&'a crate::models::AgentModelConfig, StageError> {
    config
        .agent_model(agent)
        .ok_or_else(|| StageError::ConfigError(format!("no model configured for agent '{agent}'")))
}

pub(super) fn require_agent_prompt<'a>(config: &'a WorkflowConfig, agent: &str) -> Result<&'a str, StageError> {
    config
        .agent_prompt(agent)
        .ok_or_else(|| StageError::ConfigError(format!("no prompt configured for agent '{agent}'")))
}
