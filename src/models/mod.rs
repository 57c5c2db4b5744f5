//! Domain model for the CTI agentic workflow engine.
//!
//! Mirrors the entities in the data model: [`Source`] and [`Article`] are
//! produced by external collectors and read-only to the engine;
//! [`WorkflowConfig`] is snapshotted by value into each [`Execution`] at
//! trigger time; [`StageResult`] rows are the append-only per-attempt
//! history of a running execution.

mod article;
mod config;
mod execution;
mod extraction;
mod observable;
mod sigma;
mod similarity;
mod source;
mod stage;

pub use article::Article;
pub use config::{AgentModelConfig, Thresholds, WorkflowConfig};
pub use execution::{Execution, ExecutionError, ExecutionStatus, TerminationReason};
pub use extraction::{ExtractionResult, HuntQuery, ProcessLineageEntry, QueryType, SubAgentResult};
pub use observable::{Observable, ObservableType};
pub use sigma::{GeneratedSigmaRule, SigmaRule};
pub use similarity::{NoveltyClass, SimilarityMatchResult, SimilarityMetrics};
pub use source::Source;
pub use stage::{LlmTelemetry, StageName, StageOutput, StageResult, StageStatus};
