// huntwright - agentic workflow engine for CTI article triage
//
// Orchestrates a fixed stage DAG (OSDetect -> JunkFilter -> Rank ->
// ExtractSupervisor -> SigmaGen -> SimilarityMatch) over ingested CTI
// articles, backed by a durable catalog store and an external work queue.

//! # huntwright
//!
//! This crate implements the Agentic Workflow Engine: a scheduler,
//! executor, and state machine that runs a DAG of LLM-backed stages per
//! article with idempotent triggering,
//! at-most-one concurrent execution per article, per-stage retries, early
//! termination, typed aggregation of sub-agent outputs, and durable
//! per-execution history.
//!
//! ## Layout
//!
//! - [`models`]: the data model (articles, config, executions, stage
//!   outputs, observables, Sigma rules, similarity results).
//! - [`llm`]: the LLM Gateway — a uniform `complete`/`embed` interface over
//!   multiple providers with rate limiting and transient/permanent failure
//!   classification.
//! - [`validation`]: the Sigma rule validator and the strict structured-output
//!   deserializer used by the stage executors.
//! - [`similarity`]: atom/logic-shape similarity scoring and the Rule Corpus
//!   Index k-NN query surface.
//! - [`engine`]: the Catalog Store, Work Queue, stage executors, retry
//!   policy, and the `WorkflowEngine` itself.
//! - [`api`]: the HTTP trigger surface.

pub mod engine;
pub mod llm;
pub mod models;
pub mod similarity;
pub mod validation;

pub mod api;

pub use models::{
    Article, Execution, ExecutionStatus, Observable, Source, StageOutput, StageResult,
    WorkflowConfig,
};

pub use engine::{
    storage::{CatalogStore, InMemoryCatalogStore},
    workflow_engine::WorkflowEngine,
};

use thiserror::Error;

/// Crate-wide error type for everything that isn't a stage-scoped
/// [`engine::stages::StageError`]: storage failures, queue failures,
/// malformed input reaching the engine boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("article not found: {0}")]
    ArticleNotFound(uuid::Uuid),

    #[error("execution not found: {0}")]
    ExecutionNotFound(uuid::Uuid),

    #[error("execution {0} is already active for article {1}")]
    AlreadyActive(uuid::Uuid, uuid::Uuid),

    #[error("execution {0} is already terminal, cannot cancel")]
    AlreadyTerminal(uuid::Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
