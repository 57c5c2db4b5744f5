//! HTTP request/response DTOs for the Trigger Surface (§4.4, §6).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Execution, ExecutionStatus, StageResult, TerminationReason};
use crate::EngineError;

#[derive(Debug, Clone, Serialize)]
pub struct TriggerResponse {
    pub execution_id: Uuid,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResponse {
    pub status: ExecutionStatus,
    pub termination_reason: Option<TerminationReason>,
    pub discrete_huntables_count: u32,
    pub extraction_result: serde_json::Value,
    pub sigma_rules: serde_json::Value,
    pub similarity_results: serde_json::Value,
    pub stage_results: Vec<StageResult>,
}

impl ExecutionResponse {
    pub fn from_snapshot(execution: Execution, stage_results: Vec<StageResult>) -> Self {
        Self {
            status: execution.status,
            termination_reason: execution.termination_reason,
            discrete_huntables_count: execution.discrete_huntables_count,
            extraction_result: serde_json::to_value(&execution.extraction_result).unwrap_or(serde_json::Value::Null),
            sigma_rules: serde_json::to_value(&execution.sigma_rules).unwrap_or(serde_json::Value::Null),
            similarity_results: serde_json::to_value(&execution.similarity_results)
                .unwrap_or(serde_json::Value::Null),
            stage_results,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<Execution>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListExecutionsQuery {
    pub article_id: Option<Uuid>,
}

/// OpenAI-style `{"error": {...}}` envelope, adapted to this engine's
/// error taxonomy.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
}

pub fn create_error_response(message: String, error_type: impl Into<String>) -> ErrorResponse {
    ErrorResponse { error: ErrorDetail { message, error_type: error_type.into(), execution_id: None } }
}

/// Maps an [`EngineError`] onto the `(status, body)` pair the handlers
/// return; kept here so every handler classifies errors the same way.
pub fn engine_error_response(err: &EngineError) -> (axum::http::StatusCode, ErrorResponse) {
    use axum::http::StatusCode;
    match err {
        EngineError::ArticleNotFound(_) | EngineError::ExecutionNotFound(_) => {
            (StatusCode::NOT_FOUND, create_error_response(err.to_string(), "not_found"))
        }
        EngineError::AlreadyActive(existing, _) => {
            let mut resp = create_error_response(err.to_string(), "already_active");
            resp.error.execution_id = Some(*existing);
            (StatusCode::BAD_REQUEST, resp)
        }
        EngineError::AlreadyTerminal(_) => {
            (StatusCode::CONFLICT, create_error_response(err.to_string(), "already_terminal"))
        }
        EngineError::InvalidInput(_) => {
            (StatusCode::BAD_REQUEST, create_error_response(err.to_string(), "invalid_input"))
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, create_error_response(err.to_string(), "internal_error")),
    }
}
