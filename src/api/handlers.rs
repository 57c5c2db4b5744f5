//! Axum handlers for the engine-owned HTTP endpoints (§6 "HTTP surface").

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use uuid::Uuid;

use crate::engine::workflow_engine::TriggerOptions;
use crate::engine::WorkflowEngine;

use super::types::{engine_error_response, ExecutionResponse, ListExecutionsQuery, ListExecutionsResponse, TriggerResponse};

pub type SharedEngine = Arc<WorkflowEngine>;

/// `POST /workflow/articles/{id}/trigger` (§6). Body is `{}` and carries
/// no fields the engine reads; accepting an empty JSON object without an
/// extractor is enough.
pub async fn trigger_article(
    State(engine): State<SharedEngine>,
    Path(article_id): Path<Uuid>,
) -> impl IntoResponse {
    match engine.trigger(article_id, TriggerOptions::default()).await {
        Ok(outcome) => {
            let status = if outcome.accepted { StatusCode::OK } else { StatusCode::BAD_REQUEST };
            let body = TriggerResponse {
                execution_id: outcome.execution_id,
                accepted: outcome.accepted,
                reason: outcome.reason,
            };
            (status, Json(body)).into_response()
        }
        Err(err) => {
            let (status, body) = engine_error_response(&err);
            (status, Json(body)).into_response()
        }
    }
}

/// `GET /workflow/executions/{id}` (§6).
pub async fn get_execution(State(engine): State<SharedEngine>, Path(execution_id): Path<Uuid>) -> impl IntoResponse {
    match engine.get(execution_id).await {
        Ok(snapshot) => {
            let body = ExecutionResponse::from_snapshot(snapshot.execution, snapshot.stage_results);
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            let (status, body) = engine_error_response(&err);
            (status, Json(body)).into_response()
        }
    }
}

/// `GET /workflow/executions?article_id=X` (§6).
pub async fn list_executions(
    State(engine): State<SharedEngine>,
    Query(query): Query<ListExecutionsQuery>,
) -> impl IntoResponse {
    match engine.list(query.article_id).await {
        Ok(executions) => (StatusCode::OK, Json(ListExecutionsResponse { executions })).into_response(),
        Err(err) => {
            let (status, body) = engine_error_response(&err);
            (status, Json(body)).into_response()
        }
    }
}

/// `POST /workflow/executions/{id}/cancel` (§6): 202 on success, 409 if
/// the execution is already terminal.
pub async fn cancel_execution(
    State(engine): State<SharedEngine>,
    Path(execution_id): Path<Uuid>,
) -> impl IntoResponse {
    match engine.cancel(execution_id).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(err) => {
            let (status, body) = engine_error_response(&err);
            (status, Json(body)).into_response()
        }
    }
}

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(super::types::create_error_response("route not found".to_string(), "not_found")))
}
