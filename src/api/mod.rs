//! The Trigger Surface (§4.4): the axum HTTP router over engine-owned
//! endpoints. The scheduled sweeper side of §4.4 is a separate
//! in-process background task ([`crate::engine::sweeper`]); this module
//! is the HTTP half only.

pub mod handlers;
pub mod types;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::engine::WorkflowEngine;

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080, cors_enabled: true }
    }
}

/// Builds the axum `Router` for the Trigger Surface (§6 table).
pub fn build_router(engine: Arc<WorkflowEngine>, config: &ApiConfig) -> Router {
    let mut router = Router::new()
        .route("/workflow/articles/:id/trigger", post(handlers::trigger_article))
        .route("/workflow/executions/:id", get(handlers::get_execution))
        .route("/workflow/executions", get(handlers::list_executions))
        .route("/workflow/executions/:id/cancel", post(handlers::cancel_execution))
        .route("/health", get(handlers::health_check))
        .fallback(handlers::not_found)
        .with_state(engine)
        .layer(TraceLayer::new_for_http());

    if config.cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }
    router
}
