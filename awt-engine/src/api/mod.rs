//! HTTP control surface
//!
//! Thin boundary over the core: handlers validate and delegate to the
//! job queue, shared state and repository. No test logic lives here.

pub mod handlers;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::diag::DiagnosticQueue;
use crate::state::SharedState;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: SqlitePool,
    pub state: Arc<SharedState>,
    pub diagnostics: Arc<DiagnosticQueue>,
    pub port: u16,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                .route("/status", get(handlers::get_status))
                .route("/tests", get(handlers::list_tests))
                .route("/tests/:name/run", post(handlers::run_test))
                .route("/abort", post(handlers::abort))
                .route("/results", get(handlers::get_results))
                .route("/reagents", get(handlers::get_reagents))
                .route("/schedules/reload", post(handlers::reload_schedules))
                .route("/diagnostics/:kind", post(handlers::run_diagnostic)),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "module": "awt-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "port": state.port,
    }))
}
