//! API request handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use awt_common::db::models::JobCause;
use awt_common::db::{jobs, reagents, results, tests};

use super::AppState;
use crate::diag::Diagnostic;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": e.to_string() })),
    )
}

/// GET /api/v1/status
pub async fn get_status(State(app): State<AppState>) -> ApiResult {
    let queued = jobs::all_jobs(&app.db).await.map_err(internal_error)?;
    Ok(Json(json!({
        "system_status": app.state.status().await.as_str(),
        "current_test": app.state.current_test().await,
        "test_status": app.state.test_status().await,
        "abort_requested": app.state.abort_requested(),
        "jobs": queued.iter().map(|j| json!({
            "test": j.test_name,
            "status": j.status.as_str(),
            "cause": j.cause.as_str(),
            "queued_at": j.queued_at.to_rfc3339(),
        })).collect::<Vec<_>>(),
    })))
}

/// GET /api/v1/tests
pub async fn list_tests(State(app): State<AppState>) -> ApiResult {
    let all = tests::all_tests(&app.db).await.map_err(internal_error)?;
    Ok(Json(json!({
        "tests": all.iter().map(|t| json!({
            "name": t.name,
            "enabled": t.enabled,
            "kh_probe_test": t.kh_probe_test,
            "steps": t.active_steps().count(),
            "titration": t.titration.is_some(),
        })).collect::<Vec<_>>(),
    })))
}

/// POST /api/v1/tests/:name/run. Manual trigger, same path as the
/// scheduler's.
pub async fn run_test(State(app): State<AppState>, Path(name): Path<String>) -> ApiResult {
    let ts = tests::get_test(&app.db, &name).await.map_err(|e| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": e.to_string() })),
        )
    })?;
    if let Err(reason) = crate::exec::validate_runnable(&ts) {
        return Err((StatusCode::BAD_REQUEST, Json(json!({ "error": reason }))));
    }
    let job = jobs::enqueue(&app.db, &name, JobCause::Manual)
        .await
        .map_err(internal_error)?;
    info!("Queued job for test {name}");
    Ok(Json(json!({ "queued": name, "job": job.guid })))
}

/// POST /api/v1/abort. Cooperative: the run stops before its next
/// step, cleanup still happens.
pub async fn abort(State(app): State<AppState>) -> Json<Value> {
    app.state.request_abort();
    Json(json!({ "abort": "requested" }))
}

#[derive(Deserialize)]
pub struct ResultsQuery {
    pub limit: Option<i64>,
}

/// GET /api/v1/results
pub async fn get_results(
    State(app): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> ApiResult {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let rows = results::recent_results(&app.db, limit)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({
        "results": rows.iter().map(|r| json!({
            "test": r.test_name,
            "value": r.value,
            "status": r.status.as_str(),
            "performed_at": r.performed_at.to_rfc3339(),
        })).collect::<Vec<_>>(),
    })))
}

/// GET /api/v1/reagents
pub async fn get_reagents(State(app): State<AppState>) -> ApiResult {
    let slots = reagents::all_slots(&app.db).await.map_err(internal_error)?;
    Ok(Json(json!({
        "reagents": slots.iter().map(|s| json!({
            "slot": s.slot,
            "name": s.reagent_name,
            "has_agitator": s.has_agitator,
            "remaining_ml": s.remaining_ml,
        })).collect::<Vec<_>>(),
    })))
}

/// POST /api/v1/schedules/reload. Raised after configuration edits so
/// the scheduler re-derives its triggers.
pub async fn reload_schedules(State(app): State<AppState>) -> Json<Value> {
    app.state.request_schedule_reset();
    Json(json!({ "schedules": "reload requested" }))
}

#[derive(Deserialize)]
pub struct DiagnosticRequest {
    pub cycles: Option<u32>,
}

/// POST /api/v1/diagnostics/:kind
pub async fn run_diagnostic(
    State(app): State<AppState>,
    Path(kind): Path<String>,
    Json(request): Json<DiagnosticRequest>,
) -> ApiResult {
    let cycles = request.cycles.unwrap_or(1).clamp(1, 1000);
    let Some(diagnostic) = Diagnostic::parse(&kind, cycles) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("unknown diagnostic {kind}") })),
        ));
    };
    app.diagnostics.push(diagnostic);
    Ok(Json(json!({ "queued": kind, "cycles": cycles })))
}
