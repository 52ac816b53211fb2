//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::bench::{report, BenchError, RunSettings};
use crate::execution::ExecutionConfig;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route(
            "/executions",
            get(list_executions)
                .post(trigger_execution)
                .delete(delete_target_history),
        )
        .route(
            "/executions/{id}",
            get(get_execution).delete(delete_execution),
        )
        .route("/executions/{id}/stop", post(stop_execution))
        .route("/targets/{target}/status", get(target_status))
        .route("/benchmark", get(benchmark_state))
        .route("/benchmark/settings", put(update_settings))
        .route("/benchmark/start", post(start_benchmark))
        .route("/benchmark/stop", post(stop_benchmark))
        .route("/benchmark/continue", post(continue_benchmark))
        .route("/benchmark/restart", post(restart_benchmark))
        .route("/benchmark/export", get(export_benchmark))
        .route(
            "/measurements",
            get(list_measurements).delete(purge_measurements),
        )
        .route("/measurements/{id}", delete(delete_measurement))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TargetQuery {
    target: Option<String>,
}

async fn list_executions(
    State(state): State<AppState>,
    Query(q): Query<TargetQuery>,
) -> ApiResult<Json<Value>> {
    let store = state.tracker.store();
    let list = match q.target {
        Some(target) => store.get_by_target_name(&target).await?,
        None => store.get_all().await?,
    };
    Ok(Json(json!({ "data": list, "meta": { "total": list.len() } })))
}

#[derive(Deserialize)]
struct TriggerBody {
    target: String,
    #[serde(default)]
    config: Option<ExecutionConfig>,
}

async fn trigger_execution(
    State(state): State<AppState>,
    Json(body): Json<TriggerBody>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let config = body
        .config
        .unwrap_or_else(|| state.tracker.config().execution.clone());
    let id = state.tracker.trigger_with(&body.target, &config).await?;
    state.tracker.spawn_tracking(id.clone());
    Ok((
        StatusCode::CREATED,
        Json(json!({ "data": { "id": id, "target_name": body.target } })),
    ))
}

async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let execution = state
        .tracker
        .store()
        .get_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("execution '{}'", id)))?;
    let live = state.tracker.live().get(&id);
    Ok(Json(json!({
        "data": execution,
        "meta": {
            "phase": live.as_ref().map(|l| l.phase),
            "provider_status": live.and_then(|l| l.provider_status),
            "tracking": state.tracker.is_tracking(&id),
        }
    })))
}

async fn stop_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let status = state.tracker.stop(&id).await?;
    Ok(Json(json!({ "data": { "id": id, "status": status } })))
}

async fn delete_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.tracker.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("execution '{}'", id)))
    }
}

async fn delete_target_history(
    State(state): State<AppState>,
    Query(q): Query<TargetQuery>,
) -> ApiResult<Json<Value>> {
    let target = q
        .target
        .ok_or_else(|| ApiError::BadRequest("missing 'target' query parameter".to_string()))?;
    let removed = state.tracker.delete_target(&target).await?;
    Ok(Json(json!({ "data": { "target_name": target, "removed": removed } })))
}

async fn target_status(
    State(state): State<AppState>,
    Path(target): Path<String>,
) -> Json<Value> {
    Json(json!({ "data": state.tracker.live().target_status(&target) }))
}

// ---------------------------------------------------------------------------
// Benchmark
// ---------------------------------------------------------------------------

async fn benchmark_state(State(state): State<AppState>) -> Json<Value> {
    let orch = &state.orchestrator;
    Json(json!({
        "data": {
            "running": orch.is_running(),
            "tasks": orch.tasks(),
            "active": orch.active_pipelines(),
            "settings": orch.settings(),
        }
    }))
}

async fn update_settings(
    State(state): State<AppState>,
    Json(settings): Json<RunSettings>,
) -> ApiResult<Json<Value>> {
    state.orchestrator.set_settings(settings)?;
    Ok(Json(json!({ "data": state.orchestrator.settings() })))
}

async fn start_benchmark(State(state): State<AppState>) -> ApiResult<StatusCode> {
    if state.orchestrator.is_running() {
        return Err(BenchError::AlreadyRunning.into());
    }
    let orch = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orch.start().await {
            warn!(error = %e, "Benchmark run not started");
        }
    });
    info!("Benchmark run requested");
    Ok(StatusCode::ACCEPTED)
}

async fn stop_benchmark(State(state): State<AppState>) -> StatusCode {
    state.orchestrator.stop_all().await;
    StatusCode::ACCEPTED
}

async fn continue_benchmark(State(state): State<AppState>) -> ApiResult<StatusCode> {
    if state.orchestrator.is_running() {
        return Err(BenchError::AlreadyRunning.into());
    }
    let orch = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orch.continue_run().await {
            warn!(error = %e, "Benchmark run not continued");
        }
    });
    Ok(StatusCode::ACCEPTED)
}

async fn restart_benchmark(State(state): State<AppState>) -> StatusCode {
    let orch = state.orchestrator.clone();
    tokio::spawn(async move {
        if let Err(e) = orch.restart().await {
            warn!(error = %e, "Benchmark restart failed");
        }
    });
    StatusCode::ACCEPTED
}

async fn export_benchmark(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let json = report::export_json(&state.orchestrator.tasks())
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let value: Value =
        serde_json::from_str(&json).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({ "data": value })))
}

// ---------------------------------------------------------------------------
// Measurements
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TaskQuery {
    task: Option<String>,
}

async fn list_measurements(
    State(state): State<AppState>,
    Query(q): Query<TaskQuery>,
) -> ApiResult<Json<Value>> {
    let list = match q.task {
        Some(name) => state.measurements.get_by_task_name(&name).await?,
        None => state.measurements.get_all().await?,
    };
    Ok(Json(json!({ "data": list, "meta": { "total": list.len() } })))
}

async fn purge_measurements(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let removed = state.measurements.purge().await?;
    Ok(Json(json!({ "data": { "removed": removed } })))
}

async fn delete_measurement(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.measurements.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("measurement '{}'", id)))
    }
}
