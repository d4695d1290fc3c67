//! API route definitions.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use tracing::{error, info};

use super::state::AppState;
use crate::engine::{EngineError, RunHandle, StressTest};
use crate::plan::RunId;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(server_info))
        .route("/tests", get(list_tests).post(create_test))
        .route("/tests/{id}", get(get_test).delete(cancel_test))
}

/// Error body returned by every handler: `{"error": {"message": ...}}`.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("test with id {id} not found"),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::Plan(_)
            | EngineError::InvalidTestId(_)
            | EngineError::EmptyExecutionOrder => StatusCode::BAD_REQUEST,
            EngineError::TargetUnreachable { .. } => StatusCode::BAD_GATEWAY,
            EngineError::NotInitialized(_) | EngineError::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": { "message": self.message } })),
        )
            .into_response()
    }
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

async fn server_info(State(state): State<AppState>) -> Json<Value> {
    let settings = state.engine.settings();
    let (active_runs, in_flight) = {
        let active = state.active.lock().await;
        let in_flight: usize = active.values().map(RunHandle::in_flight).sum();
        (active.len(), in_flight)
    };
    Json(json!({
        "data": {
            "server_id": state.server_id,
            "version": env!("CARGO_PKG_VERSION"),
            "max_concurrency": settings.max_concurrency,
            "request_timeout_ms": u64::try_from(settings.request_timeout.as_millis())
                .unwrap_or(u64::MAX),
            "active_runs": active_runs,
            "in_flight": in_flight,
        }
    }))
}

/// Accept a plan document, initialize it and start executing in the background.
async fn create_test(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut test = StressTest::new(&body, &state.engine).await?;
    test.initialize().await?;

    let run_id = test.id().clone();
    let plan = test.plan().clone();
    state
        .active
        .lock()
        .await
        .insert(run_id.clone(), test.handle());

    let active = Arc::clone(&state.active);
    tokio::spawn(async move {
        let id = test.id().clone();
        match test.execute().await {
            Ok(summary) => info!(run_id = %id, chunks = summary.chunks_run, "Background run done"),
            Err(e) => error!(run_id = %id, error = %e, "Background run failed"),
        }
        active.lock().await.remove(&id);
    });

    let entries = state
        .engine
        .store()
        .snapshot(&run_id)
        .await
        .unwrap_or_default();

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "data": { "id": run_id, "plan": plan, "entries": entries },
            "meta": { "created_at": chrono::Utc::now().to_rfc3339() }
        })),
    ))
}

async fn list_tests(State(state): State<AppState>) -> Json<Value> {
    let all = state.engine.store().snapshot_all().await;
    Json(json!({ "meta": { "total": all.len() }, "data": all }))
}

async fn get_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let run_id = RunId::from(id.as_str());
    let entries = state
        .engine
        .store()
        .snapshot(&run_id)
        .await
        .ok_or_else(|| ApiError::not_found(&id))?;
    let handle = state.active.lock().await.get(&run_id).cloned();

    Ok(Json(json!({
        "data": entries,
        "meta": {
            "id": run_id,
            "active": handle.is_some(),
            "in_flight": handle.as_ref().map_or(0, RunHandle::in_flight),
        }
    })))
}

async fn cancel_test(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let run_id = RunId::from(id.as_str());

    if let Some(handle) = state.active.lock().await.get(&run_id) {
        handle.cancel();
        info!(run_id = %run_id, "Run cancellation requested");
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "data": { "id": run_id, "cancelled": true } })),
        ));
    }

    if state.engine.store().snapshot(&run_id).await.is_some() {
        return Err(ApiError {
            status: StatusCode::CONFLICT,
            message: format!("test with id {id} is not running"),
        });
    }
    Err(ApiError::not_found(&id))
}
