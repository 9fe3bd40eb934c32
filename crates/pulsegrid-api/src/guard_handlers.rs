//! Circuit breaker and quota handlers for the ingestion collaborator.
//!
//! The collaborator asks for admission before calling an upstream and
//! reports the outcome afterwards.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use pulsegrid_guard::GuardError;
use serde::Deserialize;

use crate::ApiState;
use crate::handlers::error_response;

fn guard_error(e: &GuardError) -> Response {
    match e {
        GuardError::UnknownDependency(_) => error_response(&e.to_string(), StatusCode::NOT_FOUND),
    }
}

/// GET /api/v1/guards
pub async fn list_guards(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.engine.guards().snapshot())
}

#[derive(Debug, Default, Deserialize)]
pub struct AdmissionParams {
    #[serde(default)]
    pub conservative: bool,
}

/// GET /api/v1/guards/{dependency}/admission?conservative=
pub async fn admission(
    State(state): State<ApiState>,
    Path(dependency): Path<String>,
    Query(params): Query<AdmissionParams>,
) -> Response {
    match state
        .engine
        .guards()
        .admission(&dependency, params.conservative)
    {
        Ok(admission) => Json(admission).into_response(),
        Err(e) => guard_error(&e),
    }
}

/// POST /api/v1/guards/{dependency}/success
pub async fn record_success(
    State(state): State<ApiState>,
    Path(dependency): Path<String>,
) -> Response {
    match state.engine.guards().record_success(&dependency) {
        Ok(breaker_state) => Json(serde_json::json!({
            "dependency": dependency,
            "breaker_state": breaker_state,
        }))
        .into_response(),
        Err(e) => guard_error(&e),
    }
}

/// POST /api/v1/guards/{dependency}/failure
pub async fn record_failure(
    State(state): State<ApiState>,
    Path(dependency): Path<String>,
) -> Response {
    match state.engine.guards().record_failure(&dependency) {
        Ok(breaker_state) => Json(serde_json::json!({
            "dependency": dependency,
            "breaker_state": breaker_state,
        }))
        .into_response(),
        Err(e) => guard_error(&e),
    }
}

/// Calls request body.
#[derive(Debug, Deserialize)]
pub struct CallsRequest {
    pub calls: u64,
}

/// POST /api/v1/guards/{dependency}/calls
pub async fn record_calls(
    State(state): State<ApiState>,
    Path(dependency): Path<String>,
    Json(req): Json<CallsRequest>,
) -> Response {
    if req.calls == 0 {
        return error_response("calls must be positive", StatusCode::BAD_REQUEST);
    }
    match state.engine.guards().record_calls(&dependency, req.calls) {
        Ok(remaining) => Json(serde_json::json!({
            "dependency": dependency,
            "remaining": remaining,
        }))
        .into_response(),
        Err(e) => guard_error(&e),
    }
}
