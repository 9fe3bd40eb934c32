//! REST API handlers.
//!
//! Successful responses are the bare JSON payload. Failures share the
//! `{success: false, error}` shape.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use pulse_core::{RawScore, Resolution, MIN_TIMESTAMP};
use pulsegrid_engine::EngineError;
use pulsegrid_metrics::SnapshotSource;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ApiState;

/// Completed buckets returned when the caller gives no `start`.
const DEFAULT_BUCKETS: i64 = 100;

/// Error body.
#[derive(Serialize)]
struct ApiResponse {
    success: bool,
    error: String,
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse {
            success: false,
            error: msg.to_string(),
        }),
    )
        .into_response()
}

pub(crate) fn engine_error(e: &EngineError) -> axum::response::Response {
    let status = match e {
        EngineError::Core(_) | EngineError::InvalidQuery(_) => StatusCode::BAD_REQUEST,
        EngineError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status)
}

// ── Time series ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct TimeseriesParams {
    pub entity: Option<String>,
    pub resolution: Option<String>,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

/// GET /api/v1/timeseries?entity=&resolution=&start=&end=
///
/// `end` defaults to now and `start` to one hundred buckets before `end`.
pub async fn get_timeseries(
    State(state): State<ApiState>,
    Query(params): Query<TimeseriesParams>,
) -> impl IntoResponse {
    let Some(entity) = params.entity else {
        return error_response("missing query parameter: entity", StatusCode::BAD_REQUEST);
    };
    let Some(resolution) = params.resolution else {
        return error_response("missing query parameter: resolution", StatusCode::BAD_REQUEST);
    };
    let resolution: Resolution = match resolution.parse() {
        Ok(r) => r,
        Err(e) => return engine_error(&EngineError::Core(e)),
    };
    let end = params.end.unwrap_or_else(|| state.engine.clock().now());
    let start = params.start.unwrap_or_else(|| {
        end.saturating_sub(DEFAULT_BUCKETS * resolution.duration_secs())
            .max(MIN_TIMESTAMP)
    });

    match state.engine.query().query(&entity, resolution, start, end) {
        Ok(result) => Json(result).into_response(),
        Err(e) => engine_error(&e),
    }
}

// ── Ingest ─────────────────────────────────────────────────────

/// POST /api/v1/scores
pub async fn ingest_score(
    State(state): State<ApiState>,
    Json(score): Json<RawScore>,
) -> impl IntoResponse {
    match state.engine.ingest(score).await {
        Ok(report) => (StatusCode::CREATED, Json(report)).into_response(),
        Err(e) => engine_error(&e),
    }
}

// ── Resolutions ────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ResolutionInfo {
    pub resolution: Resolution,
    pub duration_secs: i64,
    pub ttl_secs: i64,
}

/// GET /api/v1/resolutions
pub async fn list_resolutions() -> impl IntoResponse {
    let resolutions: Vec<ResolutionInfo> = Resolution::ALL
        .into_iter()
        .map(|resolution| ResolutionInfo {
            resolution,
            duration_secs: resolution.duration_secs(),
            ttl_secs: resolution.ttl_secs(),
        })
        .collect();
    Json(resolutions)
}

// ── Health and metrics ─────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "degraded": state.engine.guards().any_degraded(),
        "subscribers": state.engine.dispatcher().connection_count(),
    }))
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let body = pulsegrid_metrics::render_prometheus(&state.engine.snapshot());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
