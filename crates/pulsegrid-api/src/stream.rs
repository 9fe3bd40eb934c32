//! Server-sent event stream of bucket updates.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use pulse_core::{validate_entity_id, Resolution};
use pulsegrid_engine::{EngineError, StreamEvent, Subscription};
use serde::Deserialize;
use tracing::{info, warn};

use crate::ApiState;
use crate::handlers::{engine_error, error_response};

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Comma-separated, required.
    pub resolutions: Option<String>,
    /// Comma-separated; absent or empty means every entity.
    pub entities: Option<String>,
}

/// Parse the query into a subscription filter.
pub fn parse_subscription(params: &StreamParams) -> Result<Subscription, String> {
    let resolutions = params
        .resolutions
        .as_deref()
        .ok_or_else(|| "missing query parameter: resolutions".to_string())?;
    let resolutions = Resolution::parse_list(resolutions).map_err(|e| e.to_string())?;

    let mut entities = Vec::new();
    for entity in params
        .entities
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        validate_entity_id(entity).map_err(|e| e.to_string())?;
        entities.push(entity.to_string());
    }

    Subscription::new(entities, resolutions).map_err(|e| e.to_string())
}

fn to_sse(event: &StreamEvent) -> Event {
    let kind = event.kind().as_str();
    match serde_json::to_string(event) {
        Ok(json) => Event::default().event(kind).data(json),
        Err(e) => {
            warn!(kind, error = %e, "stream event not serializable");
            Event::default().comment("dropped event")
        }
    }
}

/// GET /api/v1/stream?resolutions=1m,5m&entities=AAPL
///
/// The subscription lives as long as the response body; a client
/// disconnect drops the stream and unsubscribes it.
pub async fn subscribe(
    State(state): State<ApiState>,
    Query(params): Query<StreamParams>,
) -> Response {
    let subscription = match parse_subscription(&params) {
        Ok(s) => s,
        Err(msg) => return error_response(&msg, StatusCode::BAD_REQUEST),
    };
    if state.engine.dispatcher().is_closed() {
        return engine_error(&EngineError::Unavailable(
            "server is shutting down".to_string(),
        ));
    }

    let stream = state.engine.dispatcher().subscribe(subscription);
    info!(connection = stream.id(), "stream opened");
    let events = stream.map(|event| Ok::<Event, Infallible>(to_sse(&event)));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}
