//! pulsegrid-api: REST and SSE surface for PulseGrid.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/timeseries` | Completed buckets plus the partial bucket |
//! | GET | `/api/v1/stream` | Server-sent bucket and heartbeat events |
//! | POST | `/api/v1/scores` | Ingest one raw score |
//! | GET | `/api/v1/resolutions` | Supported resolutions |
//! | GET | `/api/v1/guards` | Breaker and quota states |
//! | GET | `/api/v1/guards/{dependency}/admission` | May the dependency be called |
//! | POST | `/api/v1/guards/{dependency}/success` | Record a successful call |
//! | POST | `/api/v1/guards/{dependency}/failure` | Record a failed call |
//! | POST | `/api/v1/guards/{dependency}/calls` | Count calls against the quota |
//! | GET | `/metrics` | Prometheus exposition |
//! | GET | `/healthz` | Liveness |

pub mod guard_handlers;
pub mod handlers;
pub mod stream;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use pulsegrid_engine::Engine;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

/// Build the complete router (REST + SSE + metrics).
pub fn build_router(engine: Arc<Engine>) -> Router {
    let state = ApiState { engine };

    let api_routes = Router::new()
        .route("/timeseries", get(handlers::get_timeseries))
        .route("/stream", get(stream::subscribe))
        .route("/scores", post(handlers::ingest_score))
        .route("/resolutions", get(handlers::list_resolutions))
        .route("/guards", get(guard_handlers::list_guards))
        .route("/guards/{dependency}/admission", get(guard_handlers::admission))
        .route("/guards/{dependency}/success", post(guard_handlers::record_success))
        .route("/guards/{dependency}/failure", post(guard_handlers::record_failure))
        .route("/guards/{dependency}/calls", post(guard_handlers::record_calls))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state.clone()))
        .route("/healthz", get(handlers::healthz).with_state(state))
}
