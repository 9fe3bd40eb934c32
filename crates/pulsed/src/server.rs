//! Process assembly: open the store, start background loops, serve HTTP,
//! and wind everything down on Ctrl-C.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use pulse_core::{PulseConfig, SystemClock};
use pulsegrid_engine::Engine;
use pulsegrid_metrics::MetricsReporter;
use pulsegrid_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};

pub async fn run(config: PulseConfig) -> anyhow::Result<()> {
    info!("PulseGrid daemon starting");

    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.server.data_dir.join("pulse.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let port = config.server.port;
    let report_interval = Duration::from_secs(config.metrics.report_interval_secs.max(1));
    let engine = Arc::new(Engine::new(config, store, Arc::new(SystemClock)));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let dispatcher = engine.dispatcher().clone();
    let dispatch_shutdown = shutdown_rx.clone();
    let dispatch_handle = tokio::spawn(async move {
        dispatcher.run(dispatch_shutdown).await;
    });

    let maintenance_engine = engine.clone();
    let maintenance_shutdown = shutdown_rx.clone();
    let maintenance_handle = tokio::spawn(async move {
        maintenance_engine.run_maintenance(maintenance_shutdown).await;
    });

    let reporter = MetricsReporter::new(engine.clone(), report_interval);
    let reporter_shutdown = shutdown_rx.clone();
    let reporter_handle = tokio::spawn(async move {
        reporter.run(reporter_shutdown).await;
    });

    // ── API server ─────────────────────────────────────────────

    let router = pulsegrid_api::build_router(engine);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Open streams end once the dispatcher closes them, so the server can
    // drain.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C, running until killed");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = dispatch_handle.await;
    let _ = maintenance_handle.await;
    let _ = reporter_handle.await;

    info!("PulseGrid daemon stopped");
    Ok(())
}
