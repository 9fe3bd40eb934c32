//! pulsegrid-metrics: observability for the PulseGrid engine.
//!
//! Tracks ingest, fanout and dispatch counters, renders them in the
//! Prometheus text format, and logs a periodic activity summary.
//!
//! # Architecture
//!
//! ```text
//! EngineMetrics
//!   ├── record_*() ← called from ingest, fanout and dispatch paths
//!   └── snapshot() → EngineSnapshot (engine fills cache + guard gauges)
//!
//! Prometheus exposition
//!   └── render_prometheus() → text/plain for /metrics endpoint
//!
//! MetricsReporter
//!   └── run() → periodic summary log until shutdown
//! ```

pub mod collector;
pub mod prometheus;
pub mod reporter;

pub use collector::{CacheGauges, EngineMetrics, EngineSnapshot, GuardGauge};
pub use prometheus::render_prometheus;
pub use reporter::{Delta, MetricsReporter, SnapshotSource};
