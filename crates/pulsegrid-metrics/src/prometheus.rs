//! Prometheus text exposition format.
//!
//! Renders an engine snapshot into the Prometheus text exposition format
//! for scraping by a Prometheus server or compatible agent.

use std::fmt::Write;

use crate::collector::EngineSnapshot;

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP pulsegrid_{name} {help}");
    let _ = writeln!(out, "# TYPE pulsegrid_{name} {kind}");
    let _ = writeln!(out, "pulsegrid_{name} {value}");
}

/// Render a snapshot into Prometheus text format.
///
/// Engine-wide series carry no labels; guard series are labelled by
/// `dependency`.
pub fn render_prometheus(snapshot: &EngineSnapshot) -> String {
    let mut out = String::new();

    metric(
        &mut out,
        "scores_ingested_total",
        "counter",
        "Scores accepted for ingestion.",
        snapshot.scores_ingested,
    );
    metric(
        &mut out,
        "scores_rejected_total",
        "counter",
        "Scores rejected as malformed.",
        snapshot.scores_rejected,
    );
    metric(
        &mut out,
        "fanout_upserts_applied_total",
        "counter",
        "Bucket upserts applied by the write fanout.",
        snapshot.upserts_applied,
    );
    metric(
        &mut out,
        "fanout_upserts_retried_total",
        "counter",
        "Bucket upserts retried after a per-key failure.",
        snapshot.upserts_retried,
    );
    metric(
        &mut out,
        "fanout_upserts_exhausted_total",
        "counter",
        "Bucket upserts abandoned after exhausting retries.",
        snapshot.upserts_exhausted,
    );
    metric(&mut out, "cache_hits_total", "counter", "Resolution cache hits.", snapshot.cache.hits);
    metric(
        &mut out,
        "cache_misses_total",
        "counter",
        "Resolution cache misses.",
        snapshot.cache.misses,
    );
    metric(
        &mut out,
        "cache_evictions_total",
        "counter",
        "Resolution cache FIFO evictions.",
        snapshot.cache.evictions,
    );
    metric(&mut out, "cache_entries", "gauge", "Entries currently cached.", snapshot.cache.entries);
    metric(
        &mut out,
        "cache_hit_rate",
        "gauge",
        "Cache hit rate (0.0-1.0).",
        format!("{:.4}", snapshot.cache.hit_rate),
    );
    metric(
        &mut out,
        "events_dispatched_total",
        "counter",
        "Stream events delivered to subscribers.",
        snapshot.events_dispatched,
    );
    metric(
        &mut out,
        "events_dropped_total",
        "counter",
        "Stream events dropped for full subscriber queues.",
        snapshot.events_dropped,
    );
    metric(&mut out, "subscribers", "gauge", "Connected stream subscribers.", snapshot.subscribers);

    out.push_str(
        "# HELP pulsegrid_breaker_state Circuit breaker state (0 closed, 1 open, 2 half-open).\n",
    );
    out.push_str("# TYPE pulsegrid_breaker_state gauge\n");
    for g in &snapshot.guards {
        if let Some(state) = g.breaker_state {
            let _ = writeln!(
                out,
                "pulsegrid_breaker_state{{dependency=\"{}\"}} {state}",
                g.dependency
            );
        }
    }

    out.push_str("# HELP pulsegrid_quota_used Calls counted against the current quota period.\n");
    out.push_str("# TYPE pulsegrid_quota_used gauge\n");
    for g in &snapshot.guards {
        if let Some(used) = g.quota_used {
            let _ = writeln!(out, "pulsegrid_quota_used{{dependency=\"{}\"}} {used}", g.dependency);
        }
    }

    out.push_str("# HELP pulsegrid_quota_limit Call budget per quota period.\n");
    out.push_str("# TYPE pulsegrid_quota_limit gauge\n");
    for g in &snapshot.guards {
        if let Some(limit) = g.quota_limit {
            let _ = writeln!(
                out,
                "pulsegrid_quota_limit{{dependency=\"{}\"}} {limit}",
                g.dependency
            );
        }
    }

    out
}
