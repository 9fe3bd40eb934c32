//! The assembled engine: ingest, background maintenance, and the handles
//! the API layer needs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use pulse_core::{PartialBucket, PulseConfig, RawScore, Resolution, SharedClock};
use pulsegrid_guard::GuardRegistry;
use pulsegrid_metrics::{EngineMetrics, EngineSnapshot, GuardGauge, SnapshotSource};
use pulsegrid_state::{RawScoreLog, StateStore, TimeseriesStore};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::cache::ResolutionCache;
use crate::dispatch::{Dispatcher, StreamEvent};
use crate::error::{EngineError, EngineResult};
use crate::fanout::{FanoutWriter, RetryPolicy};
use crate::partial::PartialComputer;
use crate::query::QueryService;

/// Entities idle for longer than the widest window stop being finalized.
const ACTIVE_HORIZON_SECS: i64 = 86_400;

/// Summary of one ingested score.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub entity_id: String,
    pub timestamp: i64,
    /// Resolutions written.
    pub applied: usize,
    /// Resolutions given up on after retries.
    pub exhausted: usize,
}

/// Counts from one retention pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PurgeReport {
    pub buckets: u32,
    pub raw_scores: u32,
}

pub struct Engine {
    config: PulseConfig,
    store: StateStore,
    clock: SharedClock,
    writer: FanoutWriter,
    cache: Arc<ResolutionCache>,
    partials: Arc<PartialComputer>,
    query: QueryService,
    dispatcher: Arc<Dispatcher>,
    guards: Arc<GuardRegistry>,
    metrics: Arc<EngineMetrics>,
    /// Entity id → latest score timestamp seen.
    active: DashMap<String, i64>,
    last_tick: Mutex<Option<i64>>,
}

impl Engine {
    /// Wire every component over `store`, restoring guard state and the
    /// set of recently active entities.
    pub fn new(config: PulseConfig, store: StateStore, clock: SharedClock) -> Self {
        let metrics = Arc::new(EngineMetrics::new());
        let guards = Arc::new(GuardRegistry::from_config(
            &config.guards,
            Arc::new(store.clone()),
            clock.clone(),
        ));
        let cache = Arc::new(ResolutionCache::new(config.cache.max_entries, clock.clone()));
        let partials = Arc::new(PartialComputer::new(
            Arc::new(store.clone()),
            clock.clone(),
            config.partial.refresh_secs,
        ));
        let writer = FanoutWriter::new(
            Arc::new(store.clone()),
            RetryPolicy::from(&config.fanout),
            metrics.clone(),
        );
        let query = QueryService::new(
            Arc::new(store.clone()),
            cache.clone(),
            partials.clone(),
            guards.clone(),
            clock.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            clock.clone(),
            metrics.clone(),
            guards.clone(),
        ));

        let active = DashMap::new();
        let since = clock.now() - ACTIVE_HORIZON_SECS;
        match store.entities_since(since) {
            Ok(entities) => {
                for (entity, last_seen) in entities {
                    active.insert(entity, last_seen);
                }
            }
            Err(e) => warn!(error = %e, "could not restore active entities"),
        }
        info!(active = active.len(), "engine ready");

        Self {
            config,
            store,
            clock,
            writer,
            cache,
            partials,
            query,
            dispatcher,
            guards,
            metrics,
            active,
            last_tick: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PulseConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn guards(&self) -> &Arc<GuardRegistry> {
        &self.guards
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn active_entities(&self) -> Vec<String> {
        let mut entities: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        entities.sort();
        entities
    }

    /// Validate, log, fan out and announce one score.
    ///
    /// Only malformed input is an error. Store trouble is retried and
    /// reported in the returned counts.
    pub async fn ingest(&self, score: RawScore) -> EngineResult<IngestReport> {
        if let Err(e) = score.validate() {
            self.metrics.record_rejected();
            debug!(entity = %score.entity_id, error = %e, "score rejected");
            return Err(EngineError::Core(e));
        }
        let now = self.clock.now();

        if let Err(e) = self.store.append_raw(&score) {
            warn!(entity = %score.entity_id, error = %e, "raw score not logged");
        }
        let outcome = self.writer.write(&score, now).await;
        self.metrics.record_ingested();
        self.active
            .entry(score.entity_id.clone())
            .and_modify(|ts| *ts = (*ts).max(score.timestamp))
            .or_insert(score.timestamp);

        let refresh = self.partials.refresh_secs();
        for bucket in &outcome.applied {
            self.cache.patch_bucket(bucket);
            let event = if bucket.is_open_at(now) {
                StreamEvent::PartialBucket(PartialBucket::new(bucket.clone(), now, refresh))
            } else {
                StreamEvent::bucket_update(bucket.clone())
            };
            self.dispatcher.notify(event);
        }

        debug!(
            entity = %score.entity_id,
            timestamp = score.timestamp,
            applied = outcome.applied.len(),
            exhausted = outcome.exhausted.len(),
            "score ingested"
        );
        Ok(IngestReport {
            entity_id: score.entity_id,
            timestamp: score.timestamp,
            applied: outcome.applied.len(),
            exhausted: outcome.exhausted.len(),
        })
    }

    /// Announce buckets whose window closed since the previous tick.
    ///
    /// Returns the number of `bucket_update` events queued. The first tick
    /// only records the time.
    pub fn finalize_windows(&self, now: i64) -> usize {
        let previous = self.last_tick.lock().replace(now);
        let Some(previous) = previous else {
            return 0;
        };
        self.active
            .retain(|_, last_seen| now - *last_seen < ACTIVE_HORIZON_SECS);

        let entities = self.active_entities();
        let mut queued = 0;
        for resolution in Resolution::ALL {
            let current = resolution.floor(now);
            let first = resolution.floor(previous);
            if current <= first {
                continue;
            }
            // Every window starting in [first, current) closed since the last
            // tick, however long the gap between ticks was.
            for entity in &entities {
                match self.store.range_query(entity, resolution, first, current - 1) {
                    Ok(buckets) => {
                        for bucket in buckets {
                            self.cache.patch_bucket(&bucket);
                            self.dispatcher.notify(StreamEvent::bucket_update(bucket));
                            queued += 1;
                        }
                    }
                    Err(e) => warn!(
                        %entity,
                        %resolution,
                        from = first,
                        error = %e,
                        "closed buckets unreadable"
                    ),
                }
            }
        }
        if queued > 0 {
            debug!(queued, "closed windows announced");
        }
        queued
    }

    /// Recompute and announce the partial bucket of every active entity at
    /// every resolution. Returns the number of events queued.
    pub fn refresh_partials(&self, now: i64) -> usize {
        let mut queued = 0;
        for entity in self.active_entities() {
            for resolution in Resolution::ALL {
                match self.partials.compute_at(&entity, resolution, now) {
                    Ok(Some(partial)) => {
                        self.dispatcher.notify(StreamEvent::PartialBucket(partial));
                        queued += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(%entity, %resolution, error = %e, "partial refresh failed");
                    }
                }
            }
        }
        queued
    }

    /// Delete expired buckets and raw scores past their retention.
    pub fn purge(&self, now: i64) -> EngineResult<PurgeReport> {
        let buckets = self.store.purge_expired_buckets(now)?;
        let cutoff = now - self.config.retention.raw_retention_secs as i64;
        let raw_scores = self.store.purge_raw_before(cutoff)?;
        if buckets > 0 || raw_scores > 0 {
            info!(buckets, raw_scores, "retention purge");
        }
        Ok(PurgeReport {
            buckets,
            raw_scores,
        })
    }

    /// Run window finalization, partial refresh and retention purge until
    /// shutdown signal.
    pub async fn run_maintenance(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(Duration::from_secs(1));
        let mut refresh =
            tokio::time::interval(Duration::from_secs(self.config.partial.refresh_secs.max(1)));
        let mut purge = tokio::time::interval(Duration::from_secs(
            self.config.retention.purge_interval_secs.max(1),
        ));
        for interval in [&mut tick, &mut refresh, &mut purge] {
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        }
        info!("engine maintenance started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.finalize_windows(self.clock.now());
                }
                _ = refresh.tick() => {
                    self.refresh_partials(self.clock.now());
                }
                _ = purge.tick() => {
                    if let Err(e) = self.purge(self.clock.now()) {
                        warn!(error = %e, "retention purge failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("engine maintenance shutting down");
                    break;
                }
            }
        }
    }
}

impl SnapshotSource for Engine {
    fn snapshot(&self) -> EngineSnapshot {
        let mut snapshot = self.metrics.snapshot();
        snapshot.cache = self.cache.gauges();
        snapshot.subscribers = self.dispatcher.connection_count() as u64;

        let guards = self.guards.snapshot();
        let mut gauges: Vec<GuardGauge> = guards
            .breakers
            .iter()
            .map(|b| GuardGauge {
                dependency: b.dependency_id.clone(),
                breaker_state: Some(b.state.as_gauge()),
                ..GuardGauge::default()
            })
            .collect();
        for q in &guards.quotas {
            match gauges.iter_mut().find(|g| g.dependency == q.dependency_id) {
                Some(g) => {
                    g.quota_used = Some(q.used);
                    g.quota_limit = Some(q.limit);
                }
                None => gauges.push(GuardGauge {
                    dependency: q.dependency_id.clone(),
                    quota_used: Some(q.used),
                    quota_limit: Some(q.limit),
                    ..GuardGauge::default()
                }),
            }
        }
        snapshot.guards = gauges;
        snapshot
    }
}
