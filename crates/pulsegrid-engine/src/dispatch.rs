//! Real-time dispatch of bucket events to streaming subscribers.
//!
//! Writers call [`Dispatcher::notify`]; events are held per
//! (entity, resolution, window, kind) and only the latest one survives
//! until the next [`Dispatcher::flush`], which runs once per debounce
//! interval.
//! Each subscriber owns a bounded queue: a full queue drops that event for
//! that subscriber only, a closed queue removes the subscriber.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::Stream;
use parking_lot::Mutex;
use pulse_core::config::DispatchConfig;
use pulse_core::{Bucket, BucketView, PartialBucket, Resolution, SharedClock};
use pulsegrid_guard::GuardRegistry;
use pulsegrid_metrics::EngineMetrics;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};

/// Identifier of one streaming connection.
pub type ConnectionId = u64;

/// An event sent to subscribers, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A closed (or late-updated) bucket.
    BucketUpdate(BucketView),
    /// The in-progress bucket of the current window.
    PartialBucket(PartialBucket),
    /// Liveness tick. `degraded` is set while any guard is open or
    /// over its critical quota.
    Heartbeat {
        connections: usize,
        timestamp: i64,
        degraded: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BucketUpdate,
    PartialBucket,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BucketUpdate => "bucket_update",
            EventKind::PartialBucket => "partial_bucket",
            EventKind::Heartbeat => "heartbeat",
        }
    }
}

impl StreamEvent {
    pub fn bucket_update(bucket: Bucket) -> Self {
        StreamEvent::BucketUpdate(BucketView::from(bucket))
    }

    pub fn kind(&self) -> EventKind {
        match self {
            StreamEvent::BucketUpdate(_) => EventKind::BucketUpdate,
            StreamEvent::PartialBucket(_) => EventKind::PartialBucket,
            StreamEvent::Heartbeat { .. } => EventKind::Heartbeat,
        }
    }

    fn bucket(&self) -> Option<&Bucket> {
        match self {
            StreamEvent::BucketUpdate(view) => Some(&view.bucket),
            StreamEvent::PartialBucket(partial) => Some(&partial.bucket),
            StreamEvent::Heartbeat { .. } => None,
        }
    }
}

/// What a connection wants to receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    /// Empty means every entity.
    pub entities: HashSet<String>,
    /// Never empty.
    pub resolutions: HashSet<Resolution>,
}

impl Subscription {
    pub fn new(
        entities: impl IntoIterator<Item = String>,
        resolutions: impl IntoIterator<Item = Resolution>,
    ) -> EngineResult<Self> {
        let resolutions: HashSet<Resolution> = resolutions.into_iter().collect();
        if resolutions.is_empty() {
            return Err(EngineError::InvalidQuery(
                "subscription needs at least one resolution".to_string(),
            ));
        }
        Ok(Self {
            entities: entities.into_iter().collect(),
            resolutions,
        })
    }

    /// Whether an event for `entity_id` at `resolution` should be delivered.
    pub fn matches(&self, entity_id: &str, resolution: Resolution) -> bool {
        (self.entities.is_empty() || self.entities.contains(entity_id))
            && self.resolutions.contains(&resolution)
    }

    fn wants(&self, event: &StreamEvent) -> bool {
        match event.bucket() {
            Some(bucket) => self.matches(&bucket.entity_id, bucket.resolution),
            None => true,
        }
    }
}

struct Subscriber {
    subscription: Subscription,
    tx: mpsc::Sender<StreamEvent>,
    /// Last successful delivery (or subscribe time), epoch seconds.
    last_delivery: AtomicI64,
}

/// Entity, resolution, bucket start and kind.
type CoalesceKey = (String, Resolution, i64, EventKind);

#[derive(Default)]
struct Pending {
    order: Vec<CoalesceKey>,
    latest: HashMap<CoalesceKey, StreamEvent>,
}

/// Result of one delivery pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub dropped: usize,
    pub closed: usize,
}

pub struct Dispatcher {
    subscribers: DashMap<ConnectionId, Subscriber>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    /// Set by `close_all`; later subscriptions end immediately.
    closed: AtomicBool,
    config: DispatchConfig,
    clock: SharedClock,
    metrics: Arc<EngineMetrics>,
    guards: Arc<GuardRegistry>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        clock: SharedClock,
        metrics: Arc<EngineMetrics>,
        guards: Arc<GuardRegistry>,
    ) -> Self {
        Self {
            subscribers: DashMap::new(),
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            config,
            clock,
            metrics,
            guards,
        }
    }

    /// Register a connection. Dropping the returned stream unsubscribes it.
    pub fn subscribe(self: &Arc<Self>, subscription: Subscription) -> SubscriptionStream {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        if self.is_closed() {
            debug!(connection = id, "dispatcher closed, stream ends immediately");
            return SubscriptionStream {
                id,
                rx,
                dispatcher: Arc::clone(self),
            };
        }
        info!(
            connection = id,
            entities = subscription.entities.len(),
            resolutions = subscription.resolutions.len(),
            "stream subscriber connected"
        );
        self.subscribers.insert(
            id,
            Subscriber {
                subscription,
                tx,
                last_delivery: AtomicI64::new(self.clock.now()),
            },
        );
        self.metrics.set_subscribers(self.subscribers.len());
        SubscriptionStream {
            id,
            rx,
            dispatcher: Arc::clone(self),
        }
    }

    pub fn unsubscribe(&self, id: ConnectionId) {
        if self.subscribers.remove(&id).is_some() {
            debug!(connection = id, "stream subscriber removed");
            self.metrics.set_subscribers(self.subscribers.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Queue an event, replacing any pending event for the same bucket and
    /// kind. Heartbeats bypass the queue.
    pub fn notify(&self, event: StreamEvent) {
        let Some(bucket) = event.bucket() else {
            self.deliver(&event);
            return;
        };
        let key = (
            bucket.entity_id.clone(),
            bucket.resolution,
            bucket.bucket_start,
            event.kind(),
        );
        let mut pending = self.pending.lock();
        if pending.latest.insert(key.clone(), event).is_none() {
            pending.order.push(key);
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().order.len()
    }

    /// Deliver every pending event in arrival order of its first update.
    pub fn flush(&self) -> DeliveryStats {
        let events: Vec<StreamEvent> = {
            let mut pending = self.pending.lock();
            let Pending { order, latest } = &mut *pending;
            order.drain(..).filter_map(|k| latest.remove(&k)).collect()
        };
        let mut total = DeliveryStats::default();
        for event in &events {
            let stats = self.deliver(event);
            total.delivered += stats.delivered;
            total.dropped += stats.dropped;
            total.closed += stats.closed;
        }
        total
    }

    /// Send a heartbeat to every subscriber, then drop subscribers that
    /// have gone `max_idle_secs` without a successful delivery.
    pub fn heartbeat(&self) -> DeliveryStats {
        let now = self.clock.now();
        let event = StreamEvent::Heartbeat {
            connections: self.subscribers.len(),
            timestamp: now,
            degraded: self.guards.any_degraded(),
        };
        let stats = self.deliver(&event);

        let max_idle = self.config.max_idle_secs as i64;
        let idle: Vec<ConnectionId> = self
            .subscribers
            .iter()
            .filter(|s| now - s.last_delivery.load(Ordering::Relaxed) >= max_idle)
            .map(|s| *s.key())
            .collect();
        for id in idle {
            warn!(connection = id, max_idle_secs = max_idle, "dropping idle stream subscriber");
            self.unsubscribe(id);
        }
        stats
    }

    fn deliver(&self, event: &StreamEvent) -> DeliveryStats {
        let now = self.clock.now();
        let mut stats = DeliveryStats::default();
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if !sub.subscription.wants(event) {
                continue;
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {
                    sub.last_delivery.store(now, Ordering::Relaxed);
                    stats.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    debug!(
                        connection = *entry.key(),
                        kind = event.kind().as_str(),
                        "subscriber queue full, event dropped"
                    );
                    stats.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        stats.closed = closed.len();
        for id in closed {
            self.unsubscribe(id);
        }
        self.metrics.record_dispatched(stats.delivered);
        self.metrics.record_dropped(stats.dropped);
        stats
    }

    /// Drop every subscription; their streams end.
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.subscribers.len();
        self.subscribers.clear();
        self.metrics.set_subscribers(0);
        info!(count, "all stream subscribers closed");
    }

    /// Run the flush and heartbeat loops until shutdown signal.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let debounce = Duration::from_millis(self.config.debounce_ms.max(1));
        let mut flush = tokio::time::interval(debounce);
        let mut heartbeat =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_secs.max(1)));
        flush.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Both intervals fire immediately; skip the first heartbeat.
        heartbeat.tick().await;
        info!(
            debounce_ms = self.config.debounce_ms,
            heartbeat_secs = self.config.heartbeat_secs,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = flush.tick() => {
                    self.flush();
                }
                _ = heartbeat.tick() => {
                    let stats = self.heartbeat();
                    debug!(delivered = stats.delivered, "heartbeat sent");
                }
                _ = shutdown.changed() => {
                    info!("dispatcher shutting down");
                    self.flush();
                    self.close_all();
                    break;
                }
            }
        }
    }
}

/// Receiving side of one subscription.
pub struct SubscriptionStream {
    id: ConnectionId,
    rx: mpsc::Receiver<StreamEvent>,
    dispatcher: Arc<Dispatcher>,
}

impl SubscriptionStream {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for SubscriptionStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for SubscriptionStream {
    fn drop(&mut self) {
        self.dispatcher.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{score, T1035};
    use pulse_core::config::BreakerConfig;
    use pulse_core::ManualClock;
    use pulsegrid_guard::CircuitBreaker;
    use pulsegrid_state::StateStore;

    fn config(capacity: usize) -> DispatchConfig {
        DispatchConfig {
            debounce_ms: 100,
            heartbeat_secs: 15,
            max_idle_secs: 120,
            channel_capacity: capacity,
        }
    }

    fn setup(capacity: usize) -> (Arc<Dispatcher>, Arc<ManualClock>, Arc<EngineMetrics>) {
        setup_with_guards(capacity, Arc::new(GuardRegistry::new()))
    }

    fn setup_with_guards(
        capacity: usize,
        guards: Arc<GuardRegistry>,
    ) -> (Arc<Dispatcher>, Arc<ManualClock>, Arc<EngineMetrics>) {
        let clock = Arc::new(ManualClock::new(T1035));
        let metrics = Arc::new(EngineMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            config(capacity),
            clock.clone(),
            metrics.clone(),
            guards,
        ));
        (dispatcher, clock, metrics)
    }

    fn update(entity: &str, value: f64, res: Resolution) -> StreamEvent {
        StreamEvent::bucket_update(Bucket::from_score(&score(entity, value, T1035), res))
    }

    fn sub(entities: &[&str], resolutions: &[Resolution]) -> Subscription {
        Subscription::new(
            entities.iter().map(|e| e.to_string()),
            resolutions.iter().copied(),
        )
        .unwrap()
    }

    fn drain(stream: &mut SubscriptionStream) -> Vec<StreamEvent> {
        std::iter::from_fn(|| stream.try_recv()).collect()
    }

    #[test]
    fn filter_matrix() {
        let r1 = Resolution::OneMinute;
        let r5 = Resolution::FiveMinutes;
        let any_entity = sub(&[], &[r1]);
        let one_entity = sub(&["AAPL"], &[r1]);
        let two_res = sub(&["AAPL", "MSFT"], &[r1, r5]);

        assert!(any_entity.matches("AAPL", r1));
        assert!(any_entity.matches("TSLA", r1));
        assert!(!any_entity.matches("AAPL", r5));

        assert!(one_entity.matches("AAPL", r1));
        assert!(!one_entity.matches("MSFT", r1));
        assert!(!one_entity.matches("AAPL", r5));

        assert!(two_res.matches("MSFT", r5));
        assert!(!two_res.matches("TSLA", r5));
        assert!(!two_res.matches("AAPL", Resolution::OneHour));

        assert!(Subscription::new(Vec::<String>::new(), Vec::new()).is_err());
    }

    #[test]
    fn delivers_only_matching_events() {
        let (dispatcher, _, metrics) = setup(8);
        let mut aapl = dispatcher.subscribe(sub(&["AAPL"], &[Resolution::OneMinute]));
        let mut all = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute, Resolution::OneHour]));

        dispatcher.notify(update("AAPL", 0.1, Resolution::OneMinute));
        dispatcher.notify(update("MSFT", 0.1, Resolution::OneMinute));
        dispatcher.notify(update("AAPL", 0.1, Resolution::OneHour));
        dispatcher.notify(update("AAPL", 0.1, Resolution::TwentyFourHours));
        let stats = dispatcher.flush();

        assert_eq!(drain(&mut aapl).len(), 1);
        assert_eq!(drain(&mut all).len(), 3);
        assert_eq!(stats.delivered, 4);
        assert_eq!(metrics.snapshot().events_dispatched, 4);
    }

    #[test]
    fn coalesces_to_latest_per_key_and_kind() {
        let (dispatcher, _, _) = setup(8);
        let mut stream = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));

        dispatcher.notify(update("AAPL", 0.1, Resolution::OneMinute));
        dispatcher.notify(update("AAPL", 0.2, Resolution::OneMinute));
        dispatcher.notify(update("AAPL", 0.3, Resolution::OneMinute));
        let partial = PartialBucket::new(
            Bucket::from_score(&score("AAPL", 0.4, T1035), Resolution::OneMinute),
            T1035 + 30,
            5,
        );
        dispatcher.notify(StreamEvent::PartialBucket(partial));
        assert_eq!(dispatcher.pending_len(), 2);

        dispatcher.flush();
        let events = drain(&mut stream);
        assert_eq!(events.len(), 2);
        match &events[0] {
            StreamEvent::BucketUpdate(view) => assert_eq!(view.bucket.close, 0.3),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(events[1].kind(), EventKind::PartialBucket);
        assert_eq!(dispatcher.pending_len(), 0);
    }

    #[test]
    fn heartbeat_bypasses_filters() {
        let (dispatcher, _, _) = setup(8);
        let mut a = dispatcher.subscribe(sub(&["AAPL"], &[Resolution::OneMinute]));
        let mut b = dispatcher.subscribe(sub(&["MSFT"], &[Resolution::OneHour]));

        assert_eq!(dispatcher.heartbeat().delivered, 2);
        for stream in [&mut a, &mut b] {
            let events = drain(stream);
            assert_eq!(
                events,
                vec![StreamEvent::Heartbeat {
                    connections: 2,
                    timestamp: T1035,
                    degraded: false,
                }]
            );
        }
    }

    #[test]
    fn full_queue_drops_for_that_subscriber_only() {
        let (dispatcher, _, metrics) = setup(1);
        let mut slow = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));
        let mut fast = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));

        dispatcher.notify(update("AAPL", 0.1, Resolution::OneMinute));
        dispatcher.flush();
        assert_eq!(drain(&mut fast).len(), 1);

        dispatcher.notify(update("MSFT", 0.1, Resolution::OneMinute));
        let stats = dispatcher.flush();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(drain(&mut fast).len(), 1);
        assert_eq!(drain(&mut slow).len(), 1);
        assert_eq!(metrics.snapshot().events_dropped, 1);
        assert_eq!(dispatcher.connection_count(), 2);
    }

    #[test]
    fn dropped_stream_unsubscribes() {
        let (dispatcher, _, metrics) = setup(4);
        let stream = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));
        assert_eq!(metrics.snapshot().subscribers, 1);
        drop(stream);
        assert_eq!(dispatcher.connection_count(), 0);
        assert_eq!(metrics.snapshot().subscribers, 0);
    }

    #[test]
    fn idle_subscribers_are_dropped() {
        let (dispatcher, clock, _) = setup(1);
        let mut stuck = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));
        let mut healthy = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));

        // Fill the stuck subscriber's queue and never read it.
        dispatcher.heartbeat();
        drain(&mut healthy);
        for _ in 0..8 {
            clock.advance(15);
            dispatcher.heartbeat();
            drain(&mut healthy);
        }
        assert_eq!(dispatcher.connection_count(), 1);
        assert!(stuck.try_recv().is_some());
        assert!(stuck.try_recv().is_none());
    }

    #[tokio::test]
    async fn close_all_ends_streams() {
        use futures_util::StreamExt;

        let (dispatcher, _, _) = setup(4);
        let mut stream = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));
        dispatcher.notify(update("AAPL", 0.1, Resolution::OneMinute));
        dispatcher.flush();
        dispatcher.close_all();

        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());

        let mut late = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));
        assert!(dispatcher.is_closed());
        assert_eq!(dispatcher.connection_count(), 0);
        assert!(late.next().await.is_none());
    }

    #[test]
    fn wire_format_is_tagged() {
        let json = serde_json::to_value(update("AAPL", 0.5, Resolution::FiveMinutes)).unwrap();
        assert_eq!(json["type"], "bucket_update");
        assert_eq!(json["entity_id"], "AAPL");
        assert_eq!(json["resolution"], "5m");
        assert_eq!(json["avg"], 0.5);

        let hb = StreamEvent::Heartbeat {
            connections: 3,
            timestamp: T1035,
            degraded: true,
        };
        let json = serde_json::to_value(hb).unwrap();
        assert_eq!(json["type"], "heartbeat");
        assert_eq!(json["connections"], 3);
        assert_eq!(json["degraded"], true);
    }

    #[test]
    fn heartbeat_reports_open_breaker() {
        let guards = Arc::new(GuardRegistry::new());
        let (dispatcher, clock, _) = setup_with_guards(4, guards.clone());
        let mut config = BreakerConfig::new("sentiment-api");
        config.failure_threshold = 1;
        let store = StateStore::open_in_memory().unwrap();
        guards.insert_breaker(CircuitBreaker::load(config, Arc::new(store), clock.clone()));
        let mut stream = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));

        dispatcher.heartbeat();
        assert!(matches!(
            stream.try_recv(),
            Some(StreamEvent::Heartbeat { degraded: false, .. })
        ));

        guards.record_failure("sentiment-api").unwrap();
        dispatcher.heartbeat();
        assert!(matches!(
            stream.try_recv(),
            Some(StreamEvent::Heartbeat { degraded: true, .. })
        ));
    }

    #[test]
    fn distinct_windows_are_not_coalesced() {
        let (dispatcher, _, _) = setup(8);
        let mut stream = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));
        for offset in [0, 60, 120] {
            let bucket = Bucket::from_score(
                &score("AAPL", 0.1, T1035 + offset),
                Resolution::OneMinute,
            );
            dispatcher.notify(StreamEvent::bucket_update(bucket));
        }
        assert_eq!(dispatcher.pending_len(), 3);
        dispatcher.flush();
        assert_eq!(drain(&mut stream).len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribers_come_and_go_during_delivery() {
        let (dispatcher, _, metrics) = setup(8);
        let mut steady = dispatcher.subscribe(sub(&["AAPL"], &[Resolution::OneMinute]));

        let churn: Vec<_> = (0..4)
            .map(|_| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    for _ in 0..250 {
                        let mut stream = dispatcher.subscribe(sub(&[], &[Resolution::OneMinute]));
                        tokio::task::yield_now().await;
                        let _ = stream.try_recv();
                    }
                })
            })
            .collect();

        let mut received = 0;
        for i in 0..250 {
            dispatcher.notify(update("AAPL", f64::from(i % 10) / 10.0, Resolution::OneMinute));
            dispatcher.flush();
            received += drain(&mut steady).len();
            tokio::task::yield_now().await;
        }
        for task in churn {
            task.await.unwrap();
        }

        assert_eq!(received, 250);
        assert_eq!(dispatcher.connection_count(), 1);
        assert!(metrics.snapshot().events_dispatched >= 250);
    }
}
