//! Per-dependency circuit breaker with persisted state.
//!
//! Failures are counted inside a window that restarts once
//! `failure_window_secs` have passed since its first failure. Reaching the
//! threshold opens the breaker; after `recovery_timeout_secs` a single
//! trial call is admitted in half-open state and its outcome decides
//! between closing and reopening.
//!
//! Persistence is best-effort: an unreadable record starts closed and a
//! failed save is logged, never surfaced to the caller.

use std::sync::Arc;

use parking_lot::Mutex;
use pulse_core::config::BreakerConfig;
use pulse_core::SharedClock;
use pulsegrid_state::{BreakerRecord, BreakerState, GuardRepository};
use tracing::{info, warn};

struct BreakerInner {
    record: BreakerRecord,
    /// Set while the half-open trial call is outstanding.
    trial_started_at: Option<i64>,
}

pub struct CircuitBreaker {
    config: BreakerConfig,
    repo: Arc<dyn GuardRepository>,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Restore the breaker for `config.dependency`, or start closed.
    pub fn load(config: BreakerConfig, repo: Arc<dyn GuardRepository>, clock: SharedClock) -> Self {
        let now = clock.now();
        let record = match repo.load_breaker(&config.dependency) {
            Ok(Some(record)) => record,
            Ok(None) => BreakerRecord::closed(&config.dependency, now),
            Err(e) => {
                warn!(
                    dependency = %config.dependency,
                    error = %e,
                    "breaker state unreadable, starting closed"
                );
                BreakerRecord::closed(&config.dependency, now)
            }
        };
        Self {
            config,
            repo,
            clock,
            inner: Mutex::new(BreakerInner {
                record,
                trial_started_at: None,
            }),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.config.dependency
    }

    /// Whether a call to the dependency may proceed now.
    ///
    /// In half-open state only one caller gets `true` until the trial
    /// reports back, or until the trial itself has been outstanding for a
    /// full recovery timeout.
    pub fn can_call(&self) -> bool {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.record.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let opened_at = inner.record.opened_at.unwrap_or(now);
                if now - opened_at < self.config.recovery_timeout_secs {
                    return false;
                }
                inner.record.state = BreakerState::HalfOpen;
                inner.record.updated_at = now;
                inner.trial_started_at = Some(now);
                info!(dependency = %self.config.dependency, "circuit breaker half-open");
                self.persist(&inner.record);
                true
            }
            BreakerState::HalfOpen => match inner.trial_started_at {
                Some(started) if now - started < self.config.recovery_timeout_secs => false,
                _ => {
                    inner.trial_started_at = Some(now);
                    true
                }
            },
        }
    }

    pub fn record_success(&self) -> BreakerState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if inner.record.state == BreakerState::HalfOpen {
            inner.record = BreakerRecord::closed(&self.config.dependency, now);
            inner.trial_started_at = None;
            info!(dependency = %self.config.dependency, "circuit breaker closed after recovery");
            self.persist(&inner.record);
        }
        inner.record.state
    }

    pub fn record_failure(&self) -> BreakerState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        match inner.record.state {
            BreakerState::Closed => {
                let window_expired = inner
                    .record
                    .failure_window_start
                    .is_none_or(|start| now - start >= self.config.failure_window_secs);
                if window_expired {
                    inner.record.failure_window_start = Some(now);
                    inner.record.failure_count = 1;
                } else {
                    inner.record.failure_count += 1;
                }
                if inner.record.failure_count >= self.config.failure_threshold {
                    inner.record.state = BreakerState::Open;
                    inner.record.opened_at = Some(now);
                    warn!(
                        dependency = %self.config.dependency,
                        failures = inner.record.failure_count,
                        threshold = self.config.failure_threshold,
                        "circuit breaker opened"
                    );
                }
            }
            BreakerState::HalfOpen => {
                inner.record.state = BreakerState::Open;
                inner.record.opened_at = Some(now);
                inner.trial_started_at = None;
                warn!(
                    dependency = %self.config.dependency,
                    "circuit breaker re-opened after failed trial"
                );
            }
            BreakerState::Open => return BreakerState::Open,
        }
        inner.record.updated_at = now;
        self.persist(&inner.record);
        inner.record.state
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().record.state
    }

    pub fn snapshot(&self) -> BreakerRecord {
        self.inner.lock().record.clone()
    }

    fn persist(&self, record: &BreakerRecord) {
        if let Err(e) = self.repo.save_breaker(record) {
            warn!(
                dependency = %record.dependency_id,
                error = %e,
                "failed to persist breaker state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingRepo;
    use pulse_core::ManualClock;
    use pulsegrid_state::StateStore;

    const T0: i64 = 1_704_105_300;

    fn config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            dependency: "sentiment-api".to_string(),
            failure_threshold: threshold,
            failure_window_secs: 60,
            recovery_timeout_secs: 300,
        }
    }

    fn setup(threshold: u32) -> (CircuitBreaker, Arc<ManualClock>, StateStore) {
        let clock = Arc::new(ManualClock::new(T0));
        let store = StateStore::open_in_memory().unwrap();
        let breaker =
            CircuitBreaker::load(config(threshold), Arc::new(store.clone()), clock.clone());
        (breaker, clock, store)
    }

    #[test]
    fn opens_at_threshold() {
        let (breaker, clock, _) = setup(3);
        assert_eq!(breaker.record_failure(), BreakerState::Closed);
        clock.advance(10);
        assert_eq!(breaker.record_failure(), BreakerState::Closed);
        assert!(breaker.can_call());
        clock.advance(10);
        assert_eq!(breaker.record_failure(), BreakerState::Open);
        assert!(!breaker.can_call());
        assert_eq!(breaker.snapshot().opened_at, Some(T0 + 20));
    }

    #[test]
    fn failure_window_restarts() {
        let (breaker, clock, _) = setup(3);
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(60);
        assert_eq!(breaker.record_failure(), BreakerState::Closed);
        let snap = breaker.snapshot();
        assert_eq!(snap.failure_count, 1);
        assert_eq!(snap.failure_window_start, Some(T0 + 60));
    }

    #[test]
    fn half_open_admits_one_trial_then_closes() {
        let (breaker, clock, _) = setup(1);
        breaker.record_failure();
        clock.advance(299);
        assert!(!breaker.can_call());
        clock.advance(1);
        assert!(breaker.can_call());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(!breaker.can_call());

        assert_eq!(breaker.record_success(), BreakerState::Closed);
        let snap = breaker.snapshot();
        assert_eq!(snap.failure_count, 0);
        assert_eq!(snap.opened_at, None);
        assert!(breaker.can_call());
    }

    #[test]
    fn failed_trial_reopens_with_fresh_timestamp() {
        let (breaker, clock, _) = setup(1);
        breaker.record_failure();
        clock.advance(300);
        assert!(breaker.can_call());
        clock.advance(5);
        assert_eq!(breaker.record_failure(), BreakerState::Open);
        assert_eq!(breaker.snapshot().opened_at, Some(T0 + 305));
        clock.advance(299);
        assert!(!breaker.can_call());
    }

    #[test]
    fn stale_trial_is_replaced() {
        let (breaker, clock, _) = setup(1);
        breaker.record_failure();
        clock.advance(300);
        assert!(breaker.can_call());
        clock.advance(300);
        assert!(breaker.can_call());
    }

    #[test]
    fn state_survives_reload() {
        let (breaker, clock, store) = setup(1);
        breaker.record_failure();
        drop(breaker);

        let reloaded = CircuitBreaker::load(config(1), Arc::new(store), clock.clone());
        assert_eq!(reloaded.state(), BreakerState::Open);
        assert!(!reloaded.can_call());
    }

    #[test]
    fn unreadable_state_fails_open() {
        let clock = Arc::new(ManualClock::new(T0));
        let breaker = CircuitBreaker::load(config(1), Arc::new(FailingRepo), clock);
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(breaker.can_call());
        // Save failures are swallowed.
        assert_eq!(breaker.record_failure(), BreakerState::Open);
    }
}
