//! Registry of configured breakers and quotas, keyed by dependency id.

use std::sync::Arc;

use dashmap::DashMap;
use pulse_core::config::GuardsConfig;
use pulse_core::SharedClock;
use pulsegrid_state::{BreakerRecord, BreakerState, GuardRepository, QuotaRecord};
use serde::Serialize;
use tracing::info;

use crate::breaker::CircuitBreaker;
use crate::error::{GuardError, GuardResult};
use crate::quota::QuotaTracker;

/// Outcome of an admission check against a dependency's guards.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub dependency: String,
    pub allowed: bool,
    pub breaker_state: Option<BreakerState>,
    pub quota_remaining: Option<u64>,
}

/// Point-in-time view of every guard.
#[derive(Debug, Clone, Serialize)]
pub struct GuardSnapshot {
    pub breakers: Vec<BreakerRecord>,
    pub quotas: Vec<QuotaRecord>,
}

#[derive(Default)]
pub struct GuardRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    quotas: DashMap<String, Arc<QuotaTracker>>,
}

impl GuardRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build breakers and quotas from config, restoring persisted state.
    pub fn from_config(
        config: &GuardsConfig,
        repo: Arc<dyn GuardRepository>,
        clock: SharedClock,
    ) -> Self {
        let registry = Self::new();
        for breaker in &config.breakers {
            registry.insert_breaker(CircuitBreaker::load(
                breaker.clone(),
                repo.clone(),
                clock.clone(),
            ));
        }
        for quota in &config.quotas {
            registry.insert_quota(QuotaTracker::load(quota.clone(), repo.clone(), clock.clone()));
        }
        info!(
            breakers = registry.breakers.len(),
            quotas = registry.quotas.len(),
            "guards loaded"
        );
        registry
    }

    pub fn insert_breaker(&self, breaker: CircuitBreaker) {
        self.breakers
            .insert(breaker.dependency().to_string(), Arc::new(breaker));
    }

    pub fn insert_quota(&self, quota: QuotaTracker) {
        self.quotas
            .insert(quota.dependency().to_string(), Arc::new(quota));
    }

    pub fn breaker(&self, dependency: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(dependency).map(|b| b.value().clone())
    }

    pub fn quota(&self, dependency: &str) -> Option<Arc<QuotaTracker>> {
        self.quotas.get(dependency).map(|q| q.value().clone())
    }

    fn known(&self, dependency: &str) -> GuardResult<()> {
        if self.breakers.contains_key(dependency) || self.quotas.contains_key(dependency) {
            Ok(())
        } else {
            Err(GuardError::UnknownDependency(dependency.to_string()))
        }
    }

    /// Check quota, then breaker. The quota goes first so a refused call
    /// never consumes the breaker's half-open trial.
    pub fn admission(&self, dependency: &str, conservative: bool) -> GuardResult<Admission> {
        self.known(dependency)?;
        let quota = self.quota(dependency);
        let breaker = self.breaker(dependency);

        let quota_ok = quota.as_ref().is_none_or(|q| q.can_call(conservative));
        let allowed = quota_ok && breaker.as_ref().is_none_or(|b| b.can_call());

        Ok(Admission {
            dependency: dependency.to_string(),
            allowed,
            breaker_state: breaker.map(|b| b.state()),
            quota_remaining: quota.map(|q| q.snapshot().remaining()),
        })
    }

    pub fn record_success(&self, dependency: &str) -> GuardResult<BreakerState> {
        self.breaker(dependency)
            .map(|b| b.record_success())
            .ok_or_else(|| GuardError::UnknownDependency(dependency.to_string()))
    }

    pub fn record_failure(&self, dependency: &str) -> GuardResult<BreakerState> {
        self.breaker(dependency)
            .map(|b| b.record_failure())
            .ok_or_else(|| GuardError::UnknownDependency(dependency.to_string()))
    }

    /// Count calls against the dependency's quota; returns remaining budget.
    pub fn record_calls(&self, dependency: &str, calls: u64) -> GuardResult<u64> {
        self.quota(dependency)
            .map(|q| q.record_call(calls))
            .ok_or_else(|| GuardError::UnknownDependency(dependency.to_string()))
    }

    /// True when any breaker is not closed; readers then serve last-known data.
    pub fn any_degraded(&self) -> bool {
        self.breakers
            .iter()
            .any(|b| b.value().state() != BreakerState::Closed)
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        let mut breakers: Vec<BreakerRecord> =
            self.breakers.iter().map(|b| b.value().snapshot()).collect();
        breakers.sort_by(|a, b| a.dependency_id.cmp(&b.dependency_id));
        let mut quotas: Vec<QuotaRecord> =
            self.quotas.iter().map(|q| q.value().snapshot()).collect();
        quotas.sort_by(|a, b| a.dependency_id.cmp(&b.dependency_id));
        GuardSnapshot { breakers, quotas }
    }
}
