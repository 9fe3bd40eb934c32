//! Fixed-period call budget for one dependency.

use std::sync::Arc;

use parking_lot::Mutex;
use pulse_core::config::QuotaConfig;
use pulse_core::SharedClock;
use pulsegrid_state::{GuardRepository, QuotaRecord};
use tracing::{debug, warn};

pub struct QuotaTracker {
    config: QuotaConfig,
    repo: Arc<dyn GuardRepository>,
    clock: SharedClock,
    record: Mutex<QuotaRecord>,
}

impl QuotaTracker {
    /// Restore usage for `config.dependency`, or start a fresh period.
    ///
    /// Limit and period always come from `config`; only `used` and
    /// `reset_at` are taken from the persisted record.
    pub fn load(config: QuotaConfig, repo: Arc<dyn GuardRepository>, clock: SharedClock) -> Self {
        let now = clock.now();
        let fresh = QuotaRecord::new(&config.dependency, config.limit, config.period_secs, now);
        let record = match repo.load_quota(&config.dependency) {
            Ok(Some(stored)) => QuotaRecord {
                used: stored.used,
                reset_at: stored.reset_at,
                ..fresh
            },
            Ok(None) => fresh,
            Err(e) => {
                warn!(
                    dependency = %config.dependency,
                    error = %e,
                    "quota state unreadable, starting a fresh period"
                );
                fresh
            }
        };
        Self {
            config,
            repo,
            clock,
            record: Mutex::new(record),
        }
    }

    pub fn dependency(&self) -> &str {
        &self.config.dependency
    }

    /// Whether another call fits the budget.
    ///
    /// Conservative callers are refused once usage reaches the critical
    /// fraction of the limit.
    pub fn can_call(&self, conservative: bool) -> bool {
        let mut record = self.record.lock();
        self.roll_period(&mut record);
        if record.used >= record.limit {
            return false;
        }
        let critical = self.config.critical_fraction * record.limit as f64;
        !(conservative && record.used as f64 >= critical)
    }

    /// Count `calls` against the budget and return what remains.
    pub fn record_call(&self, calls: u64) -> u64 {
        let mut record = self.record.lock();
        self.roll_period(&mut record);
        record.used = record.used.saturating_add(calls);
        self.persist(&record);
        record.remaining()
    }

    pub fn snapshot(&self) -> QuotaRecord {
        let mut record = self.record.lock();
        self.roll_period(&mut record);
        record.clone()
    }

    /// Reset usage once `reset_at` has passed, moving `reset_at` forward by
    /// whole periods so it lands in the future.
    fn roll_period(&self, record: &mut QuotaRecord) {
        let now = self.clock.now();
        if now < record.reset_at {
            return;
        }
        let periods = (now - record.reset_at) / record.period_secs + 1;
        record.reset_at += periods * record.period_secs;
        record.used = 0;
        debug!(
            dependency = %record.dependency_id,
            reset_at = record.reset_at,
            "quota period reset"
        );
        self.persist(record);
    }

    fn persist(&self, record: &QuotaRecord) {
        if let Err(e) = self.repo.save_quota(record) {
            warn!(dependency = %record.dependency_id, error = %e, "failed to persist quota usage");
        }
    }
}
