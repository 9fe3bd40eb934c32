//! In-progress bucket computation from the raw score log.

use std::sync::Arc;

use pulse_core::{aggregate, PartialBucket, Resolution, SharedClock};
use pulsegrid_state::RawScoreLog;

use crate::error::EngineResult;

pub struct PartialComputer {
    raw: Arc<dyn RawScoreLog>,
    clock: SharedClock,
    refresh_secs: i64,
}

impl PartialComputer {
    pub fn new(raw: Arc<dyn RawScoreLog>, clock: SharedClock, refresh_secs: u64) -> Self {
        Self {
            raw,
            clock,
            refresh_secs: refresh_secs as i64,
        }
    }

    /// The provisional bucket for the window containing now.
    pub fn compute(
        &self,
        entity_id: &str,
        resolution: Resolution,
    ) -> EngineResult<Option<PartialBucket>> {
        self.compute_at(entity_id, resolution, self.clock.now())
    }

    /// The provisional bucket for the window containing `now`, or `None`
    /// if no score has arrived in it yet.
    pub fn compute_at(
        &self,
        entity_id: &str,
        resolution: Resolution,
        now: i64,
    ) -> EngineResult<Option<PartialBucket>> {
        let start = resolution.floor(now);
        let end = start + resolution.duration_secs();
        let scores = self.raw.raw_scores_between(entity_id, start, end)?;
        if scores.is_empty() {
            return Ok(None);
        }
        let bucket = aggregate(&scores, resolution)?;
        Ok(Some(PartialBucket::new(bucket, now, self.refresh_secs)))
    }

    pub fn refresh_secs(&self) -> i64 {
        self.refresh_secs
    }
}
