//! pulse.toml configuration parser.
//!
//! Every section and field has a default, so an empty file (or no file)
//! yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub fanout: FanoutConfig,
    pub dispatch: DispatchConfig,
    pub partial: PartialConfig,
    pub retention: RetentionConfig,
    pub metrics: MetricsConfig,
    pub guards: GuardsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8480,
            data_dir: PathBuf::from("/var/lib/pulsegrid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1024 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Attempts per key, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub debounce_ms: u64,
    pub heartbeat_secs: u64,
    /// Drop a subscriber after this long without a successful delivery.
    pub max_idle_secs: u64,
    /// Per-subscriber queue depth.
    pub channel_capacity: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 100,
            heartbeat_secs: 15,
            max_idle_secs: 120,
            channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialConfig {
    pub refresh_secs: u64,
}

impl Default for PartialConfig {
    fn default() -> Self {
        Self { refresh_secs: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub purge_interval_secs: u64,
    /// How long raw scores are kept for partial bucket computation.
    pub raw_retention_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: 300,
            raw_retention_secs: 26 * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub report_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            report_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardsConfig {
    pub breakers: Vec<BreakerConfig>,
    pub quotas: Vec<QuotaConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    pub dependency: String,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window")]
    pub failure_window_secs: i64,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_secs: i64,
}

impl BreakerConfig {
    pub fn new(dependency: &str) -> Self {
        Self {
            dependency: dependency.to_string(),
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window(),
            recovery_timeout_secs: default_recovery_timeout(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window() -> i64 {
    60
}

fn default_recovery_timeout() -> i64 {
    300
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub dependency: String,
    pub limit: u64,
    #[serde(default = "default_quota_period")]
    pub period_secs: i64,
    /// Fraction of `limit` above which conservative callers are refused.
    #[serde(default = "default_critical_fraction")]
    pub critical_fraction: f64,
}

fn default_quota_period() -> i64 {
    86_400
}

fn default_critical_fraction() -> f64 {
    0.8
}

impl PulseConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: PulseConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings that would make a component misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.cache.max_entries == 0 {
            anyhow::bail!("cache.max_entries must be at least 1");
        }
        if self.fanout.max_attempts == 0 {
            anyhow::bail!("fanout.max_attempts must be at least 1");
        }
        if self.dispatch.channel_capacity == 0 {
            anyhow::bail!("dispatch.channel_capacity must be at least 1");
        }
        if self.dispatch.debounce_ms == 0 || self.dispatch.heartbeat_secs == 0 {
            anyhow::bail!("dispatch intervals must be non-zero");
        }
        if self.retention.raw_retention_secs < 86_400 {
            anyhow::bail!("retention.raw_retention_secs must cover the 24h window");
        }
        for b in &self.guards.breakers {
            if b.failure_threshold == 0
                || b.failure_window_secs <= 0
                || b.recovery_timeout_secs <= 0
            {
                anyhow::bail!(
                    "breaker {:?}: thresholds and windows must be positive",
                    b.dependency
                );
            }
        }
        for q in &self.guards.quotas {
            if q.period_secs <= 0 {
                anyhow::bail!("quota {:?}: period_secs must be positive", q.dependency);
            }
            if !(q.critical_fraction > 0.0 && q.critical_fraction <= 1.0) {
                anyhow::bail!("quota {:?}: critical_fraction must be in (0, 1]", q.dependency);
            }
        }
        Ok(())
    }

    /// A starter pulse.toml with one guarded upstream.
    pub fn scaffold() -> Self {
        let mut config = PulseConfig::default();
        config.guards.breakers.push(BreakerConfig::new("sentiment-api"));
        config.guards.quotas.push(QuotaConfig {
            dependency: "sentiment-api".to_string(),
            limit: 25_000,
            period_secs: default_quota_period(),
            critical_fraction: default_critical_fraction(),
        });
        config
    }
}
