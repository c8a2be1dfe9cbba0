//! Configuration management
//!
//! All tuning knobs for the latency tracker and the orchestration bridge,
//! with environment overrides and fail-fast validation at construction.

use anyhow::Result;
use std::time::Duration;
use thiserror::Error;

/// Construction-time configuration errors.
///
/// Invalid parameters fail here, at construction, never at call time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("ema smoothing factor must be within (0, 1), got {0}")]
    InvalidAlpha(f64),

    #[error("prefetch confidence threshold must be within [0, 1], got {0}")]
    InvalidConfidence(f64),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Latency tracker tuning
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Per (provider, capability) outcome ring buffer capacity
    pub buffer_max: usize,

    /// EMA smoothing factor, applied to ttfr, throughput and total latency
    pub ema_alpha: f64,

    /// Consecutive failures before the circuit breaker opens
    pub failure_threshold: u32,

    /// How long an open breaker blocks before allowing a half-open probe
    pub cooldown: Duration,

    /// Number of most recent records examined for trend detection
    pub trend_window: usize,

    /// Relative change in mean ttfr that flags improving/degrading
    pub trend_threshold: f64,

    /// Sample count at which confidence saturates to 1.0
    pub high_confidence_samples: usize,

    /// Observed P95 ttfr is scaled by this to produce the adaptive timeout
    pub timeout_multiplier: f64,

    /// Timeout used when neither observations nor priors exist
    pub default_timeout: Duration,

    /// Upper bound on any adaptive timeout
    pub max_timeout: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            buffer_max: 200,
            ema_alpha: 0.2,
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            trend_window: 10,
            trend_threshold: 0.5,
            high_confidence_samples: 20,
            timeout_multiplier: 1.5,
            default_timeout: Duration::from_secs(10),
            max_timeout: Duration::from_secs(30),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ema_alpha <= 0.0 || self.ema_alpha >= 1.0 {
            return Err(ConfigError::InvalidAlpha(self.ema_alpha));
        }
        if self.buffer_max == 0 {
            return Err(ConfigError::Zero("buffer_max"));
        }
        if self.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        if self.trend_window < 2 {
            return Err(ConfigError::Zero("trend_window"));
        }
        if self.high_confidence_samples == 0 {
            return Err(ConfigError::Zero("high_confidence_samples"));
        }
        if self.timeout_multiplier <= 0.0 {
            return Err(ConfigError::Zero("timeout_multiplier"));
        }
        Ok(())
    }
}

/// Orchestration bridge tuning
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Maximum concurrent calls within one dependency level
    pub max_parallel: usize,

    /// Enable the long-lived result cache
    pub cache_enabled: bool,

    /// Result cache entry TTL
    pub cache_ttl: Duration,

    /// Result cache capacity
    pub cache_max_entries: u64,

    /// Enable speculative prefetch
    pub prefetch_enabled: bool,

    /// Minimum rule confidence for a prefetch to fire
    pub prefetch_confidence_threshold: f64,

    /// Maximum speculative calls fired per prefetch query
    pub max_prefetch: usize,

    /// Prefetch store entry TTL
    pub prefetch_ttl: Duration,

    /// Prefetch store capacity
    pub prefetch_max_entries: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_parallel: 5,
            cache_enabled: true,
            cache_ttl: Duration::from_secs(300),
            cache_max_entries: 1000,
            prefetch_enabled: true,
            prefetch_confidence_threshold: 0.6,
            max_prefetch: 3,
            prefetch_ttl: Duration::from_secs(120),
            prefetch_max_entries: 64,
        }
    }
}

impl BridgeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel == 0 {
            return Err(ConfigError::Zero("max_parallel"));
        }
        if !(0.0..=1.0).contains(&self.prefetch_confidence_threshold) {
            return Err(ConfigError::InvalidConfidence(
                self.prefetch_confidence_threshold,
            ));
        }
        if self.cache_max_entries == 0 {
            return Err(ConfigError::Zero("cache_max_entries"));
        }
        if self.max_prefetch == 0 {
            return Err(ConfigError::Zero("max_prefetch"));
        }
        Ok(())
    }
}

/// Combined configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub tracker: TrackerConfig,
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let tracker = TrackerConfig {
            buffer_max: env_parse("TOOLBRIDGE_BUFFER_MAX", 200),
            ema_alpha: env_parse("TOOLBRIDGE_EMA_ALPHA", 0.2),
            failure_threshold: env_parse("TOOLBRIDGE_FAILURE_THRESHOLD", 5),
            cooldown: Duration::from_millis(env_parse("TOOLBRIDGE_COOLDOWN_MS", 30_000)),
            trend_window: env_parse("TOOLBRIDGE_TREND_WINDOW", 10),
            trend_threshold: env_parse("TOOLBRIDGE_TREND_THRESHOLD", 0.5),
            high_confidence_samples: env_parse("TOOLBRIDGE_HIGH_CONFIDENCE_SAMPLES", 20),
            timeout_multiplier: env_parse("TOOLBRIDGE_TIMEOUT_MULTIPLIER", 1.5),
            default_timeout: Duration::from_millis(env_parse(
                "TOOLBRIDGE_DEFAULT_TIMEOUT_MS",
                10_000,
            )),
            max_timeout: Duration::from_millis(env_parse("TOOLBRIDGE_MAX_TIMEOUT_MS", 30_000)),
        };

        let bridge = BridgeConfig {
            max_parallel: env_parse("TOOLBRIDGE_MAX_PARALLEL", 5),
            cache_enabled: env_bool("TOOLBRIDGE_CACHE_ENABLED", true),
            cache_ttl: Duration::from_secs(env_parse("TOOLBRIDGE_CACHE_TTL_SECS", 300)),
            cache_max_entries: env_parse("TOOLBRIDGE_CACHE_MAX_ENTRIES", 1000),
            prefetch_enabled: env_bool("TOOLBRIDGE_PREFETCH_ENABLED", true),
            prefetch_confidence_threshold: env_parse("TOOLBRIDGE_PREFETCH_CONFIDENCE", 0.6),
            max_prefetch: env_parse("TOOLBRIDGE_MAX_PREFETCH", 3),
            prefetch_ttl: Duration::from_secs(env_parse("TOOLBRIDGE_PREFETCH_TTL_SECS", 120)),
            prefetch_max_entries: env_parse("TOOLBRIDGE_PREFETCH_MAX_ENTRIES", 64),
        };

        tracker.validate()?;
        bridge.validate()?;

        Ok(Self { tracker, bridge })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}
