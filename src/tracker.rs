//! Latency Tracker
//!
//! Rolling performance statistics per (provider, capability) pair, with a
//! circuit breaker per pair. Feeds adaptive timeouts and candidate ranking
//! for the orchestration bridge.
//!
//! Statistics are a pure function of the retained ring buffer plus breaker
//! state: EMAs fold over the buffer only, so evicted records stop
//! influencing them, and percentiles sort the retained slice directly.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;

/// Ranking score weights
const LATENCY_WEIGHT: f64 = 0.4;
const RISK_WEIGHT: f64 = 0.3;
const COST_WEIGHT: f64 = 0.2;
const UNCERTAINTY_WEIGHT: f64 = 0.1;

/// Score boost applied to a required provider (lower score ranks first)
const REQUIRED_BOOST: f64 = 0.5;

const DEFAULT_TOP_N: usize = 3;

/// Below this many samples the adaptive timeout falls back to priors
const MIN_SAMPLES_FOR_ADAPTIVE: usize = 3;

/// One observation of a completed (or failed) remote call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub provider: String,
    pub capability: String,
    /// Time to first response in milliseconds
    pub ttfr_ms: f64,
    /// Sustained throughput in units/sec, when the call produced a stream
    pub throughput: Option<f64>,
    pub total_latency_ms: f64,
    pub success: bool,
    /// Units produced by the call (tokens, rows, bytes - caller's choice)
    pub units: u64,
    pub error_code: Option<String>,
    /// Unix timestamp in milliseconds
    pub timestamp: i64,
}

impl ToolOutcome {
    /// Create a successful outcome
    pub fn success(provider: &str, capability: &str, ttfr_ms: f64, total_latency_ms: f64) -> Self {
        Self {
            provider: provider.to_string(),
            capability: capability.to_string(),
            ttfr_ms,
            throughput: None,
            total_latency_ms,
            success: true,
            units: 1,
            error_code: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Create a failed outcome
    pub fn failure(provider: &str, capability: &str, total_latency_ms: f64, error_code: &str) -> Self {
        Self {
            provider: provider.to_string(),
            capability: capability.to_string(),
            ttfr_ms: total_latency_ms,
            throughput: None,
            total_latency_ms,
            success: false,
            units: 0,
            error_code: Some(error_code.to_string()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Set sustained throughput
    pub fn with_throughput(mut self, units_per_sec: f64) -> Self {
        self.throughput = Some(units_per_sec);
        self
    }

    /// Set produced unit count
    pub fn with_units(mut self, units: u64) -> Self {
        self.units = units;
        self
    }
}

/// Latency trend over the most recent window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Improving => "improving",
            Self::Stable => "stable",
            Self::Degrading => "degrading",
        }
    }
}

/// Derived statistics snapshot for one (provider, capability) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub ema_ttfr_ms: f64,
    pub ema_throughput: Option<f64>,
    pub ema_total_latency_ms: f64,
    pub p50_ttfr_ms: f64,
    pub p90_ttfr_ms: f64,
    pub p99_ttfr_ms: f64,
    pub success_rate: f64,
    pub available: bool,
    pub last_success: Option<i64>,
    pub last_failure: Option<i64>,
    pub consecutive_failures: u32,
    pub sample_count: usize,
    pub confidence: f64,
    pub trend: Trend,
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
}

/// Per-key circuit breaker.
///
/// An open breaker whose cooldown has elapsed admits one probe (half-open);
/// the next recorded outcome decides whether it closes or reopens.
#[derive(Debug, Clone)]
struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }

    fn record_success(&mut self, provider: &str, capability: &str) {
        if self.state == BreakerState::Open {
            info!("circuit closed for {}::{}", provider, capability);
        }
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self, threshold: u32, provider: &str, capability: &str) {
        self.consecutive_failures += 1;
        match self.state {
            BreakerState::Open => {
                // Probe failed (or failure while blocked): restart the cooldown
                self.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                if self.consecutive_failures >= threshold {
                    warn!(
                        "circuit opened for {}::{} after {} consecutive failures",
                        provider, capability, self.consecutive_failures
                    );
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
        }
    }

    fn is_available(&self, cooldown: Duration) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => self
                .opened_at
                .map(|t| t.elapsed() >= cooldown)
                .unwrap_or(true),
        }
    }
}

/// Static prior for one (provider, capability) pair.
///
/// Seeding priors gives a cold tracker sane timeouts and rankings before
/// any real traffic arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderPrior {
    pub provider: String,
    pub capability: String,
    pub expected_ttfr_ms: f64,
    pub expected_p95_ms: f64,
    pub cost_per_unit: f64,
    /// Synthetic outcome records to insert
    pub samples: usize,
}

impl ProviderPrior {
    pub fn new(provider: &str, capability: &str, expected_ttfr_ms: f64) -> Self {
        Self {
            provider: provider.to_string(),
            capability: capability.to_string(),
            expected_ttfr_ms,
            expected_p95_ms: expected_ttfr_ms * 2.0,
            cost_per_unit: 0.0,
            samples: MIN_SAMPLES_FOR_ADAPTIVE,
        }
    }

    pub fn with_p95(mut self, expected_p95_ms: f64) -> Self {
        self.expected_p95_ms = expected_p95_ms;
        self
    }

    pub fn with_cost(mut self, cost_per_unit: f64) -> Self {
        self.cost_per_unit = cost_per_unit;
        self
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }
}

/// Candidate selection options for ranking
#[derive(Debug, Clone, Default)]
pub struct RankOptions {
    /// Providers to skip entirely
    pub exclude_providers: Vec<String>,
    /// Provider whose keys get a score boost
    pub required_provider: Option<String>,
    /// Keys above this per-unit cost are filtered out
    pub max_cost_per_unit: Option<f64>,
    /// Number of candidates returned (0 = default of 3)
    pub top_n: usize,
}

/// A ranked routing candidate (lower score ranks first)
#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
    pub provider: String,
    pub capability: String,
    pub score: f64,
    pub ema_ttfr_ms: f64,
    pub success_rate: f64,
    pub confidence: f64,
    pub cost_per_unit: f64,
}

/// Per-key tracked state
struct KeyState {
    buffer: VecDeque<ToolOutcome>,
    breaker: CircuitBreaker,
    stats: Option<ProviderStats>,
    cost_per_unit: f64,
    expected_p95_ms: Option<f64>,
}

impl KeyState {
    fn new(buffer_max: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(buffer_max),
            breaker: CircuitBreaker::new(),
            stats: None,
            cost_per_unit: 0.0,
            expected_p95_ms: None,
        }
    }
}

/// Rolling latency/outcome tracker with per-key circuit breaking.
///
/// Construct one per process and inject it wherever routing decisions are
/// made; `reset` exists for tests.
pub struct LatencyTracker {
    config: TrackerConfig,
    keys: RwLock<HashMap<(String, String), KeyState>>,
}

impl LatencyTracker {
    /// Create a tracker, failing fast on invalid configuration
    pub fn new(config: TrackerConfig) -> Result<Self, crate::config::ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            keys: RwLock::new(HashMap::new()),
        })
    }

    /// Record one call outcome: append to the ring buffer, update the
    /// breaker, recompute the stats snapshot. Pure bookkeeping, never fails.
    pub fn record(&self, outcome: ToolOutcome) {
        let mut keys = self.keys.write();
        let state = keys
            .entry((outcome.provider.clone(), outcome.capability.clone()))
            .or_insert_with(|| KeyState::new(self.config.buffer_max));

        if outcome.success {
            state
                .breaker
                .record_success(&outcome.provider, &outcome.capability);
        } else {
            state.breaker.record_failure(
                self.config.failure_threshold,
                &outcome.provider,
                &outcome.capability,
            );
        }

        state.buffer.push_back(outcome);
        while state.buffer.len() > self.config.buffer_max {
            state.buffer.pop_front();
        }

        state.stats = compute_stats(&state.buffer, &state.breaker, &self.config);
    }

    /// Latest statistics snapshot for a key, with live availability
    pub fn get_stats(&self, provider: &str, capability: &str) -> Option<ProviderStats> {
        let keys = self.keys.read();
        let state = keys.get(&(provider.to_string(), capability.to_string()))?;
        let mut stats = state.stats.clone()?;
        stats.available = state.breaker.is_available(self.config.cooldown);
        Some(stats)
    }

    /// Whether requests to this key are admitted.
    ///
    /// True for unknown keys, closed breakers, and open breakers whose
    /// cooldown has elapsed (one half-open probe allowed through).
    pub fn is_available(&self, provider: &str, capability: &str) -> bool {
        let keys = self.keys.read();
        keys.get(&(provider.to_string(), capability.to_string()))
            .map(|s| s.breaker.is_available(self.config.cooldown))
            .unwrap_or(true)
    }

    /// Per-call timeout derived from the key's own latency distribution.
    ///
    /// Fewer than 3 samples falls back to the seeded prior P95 (or the
    /// global default); otherwise observed P95 x multiplier, capped.
    pub fn adaptive_timeout(&self, provider: &str, capability: &str) -> Duration {
        let keys = self.keys.read();
        let state = keys.get(&(provider.to_string(), capability.to_string()));

        let default_ms = self.config.default_timeout.as_millis() as f64;
        let fallback_ms = state
            .and_then(|s| s.expected_p95_ms)
            .map(|p95| p95 * self.config.timeout_multiplier)
            .unwrap_or(default_ms);

        let ms = match state {
            Some(s) if s.buffer.len() >= MIN_SAMPLES_FOR_ADAPTIVE => {
                let mut ttfr: Vec<f64> = s.buffer.iter().map(|o| o.ttfr_ms).collect();
                ttfr.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                percentile(&ttfr, 95) * self.config.timeout_multiplier
            }
            _ => fallback_ms,
        };

        let capped = ms.min(self.config.max_timeout.as_millis() as f64).max(1.0);
        Duration::from_millis(capped as u64)
    }

    /// Rank tracked keys for routing/racing.
    ///
    /// Unavailable, excluded, and over-cost keys are filtered; the rest are
    /// scored by a weighted sum of normalized EMA latency, failure risk,
    /// normalized cost, and uncertainty. Lower score ranks first.
    pub fn rank_candidates(&self, options: &RankOptions) -> Vec<Candidate> {
        let keys = self.keys.read();

        let mut eligible: Vec<(&String, &String, &ProviderStats, f64)> = Vec::new();
        for ((provider, capability), state) in keys.iter() {
            let stats = match &state.stats {
                Some(s) => s,
                None => continue,
            };
            if !state.breaker.is_available(self.config.cooldown) {
                continue;
            }
            if options.exclude_providers.iter().any(|p| p == provider) {
                continue;
            }
            if let Some(max_cost) = options.max_cost_per_unit {
                if state.cost_per_unit > max_cost {
                    continue;
                }
            }
            eligible.push((provider, capability, stats, state.cost_per_unit));
        }

        let max_latency = eligible
            .iter()
            .map(|(_, _, s, _)| s.ema_ttfr_ms)
            .fold(f64::EPSILON, f64::max);
        let max_cost = eligible.iter().map(|(_, _, _, c)| *c).fold(0.0, f64::max);

        let mut candidates: Vec<Candidate> = eligible
            .into_iter()
            .map(|(provider, capability, stats, cost)| {
                let latency_norm = stats.ema_ttfr_ms / max_latency;
                let cost_norm = if max_cost > 0.0 { cost / max_cost } else { 0.0 };
                let mut score = LATENCY_WEIGHT * latency_norm
                    + RISK_WEIGHT * (1.0 - stats.success_rate)
                    + COST_WEIGHT * cost_norm
                    + UNCERTAINTY_WEIGHT * (1.0 - stats.confidence);
                if options.required_provider.as_deref() == Some(provider.as_str()) {
                    score *= REQUIRED_BOOST;
                }
                Candidate {
                    provider: provider.clone(),
                    capability: capability.clone(),
                    score,
                    ema_ttfr_ms: stats.ema_ttfr_ms,
                    success_rate: stats.success_rate,
                    confidence: stats.confidence,
                    cost_per_unit: cost,
                }
            })
            .collect();

        candidates.sort_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal));

        let top_n = if options.top_n == 0 {
            DEFAULT_TOP_N
        } else {
            options.top_n
        };
        candidates.truncate(top_n);
        candidates
    }

    /// Bulk-insert synthetic outcomes from a static prior table.
    ///
    /// A cold tracker has zero confidence everywhere and would make
    /// arbitrary routing choices; priors give it a starting distribution.
    pub fn seed_priors(&self, priors: &[ProviderPrior]) {
        for prior in priors {
            let samples = prior.samples.max(1);
            for i in 0..samples {
                // Last synthetic record carries the expected tail latency so
                // the buffer has spread for percentile queries
                let ttfr = if i == samples - 1 {
                    prior.expected_p95_ms
                } else {
                    prior.expected_ttfr_ms
                };
                self.record(ToolOutcome::success(
                    &prior.provider,
                    &prior.capability,
                    ttfr,
                    ttfr,
                ));
            }

            let mut keys = self.keys.write();
            if let Some(state) = keys.get_mut(&(prior.provider.clone(), prior.capability.clone())) {
                state.cost_per_unit = prior.cost_per_unit;
                state.expected_p95_ms = Some(prior.expected_p95_ms);
            }
        }
        debug!("seeded {} provider priors", priors.len());
    }

    /// EMA total latency for one key (bridge uses this to order a level)
    pub fn average_latency(&self, provider: &str, capability: &str) -> Option<f64> {
        let keys = self.keys.read();
        keys.get(&(provider.to_string(), capability.to_string()))
            .and_then(|s| s.stats.as_ref())
            .map(|s| s.ema_total_latency_ms)
    }

    /// EMA total latency for every tracked key, keyed "provider::capability"
    pub fn average_latencies(&self) -> HashMap<String, f64> {
        let keys = self.keys.read();
        keys.iter()
            .filter_map(|((provider, capability), state)| {
                state
                    .stats
                    .as_ref()
                    .map(|s| (format!("{}::{}", provider, capability), s.ema_total_latency_ms))
            })
            .collect()
    }

    /// Seeded per-unit cost for a key (0 when never seeded)
    pub fn cost_per_unit(&self, provider: &str, capability: &str) -> f64 {
        let keys = self.keys.read();
        keys.get(&(provider.to_string(), capability.to_string()))
            .map(|s| s.cost_per_unit)
            .unwrap_or(0.0)
    }

    /// Clear all per-key state (test support)
    pub fn reset(&self) {
        self.keys.write().clear();
        info!("latency tracker reset");
    }
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self {
            config: TrackerConfig::default(),
            keys: RwLock::new(HashMap::new()),
        }
    }
}

/// Recompute the derived snapshot from the retained buffer
fn compute_stats(
    buffer: &VecDeque<ToolOutcome>,
    breaker: &CircuitBreaker,
    config: &TrackerConfig,
) -> Option<ProviderStats> {
    if buffer.is_empty() {
        return None;
    }

    let alpha = config.ema_alpha;
    let mut ema_ttfr: Option<f64> = None;
    let mut ema_total: Option<f64> = None;
    let mut ema_throughput: Option<f64> = None;
    let mut successes = 0usize;
    let mut last_success = None;
    let mut last_failure = None;

    for outcome in buffer {
        ema_ttfr = Some(fold_ema(ema_ttfr, outcome.ttfr_ms, alpha));
        ema_total = Some(fold_ema(ema_total, outcome.total_latency_ms, alpha));
        if let Some(tp) = outcome.throughput {
            ema_throughput = Some(fold_ema(ema_throughput, tp, alpha));
        }
        if outcome.success {
            successes += 1;
            last_success = Some(outcome.timestamp);
        } else {
            last_failure = Some(outcome.timestamp);
        }
    }

    let mut ttfr: Vec<f64> = buffer.iter().map(|o| o.ttfr_ms).collect();
    ttfr.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let sample_count = buffer.len();
    let confidence = (sample_count as f64 / config.high_confidence_samples as f64).min(1.0);

    Some(ProviderStats {
        ema_ttfr_ms: ema_ttfr.unwrap_or(0.0),
        ema_throughput,
        ema_total_latency_ms: ema_total.unwrap_or(0.0),
        p50_ttfr_ms: percentile(&ttfr, 50),
        p90_ttfr_ms: percentile(&ttfr, 90),
        p99_ttfr_ms: percentile(&ttfr, 99),
        success_rate: successes as f64 / sample_count as f64,
        available: breaker.is_available(config.cooldown),
        last_success,
        last_failure,
        consecutive_failures: breaker.consecutive_failures,
        sample_count,
        confidence,
        trend: detect_trend(buffer, config),
    })
}

fn fold_ema(previous: Option<f64>, value: f64, alpha: f64) -> f64 {
    match previous {
        Some(prev) => alpha * value + (1.0 - alpha) * prev,
        None => value,
    }
}

/// Value at the given percentile of a sorted slice
fn percentile(sorted: &[f64], pct: usize) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = sorted.len() * pct / 100;
    sorted
        .get(idx)
        .copied()
        .unwrap_or_else(|| *sorted.last().unwrap_or(&0.0))
}

/// Compare first-half vs second-half mean ttfr over the most recent window.
/// Flags only beyond the relative threshold to avoid noise-driven flapping.
fn detect_trend(buffer: &VecDeque<ToolOutcome>, config: &TrackerConfig) -> Trend {
    let window = config.trend_window.min(buffer.len());
    if window < 4 {
        return Trend::Stable;
    }

    let recent: Vec<f64> = buffer
        .iter()
        .skip(buffer.len() - window)
        .map(|o| o.ttfr_ms)
        .collect();
    let mid = window / 2;
    let first = mean(&recent[..mid]);
    let second = mean(&recent[mid..]);
    if first <= f64::EPSILON {
        return Trend::Stable;
    }

    let change = (second - first) / first;
    if change > config.trend_threshold {
        Trend::Degrading
    } else if change < -config.trend_threshold {
        Trend::Improving
    } else {
        Trend::Stable
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_breaker_config() -> TrackerConfig {
        TrackerConfig {
            failure_threshold: 3,
            cooldown: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_record_and_stats() {
        let tracker = LatencyTracker::default();

        tracker.record(ToolOutcome::success("search", "query", 100.0, 150.0));
        tracker.record(ToolOutcome::success("search", "query", 200.0, 250.0));
        tracker.record(ToolOutcome::failure("search", "query", 500.0, "remote_error"));

        let stats = tracker.get_stats("search", "query").unwrap();
        assert_eq!(stats.sample_count, 3);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!(stats.last_success.is_some());
        assert!(stats.last_failure.is_some());
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[test]
    fn test_unknown_key_has_no_stats() {
        let tracker = LatencyTracker::default();
        assert!(tracker.get_stats("nope", "nothing").is_none());
        assert!(tracker.is_available("nope", "nothing"));
    }

    #[test]
    fn test_buffer_eviction_is_fifo() {
        let config = TrackerConfig {
            buffer_max: 5,
            ..Default::default()
        };
        let tracker = LatencyTracker::new(config).unwrap();

        // 5 fast then 2 slow: the two oldest fast records must be evicted
        for _ in 0..5 {
            tracker.record(ToolOutcome::success("db", "get", 10.0, 10.0));
        }
        for _ in 0..2 {
            tracker.record(ToolOutcome::success("db", "get", 900.0, 900.0));
        }

        let stats = tracker.get_stats("db", "get").unwrap();
        assert_eq!(stats.sample_count, 5);
        // Retained window is [10, 10, 10, 900, 900]; p99 lands on the tail
        assert_eq!(stats.p99_ttfr_ms, 900.0);
        assert_eq!(stats.p50_ttfr_ms, 10.0);
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let tracker = LatencyTracker::new(fast_breaker_config()).unwrap();

        for _ in 0..5 {
            tracker.record(ToolOutcome::success("api", "call", 50.0, 50.0));
        }
        assert!(tracker.is_available("api", "call"));

        for _ in 0..3 {
            tracker.record(ToolOutcome::failure("api", "call", 50.0, "remote_error"));
        }
        assert!(!tracker.is_available("api", "call"));
        assert!(!tracker.get_stats("api", "call").unwrap().available);
    }

    #[test]
    fn test_breaker_half_open_after_cooldown() {
        let tracker = LatencyTracker::new(fast_breaker_config()).unwrap();

        for _ in 0..3 {
            tracker.record(ToolOutcome::failure("api", "call", 50.0, "remote_error"));
        }
        assert!(!tracker.is_available("api", "call"));

        // Cooldown elapses with no further activity: probe allowed
        std::thread::sleep(Duration::from_millis(60));
        assert!(tracker.is_available("api", "call"));

        // Failed probe restarts the cooldown
        tracker.record(ToolOutcome::failure("api", "call", 50.0, "remote_error"));
        assert!(!tracker.is_available("api", "call"));

        // Successful probe closes the breaker
        std::thread::sleep(Duration::from_millis(60));
        tracker.record(ToolOutcome::success("api", "call", 50.0, 50.0));
        assert!(tracker.is_available("api", "call"));
        assert_eq!(tracker.get_stats("api", "call").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn test_failure_counter_resets_on_success() {
        let tracker = LatencyTracker::new(fast_breaker_config()).unwrap();

        tracker.record(ToolOutcome::failure("api", "call", 50.0, "remote_error"));
        tracker.record(ToolOutcome::failure("api", "call", 50.0, "remote_error"));
        tracker.record(ToolOutcome::success("api", "call", 50.0, 50.0));
        tracker.record(ToolOutcome::failure("api", "call", 50.0, "remote_error"));
        tracker.record(ToolOutcome::failure("api", "call", 50.0, "remote_error"));

        // Never hit 3 in a row
        assert!(tracker.is_available("api", "call"));
    }

    #[test]
    fn test_confidence_monotonic() {
        let tracker = LatencyTracker::default();

        let mut previous = 0.0;
        for _ in 0..30 {
            tracker.record(ToolOutcome::success("api", "call", 50.0, 50.0));
            let confidence = tracker.get_stats("api", "call").unwrap().confidence;
            assert!(confidence >= previous);
            previous = confidence;
        }
        assert!((previous - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_evicted_records_leave_ema() {
        let config = TrackerConfig {
            buffer_max: 3,
            ..Default::default()
        };
        let tracker = LatencyTracker::new(config).unwrap();

        tracker.record(ToolOutcome::success("api", "call", 10_000.0, 10_000.0));
        for _ in 0..3 {
            tracker.record(ToolOutcome::success("api", "call", 10.0, 10.0));
        }

        // The 10s outlier was evicted; EMA folds over [10, 10, 10] only
        let stats = tracker.get_stats("api", "call").unwrap();
        assert_eq!(stats.ema_ttfr_ms, 10.0);
    }

    #[test]
    fn test_trend_detection() {
        let tracker = LatencyTracker::default();

        // First half ~100ms, second half ~300ms: degrading
        for _ in 0..5 {
            tracker.record(ToolOutcome::success("api", "call", 100.0, 100.0));
        }
        for _ in 0..5 {
            tracker.record(ToolOutcome::success("api", "call", 300.0, 300.0));
        }
        assert_eq!(tracker.get_stats("api", "call").unwrap().trend, Trend::Degrading);

        tracker.reset();

        // Flat latency stays stable
        for _ in 0..10 {
            tracker.record(ToolOutcome::success("api", "call", 100.0, 100.0));
        }
        assert_eq!(tracker.get_stats("api", "call").unwrap().trend, Trend::Stable);

        tracker.reset();

        // Recovering latency reads as improving
        for _ in 0..5 {
            tracker.record(ToolOutcome::success("api", "call", 400.0, 400.0));
        }
        for _ in 0..5 {
            tracker.record(ToolOutcome::success("api", "call", 100.0, 100.0));
        }
        assert_eq!(tracker.get_stats("api", "call").unwrap().trend, Trend::Improving);
    }

    #[test]
    fn test_adaptive_timeout_uses_observed_p95() {
        let config = TrackerConfig {
            timeout_multiplier: 1.5,
            max_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let tracker = LatencyTracker::new(config).unwrap();

        for ms in [100.0, 200.0, 300.0, 400.0, 1000.0] {
            tracker.record(ToolOutcome::success("api", "call", ms, ms));
        }

        // P95 of 5 samples indexes the last element (1000ms) x 1.5
        let timeout = tracker.adaptive_timeout("api", "call");
        assert_eq!(timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_adaptive_timeout_falls_back_to_default() {
        let config = TrackerConfig {
            default_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let tracker = LatencyTracker::new(config).unwrap();

        assert_eq!(
            tracker.adaptive_timeout("unseen", "call"),
            Duration::from_secs(10)
        );

        // Fewer than 3 samples still falls back
        tracker.record(ToolOutcome::success("api", "call", 5.0, 5.0));
        assert_eq!(
            tracker.adaptive_timeout("api", "call"),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn test_adaptive_timeout_capped() {
        let config = TrackerConfig {
            max_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let tracker = LatencyTracker::new(config).unwrap();

        for _ in 0..5 {
            tracker.record(ToolOutcome::success("slow", "call", 60_000.0, 60_000.0));
        }
        assert_eq!(
            tracker.adaptive_timeout("slow", "call"),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_seed_priors_shapes_timeouts() {
        let tracker = LatencyTracker::default();

        tracker.seed_priors(&[
            ProviderPrior::new("search", "query", 200.0).with_p95(400.0),
        ]);

        // 3 synthetic samples: [200, 200, 400]; p95 indexes 400ms x 1.5
        let timeout = tracker.adaptive_timeout("search", "query");
        assert_eq!(timeout, Duration::from_millis(600));

        let stats = tracker.get_stats("search", "query").unwrap();
        assert_eq!(stats.sample_count, 3);
        assert!((stats.success_rate - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_rank_filters_and_orders() {
        let tracker = LatencyTracker::new(fast_breaker_config()).unwrap();

        // fast-and-reliable beats slow-and-flaky
        for _ in 0..10 {
            tracker.record(ToolOutcome::success("fast", "query", 50.0, 50.0));
        }
        for i in 0..10 {
            if i % 2 == 0 {
                tracker.record(ToolOutcome::success("flaky", "query", 800.0, 800.0));
            } else {
                tracker.record(ToolOutcome::failure("flaky", "query", 800.0, "remote_error"));
            }
        }
        // broken has an open breaker and must not appear at all
        for _ in 0..3 {
            tracker.record(ToolOutcome::failure("broken", "query", 100.0, "remote_error"));
        }

        let ranked = tracker.rank_candidates(&RankOptions::default());
        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].provider, "fast");
        assert_eq!(ranked[1].provider, "flaky");
        assert!(ranked[0].score < ranked[1].score);
    }

    #[test]
    fn test_rank_excludes_and_boosts() {
        let tracker = LatencyTracker::default();

        for _ in 0..10 {
            tracker.record(ToolOutcome::success("a", "query", 50.0, 50.0));
            tracker.record(ToolOutcome::success("b", "query", 60.0, 60.0));
        }

        let ranked = tracker.rank_candidates(&RankOptions {
            exclude_providers: vec!["a".to_string()],
            ..Default::default()
        });
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].provider, "b");

        // The required-provider boost overturns b's slower latency
        let ranked = tracker.rank_candidates(&RankOptions {
            required_provider: Some("b".to_string()),
            ..Default::default()
        });
        assert_eq!(ranked[0].provider, "b");
    }

    #[test]
    fn test_rank_cost_threshold() {
        let tracker = LatencyTracker::default();

        tracker.seed_priors(&[
            ProviderPrior::new("cheap", "query", 100.0).with_cost(0.001),
            ProviderPrior::new("pricey", "query", 100.0).with_cost(5.0),
        ]);

        let ranked = tracker.rank_candidates(&RankOptions {
            max_cost_per_unit: Some(1.0),
            ..Default::default()
        });
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].provider, "cheap");
    }

    #[test]
    fn test_rank_top_n() {
        let tracker = LatencyTracker::default();

        for provider in ["a", "b", "c", "d", "e"] {
            for _ in 0..5 {
                tracker.record(ToolOutcome::success(provider, "query", 100.0, 100.0));
            }
        }

        assert_eq!(tracker.rank_candidates(&RankOptions::default()).len(), 3);
        assert_eq!(
            tracker
                .rank_candidates(&RankOptions {
                    top_n: 5,
                    ..Default::default()
                })
                .len(),
            5
        );
    }

    #[test]
    fn test_percentile_indexing() {
        let sorted = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0];
        assert_eq!(percentile(&sorted, 50), 6.0);
        assert_eq!(percentile(&sorted, 90), 10.0);
        assert_eq!(percentile(&sorted, 99), 10.0);
        assert_eq!(percentile(&[], 50), 0.0);
    }

    #[test]
    fn test_throughput_ema_optional() {
        let tracker = LatencyTracker::default();

        tracker.record(ToolOutcome::success("api", "stream", 50.0, 500.0));
        assert!(tracker.get_stats("api", "stream").unwrap().ema_throughput.is_none());

        tracker.record(
            ToolOutcome::success("api", "stream", 50.0, 500.0).with_throughput(42.0),
        );
        let stats = tracker.get_stats("api", "stream").unwrap();
        assert_eq!(stats.ema_throughput, Some(42.0));
    }

    #[test]
    fn test_reset() {
        let tracker = LatencyTracker::default();
        tracker.record(ToolOutcome::success("api", "call", 50.0, 50.0));
        assert!(tracker.get_stats("api", "call").is_some());

        tracker.reset();
        assert!(tracker.get_stats("api", "call").is_none());
    }
}
