//! Tool Orchestration Bridge
//!
//! Executes batches of tool calls against an abstract remote invoker.
//! Requests are grouped into dependency levels (Kahn-style), each level
//! runs with bounded parallelism, and every call resolves through
//! cache -> prefetch store -> live invocation under an adaptive timeout.
//! Per-call failures are data, never errors: a batch always yields exactly
//! one result per submitted request.

use futures_util::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::cache::ToolResultCache;
use crate::config::{BridgeConfig, ConfigError};
use crate::prefetch::{default_rules, CandidateCall, PrefetchRule, PrefetchStore};
use crate::tracker::{LatencyTracker, ToolOutcome};

use super::types::{
    error_codes, OutcomeFeedback, OutcomeSink, RemoteInvoker, ToolCallRequest, ToolCallResult,
};

/// Aggregate bridge observability
#[derive(Debug, Clone, Serialize)]
pub struct BridgeStats {
    pub cache_hit_rate: f64,
    pub prefetch_hit_rate: f64,
    pub avg_latency_by_key: HashMap<String, f64>,
    pub active_connections: usize,
}

/// The orchestration bridge.
///
/// Cheap to clone; all shared state lives behind `Arc`s. Construct one per
/// process and inject it (no global instance).
#[derive(Clone)]
pub struct ToolBridge {
    config: BridgeConfig,
    tracker: Arc<LatencyTracker>,
    invoker: Arc<dyn RemoteInvoker>,
    cache: ToolResultCache,
    prefetch_store: Arc<PrefetchStore>,
    rules: Arc<Vec<PrefetchRule>>,
    sink: Option<Arc<dyn OutcomeSink>>,
    active: Arc<AtomicUsize>,
}

impl ToolBridge {
    /// Create a bridge, failing fast on invalid configuration
    pub fn new(
        config: BridgeConfig,
        tracker: Arc<LatencyTracker>,
        invoker: Arc<dyn RemoteInvoker>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let cache = ToolResultCache::new(
            config.cache_max_entries,
            config.cache_ttl,
            config.cache_enabled,
        );
        let prefetch_store = Arc::new(PrefetchStore::new(
            config.prefetch_ttl,
            config.prefetch_max_entries,
        ));

        Ok(Self {
            config,
            tracker,
            invoker,
            cache,
            prefetch_store,
            rules: Arc::new(default_rules()),
            sink: None,
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Replace the prefetch rule table
    pub fn with_rules(mut self, rules: Vec<PrefetchRule>) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    /// Attach an outcome feedback sink
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Execute a batch of tool calls, yielding results as they settle.
    ///
    /// Requests are partitioned into dependency levels; level k+1 never
    /// starts before level k settles, and within a level completion order
    /// is whatever the underlying I/O returns. One pass per invocation;
    /// every submitted request produces exactly one result.
    pub fn execute_tools(&self, requests: Vec<ToolCallRequest>) -> ReceiverStream<ToolCallResult> {
        let (tx, rx) = mpsc::channel(requests.len().max(1));
        let bridge = self.clone();

        tokio::spawn(async move {
            let levels = partition_levels(requests);
            info!("executing batch across {} dependency levels", levels.len());

            for mut level in levels {
                bridge.order_level(&mut level);

                while !level.is_empty() {
                    let take = bridge.config.max_parallel.min(level.len());
                    let batch: Vec<ToolCallRequest> = level.drain(..take).collect();

                    let mut in_flight: FuturesUnordered<_> = batch
                        .into_iter()
                        .map(|request| {
                            let bridge = bridge.clone();
                            async move { bridge.execute_single(request).await }
                        })
                        .collect();

                    while let Some(result) = in_flight.next().await {
                        if tx.send(result).await.is_err() {
                            debug!("result receiver dropped, abandoning batch");
                            return;
                        }
                    }
                }
            }
        });

        ReceiverStream::new(rx)
    }

    /// Execute one tool call: cache hit, then prefetch hit, then live
    /// invocation. Never raises; failures come back as data.
    pub async fn execute_single(&self, request: ToolCallRequest) -> ToolCallResult {
        let start = Instant::now();
        let key = ToolResultCache::compute_key(
            &request.provider,
            &request.capability,
            &request.arguments,
        );

        if let Some(mut hit) = self.cache.get(&key).await {
            hit.id = request.id.clone();
            hit.cached = true;
            hit.latency_ms = start.elapsed().as_millis() as u64;
            return hit;
        }

        if self.config.prefetch_enabled {
            if let Some(mut hit) = self.prefetch_store.take(&key) {
                hit.id = request.id.clone();
                hit.cached = true;
                hit.latency_ms = start.elapsed().as_millis() as u64;
                return hit;
            }
        }

        self.invoke_live(request, key).await
    }

    async fn invoke_live(&self, request: ToolCallRequest, cache_key: String) -> ToolCallResult {
        if !self.tracker.is_available(&request.provider, &request.capability) {
            debug!(
                "circuit open for {}::{}, refusing dispatch",
                request.provider, request.capability
            );
            return ToolCallResult::failure(
                &request,
                error_codes::UNAVAILABLE,
                "circuit breaker open",
                Duration::ZERO,
            );
        }

        let timeout = self
            .tracker
            .adaptive_timeout(&request.provider, &request.capability);
        let expected_ms = self
            .tracker
            .get_stats(&request.provider, &request.capability)
            .map(|s| s.ema_total_latency_ms);

        self.active.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let invocation = tokio::time::timeout(
            timeout,
            self.invoker
                .invoke(&request.provider, &request.capability, &request.arguments),
        )
        .await;
        self.active.fetch_sub(1, Ordering::Relaxed);

        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_millis() as f64;

        match invocation {
            Ok(Ok(payload)) => {
                self.tracker.record(ToolOutcome::success(
                    &request.provider,
                    &request.capability,
                    elapsed_ms,
                    elapsed_ms,
                ));
                let result = ToolCallResult::success(&request, payload, elapsed);
                self.cache.insert(&cache_key, result.clone()).await;
                self.emit_feedback(&request, true, elapsed_ms, expected_ms);
                result
            }
            Ok(Err(e)) => {
                self.tracker.record(ToolOutcome::failure(
                    &request.provider,
                    &request.capability,
                    elapsed_ms,
                    error_codes::REMOTE,
                ));
                self.emit_feedback(&request, false, elapsed_ms, expected_ms);
                ToolCallResult::failure(&request, error_codes::REMOTE, &e.to_string(), elapsed)
            }
            Err(_) => {
                warn!(
                    "{}::{} timed out after {}ms",
                    request.provider,
                    request.capability,
                    timeout.as_millis()
                );
                self.tracker.record(ToolOutcome::failure(
                    &request.provider,
                    &request.capability,
                    elapsed_ms,
                    error_codes::TIMEOUT,
                ));
                self.emit_feedback(&request, false, elapsed_ms, expected_ms);
                ToolCallResult::failure(
                    &request,
                    error_codes::TIMEOUT,
                    &format!("no response within {}ms", timeout.as_millis()),
                    elapsed,
                )
            }
        }
    }

    /// Fire speculative calls for a query against the rule table.
    ///
    /// Best-effort: calls run without blocking the caller, successes land
    /// in the prefetch store, failures are dropped. Returns the key names
    /// of the calls actually fired.
    pub fn prefetch(&self, query: &str) -> Vec<String> {
        if !self.config.prefetch_enabled {
            return Vec::new();
        }

        let mut fired = Vec::new();
        'rules: for rule in self.rules.iter() {
            if rule.confidence < self.config.prefetch_confidence_threshold || !rule.matches(query) {
                continue;
            }
            for call in &rule.calls {
                if fired.len() >= self.config.max_prefetch {
                    break 'rules;
                }
                fired.push(format!("{}::{}", call.provider, call.capability));

                let bridge = self.clone();
                let call = call.clone();
                tokio::spawn(async move {
                    bridge.speculative_call(call).await;
                });
            }
        }

        if !fired.is_empty() {
            debug!("prefetch fired {} speculative calls", fired.len());
        }
        fired
    }

    async fn speculative_call(&self, call: CandidateCall) {
        if !self.tracker.is_available(&call.provider, &call.capability) {
            return;
        }

        let key = ToolResultCache::compute_key(&call.provider, &call.capability, &call.arguments);
        let timeout = self.tracker.adaptive_timeout(&call.provider, &call.capability);
        let start = Instant::now();

        match tokio::time::timeout(
            timeout,
            self.invoker
                .invoke(&call.provider, &call.capability, &call.arguments),
        )
        .await
        {
            Ok(Ok(payload)) => {
                let elapsed = start.elapsed();
                let elapsed_ms = elapsed.as_millis() as f64;
                self.tracker.record(ToolOutcome::success(
                    &call.provider,
                    &call.capability,
                    elapsed_ms,
                    elapsed_ms,
                ));
                let request = ToolCallRequest::new(&call.provider, &call.capability)
                    .with_arguments(call.arguments.clone());
                self.prefetch_store
                    .put(&key, ToolCallResult::success(&request, payload, elapsed));
            }
            Ok(Err(e)) => {
                self.tracker.record(ToolOutcome::failure(
                    &call.provider,
                    &call.capability,
                    start.elapsed().as_millis() as f64,
                    error_codes::REMOTE,
                ));
                debug!(
                    "speculative {}::{} failed: {}",
                    call.provider, call.capability, e
                );
            }
            Err(_) => {
                self.tracker.record(ToolOutcome::failure(
                    &call.provider,
                    &call.capability,
                    start.elapsed().as_millis() as f64,
                    error_codes::TIMEOUT,
                ));
                debug!("speculative {}::{} timed out", call.provider, call.capability);
            }
        }
    }

    /// Adaptive timeout the next live call to this key would get
    pub fn adaptive_timeout_for(&self, provider: &str, capability: &str) -> Duration {
        self.tracker.adaptive_timeout(provider, capability)
    }

    /// Aggregate observability snapshot
    pub fn get_stats(&self) -> BridgeStats {
        BridgeStats {
            cache_hit_rate: self.cache.stats().hit_rate,
            prefetch_hit_rate: self.prefetch_store.hit_rate(),
            avg_latency_by_key: self.tracker.average_latencies(),
            active_connections: self.active.load(Ordering::Relaxed),
        }
    }

    /// Priority descending, then observed average latency ascending so
    /// cheaper calls dispatch first
    fn order_level(&self, level: &mut [ToolCallRequest]) {
        level.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| {
                let la = self
                    .tracker
                    .average_latency(&a.provider, &a.capability)
                    .unwrap_or(f64::MAX);
                let lb = self
                    .tracker
                    .average_latency(&b.provider, &b.capability)
                    .unwrap_or(f64::MAX);
                la.partial_cmp(&lb).unwrap_or(std::cmp::Ordering::Equal)
            })
        });
    }

    fn emit_feedback(
        &self,
        request: &ToolCallRequest,
        success: bool,
        latency_ms: f64,
        expected_ms: Option<f64>,
    ) {
        let sink = match &self.sink {
            Some(sink) => Arc::clone(sink),
            None => return,
        };

        let surprise = match expected_ms {
            Some(expected) if expected > 0.0 => ((latency_ms - expected).abs() / expected).min(1.0),
            _ => 0.0,
        };
        let feedback = OutcomeFeedback {
            provider: request.provider.clone(),
            capability: request.capability.clone(),
            success,
            latency_ms,
            surprise,
            cost: self
                .tracker
                .cost_per_unit(&request.provider, &request.capability),
        };

        tokio::spawn(async move {
            if let Err(e) = sink.on_outcome(feedback).await {
                debug!("outcome sink rejected feedback: {}", e);
            }
        });
    }
}

/// Group requests into dependency levels.
///
/// A request enters level k once every dependency in its list has completed
/// in an earlier level; dependencies naming ids outside the batch are
/// treated as already satisfied. A cycle leaves no request eligible, in
/// which case the remainder is forced into one final best-effort level
/// instead of deadlocking (liveness over strict ordering).
fn partition_levels(requests: Vec<ToolCallRequest>) -> Vec<Vec<ToolCallRequest>> {
    let batch_ids: HashSet<String> = requests.iter().map(|r| r.id.clone()).collect();
    let mut remaining = requests;
    let mut completed: HashSet<String> = HashSet::new();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|r| {
            r.depends_on
                .iter()
                .all(|dep| completed.contains(dep) || !batch_ids.contains(dep))
        });

        if ready.is_empty() {
            warn!(
                "dependency cycle among {} requests, forcing final level",
                blocked.len()
            );
            levels.push(blocked);
            break;
        }

        completed.extend(ready.iter().map(|r| r.id.clone()));
        levels.push(ready);
        remaining = blocked;
    }

    levels
}
