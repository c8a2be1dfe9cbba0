//! ToolBridge MCP
//!
//! Adaptive tool-call orchestration for MCP tool servers.
//!
//! # Features
//!
//! - **Latency Tracking**: rolling EMA/percentile statistics per (provider, capability)
//! - **Circuit Breaking**: closed/open/half-open guard per endpoint
//! - **Adaptive Timeouts**: per-call timeout from the endpoint's own P95
//! - **Dependency Leveling**: Kahn-style batching with cycle fallback
//! - **Result Caching**: SHA256-keyed dedup with TTL eviction
//! - **Speculative Prefetch**: rule-driven warm calls, consumed on first use
//! - **Candidate Ranking**: composite latency/risk/cost/uncertainty scoring
//!
//! # Architecture
//!
//! ```text
//! Caller ──► ToolBridge ──► RemoteInvoker (host-supplied MCP transport)
//!               │
//!               ├── LatencyTracker (stats + breakers + timeouts)
//!               ├── ToolResultCache (Moka, TTL + capacity)
//!               ├── PrefetchStore (speculative, consume-on-read)
//!               └── OutcomeSink (optional host feedback)
//! ```
//!
//! The bridge owns no transport: the host supplies a [`RemoteInvoker`] and
//! optionally an [`OutcomeSink`], and reads telemetry back out through
//! [`ToolBridge::get_stats`] and [`LatencyTracker::get_stats`].

pub mod bridge;
pub mod cache;
pub mod config;
pub mod prefetch;
pub mod tracker;

pub use bridge::{
    error_codes, BridgeStats, OutcomeFeedback, OutcomeSink, RemoteInvoker, ToolBridge,
    ToolCallRequest, ToolCallResult,
};
pub use cache::{CacheStats, ToolResultCache};
pub use config::{BridgeConfig, Config, ConfigError, TrackerConfig};
pub use prefetch::{default_rules, CandidateCall, PrefetchRule, PrefetchStore};
pub use tracker::{
    Candidate, LatencyTracker, ProviderPrior, ProviderStats, RankOptions, ToolOutcome, Trend,
};
