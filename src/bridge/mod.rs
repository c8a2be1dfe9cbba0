//! Bridge Module
//!
//! Orchestrates batches of remote tool calls: dependency-aware leveling,
//! bounded parallelism, result caching, speculative prefetch, and adaptive
//! per-call timeouts fed by the latency tracker.

pub mod orchestrator;
pub mod types;

pub use orchestrator::{BridgeStats, ToolBridge};
pub use types::{
    error_codes, OutcomeFeedback, OutcomeSink, RemoteInvoker, ToolCallRequest, ToolCallResult,
};
