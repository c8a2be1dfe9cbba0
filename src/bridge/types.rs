//! Bridge Types
//!
//! Requests, results, and the host-supplied seams: the remote capability
//! invoker and the optional outcome feedback sink.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error codes carried by failed results and outcome records
pub mod error_codes {
    /// No response within the adaptive timeout
    pub const TIMEOUT: &str = "timeout";
    /// The invoker returned an error
    pub const REMOTE: &str = "remote_error";
    /// The circuit breaker refused dispatch
    pub const UNAVAILABLE: &str = "circuit_open";
}

/// One tool call to execute
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub provider: String,
    pub capability: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    /// Higher priority is scheduled first within a dependency level
    #[serde(default)]
    pub priority: i32,
    /// Request ids that must complete before this one runs
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ToolCallRequest {
    /// Create a request with a generated id
    pub fn new(provider: &str, capability: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            capability: capability.to_string(),
            arguments: serde_json::json!({}),
            priority: 0,
            depends_on: Vec::new(),
        }
    }

    /// Use a caller-chosen id
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a dependency
    pub fn depends_on(mut self, request_id: &str) -> Self {
        self.depends_on.push(request_id.to_string());
        self
    }
}

/// Result of one tool call (cached, fresh, or failed)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub id: String,
    pub provider: String,
    pub capability: String,
    pub success: bool,
    pub payload: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<String>,
    pub latency_ms: u64,
    /// True when served from the cache or the prefetch store
    pub cached: bool,
}

impl ToolCallResult {
    /// Create a successful result
    pub fn success(request: &ToolCallRequest, payload: serde_json::Value, latency: Duration) -> Self {
        Self {
            id: request.id.clone(),
            provider: request.provider.clone(),
            capability: request.capability.clone(),
            success: true,
            payload: Some(payload),
            error: None,
            error_code: None,
            latency_ms: latency.as_millis() as u64,
            cached: false,
        }
    }

    /// Create a failed result
    pub fn failure(
        request: &ToolCallRequest,
        error_code: &str,
        error: &str,
        latency: Duration,
    ) -> Self {
        Self {
            id: request.id.clone(),
            provider: request.provider.clone(),
            capability: request.capability.clone(),
            success: false,
            payload: None,
            error: Some(error.to_string()),
            error_code: Some(error_code.to_string()),
            latency_ms: latency.as_millis() as u64,
            cached: false,
        }
    }
}

/// Feedback delivered to the host after every completed live call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeFeedback {
    pub provider: String,
    pub capability: String,
    pub success: bool,
    pub latency_ms: f64,
    /// Relative deviation of observed latency from the EMA, clamped to [0, 1]
    pub surprise: f64,
    pub cost: f64,
}

/// Abstract remote capability invoker, supplied by the host.
///
/// The bridge treats this as an opaque, possibly slow, possibly failing
/// asynchronous operation; transport and authentication live behind it.
#[async_trait]
pub trait RemoteInvoker: Send + Sync {
    async fn invoke(
        &self,
        provider: &str,
        capability: &str,
        arguments: &serde_json::Value,
    ) -> anyhow::Result<serde_json::Value>;
}

/// Optional host-supplied sink for call outcomes.
///
/// Delivery is fire-and-forget; sink errors never affect call results.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn on_outcome(&self, feedback: OutcomeFeedback) -> anyhow::Result<()>;
}
