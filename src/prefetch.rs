//! Speculative Prefetch
//!
//! A rule table maps query text to tool calls that are likely needed next,
//! and a short-lived store holds the speculative results until the first
//! matching live request consumes them. Entries are never promoted into
//! the long-lived cache; unconsumed ones age out.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::bridge::types::ToolCallResult;

/// One speculative call a rule may fire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateCall {
    pub provider: String,
    pub capability: String,
    pub arguments: serde_json::Value,
}

impl CandidateCall {
    pub fn new(provider: &str, capability: &str) -> Self {
        Self {
            provider: provider.to_string(),
            capability: capability.to_string(),
            arguments: serde_json::json!({}),
        }
    }

    pub fn with_arguments(mut self, arguments: serde_json::Value) -> Self {
        self.arguments = arguments;
        self
    }
}

/// Query pattern plus the calls worth firing when it matches
#[derive(Debug, Clone)]
pub struct PrefetchRule {
    pattern: Regex,
    /// How likely the candidate calls are actually needed (0..1)
    pub confidence: f64,
    pub calls: Vec<CandidateCall>,
}

impl PrefetchRule {
    /// Create a rule; the pattern is matched case-insensitively
    pub fn new(pattern: &str, confidence: f64) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            confidence,
            calls: Vec::new(),
        })
    }

    pub fn with_call(mut self, call: CandidateCall) -> Self {
        self.calls.push(call);
        self
    }

    pub fn matches(&self, query: &str) -> bool {
        self.pattern.is_match(query)
    }
}

static DEFAULT_RULES: Lazy<Vec<PrefetchRule>> = Lazy::new(|| {
    vec![
        PrefetchRule::new(r"\b(news|headline|trending)\b", 0.8)
            .expect("static pattern")
            .with_call(CandidateCall::new("web", "trending_topics")),
        PrefetchRule::new(r"\b(remember|recall|memory|last time)\b", 0.75)
            .expect("static pattern")
            .with_call(
                CandidateCall::new("memory", "recent_entries")
                    .with_arguments(serde_json::json!({"limit": 10})),
            ),
        PrefetchRule::new(r"\b(status|health|uptime)\b", 0.7)
            .expect("static pattern")
            .with_call(CandidateCall::new("system", "health_snapshot")),
    ]
});

/// Built-in rule table for common agent queries; hosts usually replace it
pub fn default_rules() -> Vec<PrefetchRule> {
    DEFAULT_RULES.clone()
}

struct PrefetchEntry {
    result: ToolCallResult,
    inserted_at: Instant,
}

/// Store of speculative results awaiting consumption.
///
/// Consume-on-read: the first matching live request removes the entry.
pub struct PrefetchStore {
    entries: Mutex<HashMap<String, PrefetchEntry>>,
    ttl: Duration,
    max_entries: usize,
    stored: AtomicU64,
    consumed: AtomicU64,
}

impl PrefetchStore {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            max_entries,
            stored: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
        }
    }

    /// Store a speculative result, pruning expired entries and evicting the
    /// oldest insertion when over capacity
    pub fn put(&self, key: &str, result: ToolCallResult) {
        let mut entries = self.entries.lock();
        entries.retain(|_, e| e.inserted_at.elapsed() < self.ttl);

        if entries.len() >= self.max_entries {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key.to_string(),
            PrefetchEntry {
                result,
                inserted_at: Instant::now(),
            },
        );
        self.stored.fetch_add(1, Ordering::Relaxed);
        debug!("prefetch stored: {}", &key[..16.min(key.len())]);
    }

    /// Consume a speculative result if one is present and fresh
    pub fn take(&self, key: &str) -> Option<ToolCallResult> {
        let entry = self.entries.lock().remove(key)?;
        if entry.inserted_at.elapsed() >= self.ttl {
            return None;
        }
        self.consumed.fetch_add(1, Ordering::Relaxed);
        debug!("prefetch HIT: {}", &key[..16.min(key.len())]);
        Some(entry.result)
    }

    /// Fraction of stored speculative results that a live request consumed
    pub fn hit_rate(&self) -> f64 {
        let stored = self.stored.load(Ordering::Relaxed);
        if stored == 0 {
            return 0.0;
        }
        self.consumed.load(Ordering::Relaxed) as f64 / stored as f64
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.stored.store(0, Ordering::Relaxed);
        self.consumed.store(0, Ordering::Relaxed);
    }
}
