//! Tool Result Cache
//!
//! Deduplicates identical tool calls behind SHA256 keys over the
//! canonicalized call signature. Entries expire by TTL or capacity.

use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::bridge::types::ToolCallResult;

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// Long-lived result cache for completed tool calls
#[derive(Clone)]
pub struct ToolResultCache {
    cache: Cache<String, ToolCallResult>,
    hits: Arc<AtomicU64>,
    misses: Arc<AtomicU64>,
    enabled: bool,
}

impl ToolResultCache {
    /// Create a new cache with TTL and capacity bounds
    pub fn new(max_entries: u64, ttl: Duration, enabled: bool) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .time_to_live(ttl)
            .build();

        Self {
            cache,
            hits: Arc::new(AtomicU64::new(0)),
            misses: Arc::new(AtomicU64::new(0)),
            enabled,
        }
    }

    /// Compute the cache key for a call signature
    ///
    /// Key = SHA256(provider + capability + canonical arguments). serde_json
    /// maps iterate in sorted key order, so serializing the arguments value
    /// yields a canonical form regardless of the order keys arrived in.
    pub fn compute_key(provider: &str, capability: &str, arguments: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(provider.as_bytes());
        hasher.update(b"\0");
        hasher.update(capability.as_bytes());
        hasher.update(b"\0");
        hasher.update(arguments.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Get a cached result
    pub async fn get(&self, key: &str) -> Option<ToolCallResult> {
        if !self.enabled {
            return None;
        }

        if let Some(result) = self.cache.get(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!("cache HIT: {}", &key[..16]);
            Some(result)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("cache MISS: {}", &key[..16]);
            None
        }
    }

    /// Store a result
    pub async fn insert(&self, key: &str, result: ToolCallResult) {
        if !self.enabled {
            return;
        }

        self.cache.insert(key.to_string(), result).await;
        debug!("cache SET: {}", &key[..16]);
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            entries: self.cache.entry_count(),
            hits,
            misses,
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    /// Invalidate one entry
    pub async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key).await;
    }

    /// Clear all entries and counters
    pub async fn clear(&self) {
        self.cache.invalidate_all();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::types::ToolCallRequest;

    fn sample_result(id: &str) -> ToolCallResult {
        let request = ToolCallRequest::new("search", "query").with_id(id);
        ToolCallResult::success(
            &request,
            serde_json::json!({"answer": 42}),
            Duration::from_millis(120),
        )
    }

    #[tokio::test]
    async fn test_cache_hit_miss() {
        let cache = ToolResultCache::new(100, Duration::from_secs(3600), true);

        let key =
            ToolResultCache::compute_key("search", "query", &serde_json::json!({"q": "rust"}));

        assert!(cache.get(&key).await.is_none());

        cache.insert(&key, sample_result("r1")).await;

        let result = cache.get(&key).await;
        assert!(result.is_some());
        assert!(result.unwrap().success);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_hits() {
        let cache = ToolResultCache::new(100, Duration::from_secs(3600), false);
        let key = ToolResultCache::compute_key("search", "query", &serde_json::json!({}));

        cache.insert(&key, sample_result("r1")).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[test]
    fn test_key_consistency() {
        let args = serde_json::json!({"q": "rust", "limit": 5});
        let key1 = ToolResultCache::compute_key("search", "query", &args);
        let key2 = ToolResultCache::compute_key("search", "query", &args);
        assert_eq!(key1, key2);
    }

    #[test]
    fn test_key_canonicalizes_argument_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"q": "rust", "limit": 5, "opts": {"x": 1, "y": 2}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"opts": {"y": 2, "x": 1}, "limit": 5, "q": "rust"}"#).unwrap();

        assert_eq!(
            ToolResultCache::compute_key("search", "query", &a),
            ToolResultCache::compute_key("search", "query", &b)
        );
    }

    #[test]
    fn test_key_varies_with_signature() {
        let args = serde_json::json!({"q": "rust"});
        let key1 = ToolResultCache::compute_key("search", "query", &args);
        let key2 = ToolResultCache::compute_key("search", "fetch", &args);
        let key3 = ToolResultCache::compute_key("docs", "query", &args);
        let key4 =
            ToolResultCache::compute_key("search", "query", &serde_json::json!({"q": "go"}));

        assert_ne!(key1, key2);
        assert_ne!(key1, key3);
        assert_ne!(key1, key4);
    }

    #[test]
    fn test_invalidate() {
        tokio_test::block_on(async {
            let cache = ToolResultCache::new(100, Duration::from_secs(3600), true);
            let key = ToolResultCache::compute_key("search", "query", &serde_json::json!({}));

            cache.insert(&key, sample_result("r1")).await;
            assert!(cache.get(&key).await.is_some());

            cache.invalidate(&key).await;
            assert!(cache.get(&key).await.is_none());
        });
    }
}
