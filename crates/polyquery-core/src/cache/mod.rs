// Cache Layer - fail-open result cache in front of any adapter.
//
// Values are JSON (gzipped above a threshold) behind a pluggable backend.
// Backend failures never reach callers: they are counted, logged and served
// from a process-local fallback until the backend answers again.

pub mod backend;
pub mod codec;
pub mod fallback;

pub use backend::{CacheBackend, MokaBackend};
pub use codec::CacheCodec;
use codec::is_compressed;
pub use fallback::FallbackCache;

use polyquery_common::config::CacheConfig;
use polyquery_common::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tag indexes outlive their entries by this much.
pub const TAG_TTL_GRACE: Duration = Duration::from_secs(60);

const VALUE_SPACE: &str = "v:";
const TAG_SPACE: &str = "t:";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub errors: u64,
    /// Sets whose payload was stored gzipped.
    pub compressed_sets: u64,
    pub hit_rate: f64,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_entries: Option<u64>,
    pub fallback_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheHealth {
    pub enabled: bool,
    pub healthy: bool,
    pub backend: String,
    pub latency_ms: u64,
    pub fallback_entries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    compressed_sets: AtomicU64,
}

pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    fallback: FallbackCache,
    codec: CacheCodec,
    config: CacheConfig,
    counters: Counters,
}

impl CacheLayer {
    /// Must be called inside a tokio runtime (the fallback starts its sweep task).
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        let fallback = FallbackCache::new(
            Duration::from_secs(config.fallback_sweep_interval_secs),
            config.local_max_entries as usize,
        );
        Self {
            backend,
            fallback,
            codec: CacheCodec::new(config.compression, config.compression_threshold),
            config,
            counters: Counters::default(),
        }
    }

    /// In-process layer on the bundled moka backend.
    pub fn in_memory(config: CacheConfig) -> Self {
        let backend = Arc::new(MokaBackend::new(config.local_max_entries));
        Self::new(config, backend)
    }

    /// Build from configuration. Only `memory://` (or no URL) is served by a
    /// bundled backend; anything else needs [`CacheLayer::new`] with a client.
    pub fn from_config(config: CacheConfig) -> DbResult<Self> {
        match config.url.as_deref() {
            None | Some("") => Ok(Self::in_memory(config)),
            Some(url) if url.starts_with("memory://") => Ok(Self::in_memory(config)),
            Some(url) => Err(DbError::Config(format!(
                "no bundled cache client for '{}'; construct CacheLayer::new with a CacheBackend",
                url
            ))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    /// Backend key for a cached value: `<prefix>v:<key>`. Over-long keys are
    /// replaced by their SHA-256.
    pub fn full_key(&self, key: &str) -> String {
        self.namespaced(VALUE_SPACE, key)
    }

    /// Tag indexes live in their own space, so no value key can overwrite one.
    fn tag_key(&self, tag: &str) -> String {
        self.namespaced(TAG_SPACE, tag)
    }

    fn namespaced(&self, space: &str, key: &str) -> String {
        let full = format!("{}{}{}", self.config.key_prefix, space, key);
        if full.len() <= self.config.max_key_size {
            return full;
        }
        format!("{}{}{:x}", self.config.key_prefix, space, Sha256::digest(key.as_bytes()))
    }

    fn backend_failed(&self, operation: &str, key: &str, e: anyhow::Error) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            "Cache backend '{}' {} failed for {}: {}; using local fallback",
            self.backend.name(),
            operation,
            key,
            e
        );
    }

    async fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        match self.backend.get(key).await {
            Ok(v) => v,
            Err(e) => {
                self.backend_failed("get", key, e);
                self.fallback.get(key)
            }
        }
    }

    async fn raw_set(&self, key: &str, bytes: Vec<u8>, ttl: Duration) {
        if let Err(e) = self.backend.set(key, bytes.clone(), ttl).await {
            self.backend_failed("set", key, e);
            self.fallback.set(key, bytes, ttl);
        }
    }

    async fn raw_delete(&self, keys: &[String]) -> u64 {
        let local = self.fallback.delete(keys);
        match self.backend.delete(keys).await {
            Ok(n) => n.max(local),
            Err(e) => {
                self.backend_failed("delete", &keys.join(","), e);
                local
            }
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        let full = self.full_key(key);
        let Some(bytes) = self.raw_get(&full).await else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache MISS for {}", key);
            return None;
        };
        match self.codec.decode(&bytes) {
            Ok(v) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Cache HIT for {}", key);
                Some(v)
            }
            Err(e) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Undecodable cache entry for {}: {}", key, e);
                None
            }
        }
    }

    /// Returns `false` when disabled, unencodable or larger than `max_value_size`.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let bytes = match self.codec.encode(value) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Cannot encode cache value for {}: {}", key, e);
                return false;
            }
        };
        if bytes.len() > self.config.max_value_size {
            tracing::warn!(
                "Refusing to cache {}: {} bytes exceeds limit of {}",
                key,
                bytes.len(),
                self.config.max_value_size
            );
            return false;
        }
        if is_compressed(&bytes) {
            self.counters.compressed_sets.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Cache SET for {} stored gzipped ({} bytes)", key, bytes.len());
        }
        let full = self.full_key(key);
        self.raw_set(&full, bytes, ttl.unwrap_or_else(|| self.default_ttl())).await;
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub async fn delete(&self, key: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        let removed = self.raw_delete(&[self.full_key(key)]).await;
        self.counters.deletes.fetch_add(removed, Ordering::Relaxed);
        removed > 0
    }

    /// Cached value for `key`, or run `producer` and cache its `Ok` result.
    /// Producer errors are returned as-is and nothing is cached.
    pub async fn remember<T, E, F, Fut>(&self, key: &str, ttl: Option<Duration>, producer: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get::<T>(key).await {
            return Ok(hit);
        }
        let value = producer().await?;
        self.set(key, &value, ttl).await;
        Ok(value)
    }

    pub async fn set_with_tags<T, S>(&self, key: &str, value: &T, tags: &[S], ttl: Option<Duration>) -> bool
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        if !self.set(key, value, ttl).await {
            return false;
        }
        let member = self.full_key(key);
        let tag_ttl = ttl.unwrap_or_else(|| self.default_ttl()) + TAG_TTL_GRACE;
        for tag in tags {
            let tag_key = self.tag_key(tag.as_ref());
            if let Err(e) = self.backend.add_to_set(&tag_key, &member, tag_ttl).await {
                self.backend_failed("add_to_set", &tag_key, e);
                self.fallback.add_to_set(&tag_key, &member, tag_ttl);
            }
        }
        true
    }

    /// Delete every key tagged with `tag` and the tag index; returns how many
    /// tagged keys were removed.
    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        if !self.config.enabled {
            return 0;
        }
        let tag_key = self.tag_key(tag);
        let mut members = self.fallback.set_members(&tag_key);
        match self.backend.set_members(&tag_key).await {
            Ok(remote) => members.extend(remote),
            Err(e) => self.backend_failed("set_members", &tag_key, e),
        }
        members.sort();
        members.dedup();

        let removed = if members.is_empty() { 0 } else { self.raw_delete(&members).await };
        self.raw_delete(&[tag_key]).await;
        self.counters.deletes.fetch_add(removed, Ordering::Relaxed);
        tracing::info!("Invalidated {} cache entries tagged '{}'", removed, tag);
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.counters.hits.load(Ordering::Relaxed);
        let misses = self.counters.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            hits,
            misses,
            sets: self.counters.sets.load(Ordering::Relaxed),
            deletes: self.counters.deletes.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            compressed_sets: self.counters.compressed_sets.load(Ordering::Relaxed),
            hit_rate: if lookups == 0 { 0.0 } else { hits as f64 / lookups as f64 },
            backend: self.backend.name().to_string(),
            backend_entries: self.backend.entry_count(),
            fallback_entries: self.fallback.len(),
        }
    }

    pub fn reset_stats(&self) {
        for counter in [
            &self.counters.hits,
            &self.counters.misses,
            &self.counters.sets,
            &self.counters.deletes,
            &self.counters.errors,
            &self.counters.compressed_sets,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub async fn health_check(&self) -> CacheHealth {
        let started = Instant::now();
        let (healthy, message) = if !self.config.enabled {
            (true, Some("cache disabled".to_string()))
        } else {
            match self.backend.ping().await {
                Ok(()) => (true, None),
                Err(e) => (false, Some(e.to_string())),
            }
        };
        CacheHealth {
            enabled: self.config.enabled,
            healthy,
            backend: self.backend.name().to_string(),
            latency_ms: started.elapsed().as_millis() as u64,
            fallback_entries: self.fallback.len(),
            message,
        }
    }

    /// Stop the fallback sweep and drop its entries.
    pub fn shutdown(&self) {
        self.fallback.shutdown();
        tracing::info!("Cache layer shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    struct DownBackend;

    #[async_trait]
    impl CacheBackend for DownBackend {
        fn name(&self) -> &str {
            "down"
        }
        async fn get(&self, _key: &str) -> anyhow::Result<Option<Vec<u8>>> {
            Err(anyhow!("connection refused"))
        }
        async fn set(&self, _key: &str, _value: Vec<u8>, _ttl: Duration) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn delete(&self, _keys: &[String]) -> anyhow::Result<u64> {
            Err(anyhow!("connection refused"))
        }
        async fn add_to_set(&self, _set_key: &str, _member: &str, _ttl: Duration) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }
        async fn set_members(&self, _set_key: &str) -> anyhow::Result<Vec<String>> {
            Err(anyhow!("connection refused"))
        }
        async fn ping(&self) -> anyhow::Result<()> {
            Err(anyhow!("connection refused"))
        }
    }

    fn layer() -> CacheLayer {
        CacheLayer::in_memory(CacheConfig::default())
    }

    #[tokio::test]
    async fn test_get_set_delete() {
        let cache = layer();
        assert_eq!(cache.get::<Value>("user:1").await, None);
        assert!(cache.set("user:1", &json!({ "name": "ann" }), None).await);
        assert_eq!(cache.get::<Value>("user:1").await, Some(json!({ "name": "ann" })));
        assert!(cache.delete("user:1").await);
        assert_eq!(cache.get::<Value>("user:1").await, None);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.sets, stats.deletes), (1, 2, 1, 1));
        cache.reset_stats();
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_remember_invokes_producer_once() {
        let cache = layer();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let v: Result<u64, DbError> = cache
                .remember("answer", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await;
            assert_eq!(v.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remember_does_not_cache_errors() {
        let cache = layer();
        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let v: Result<u64, DbError> = cache
                .remember("flaky", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(DbError::validation("boom"))
                })
                .await;
            assert!(v.is_err());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tag_invalidation() {
        let cache = layer();
        cache.set_with_tags("q1", &json!([1]), &["users"], None).await;
        cache.set_with_tags("q2", &json!([2]), &["users", "orders"], None).await;
        cache.set_with_tags("q3", &json!([3]), &["orders"], None).await;

        assert_eq!(cache.invalidate_by_tag("users").await, 2);
        assert_eq!(cache.get::<Value>("q1").await, None);
        assert_eq!(cache.get::<Value>("q2").await, None);
        assert_eq!(cache.get::<Value>("q3").await, Some(json!([3])));
        assert_eq!(cache.invalidate_by_tag("users").await, 0);
    }

    #[tokio::test]
    async fn test_oversized_values_rejected_and_long_keys_hashed() {
        let config = CacheConfig {
            max_value_size: 64,
            compression: false,
            ..CacheConfig::default()
        };
        let cache = CacheLayer::in_memory(config);
        let big = "x".repeat(200);
        assert!(!cache.set("big", &big, None).await);
        assert_eq!(cache.get::<String>("big").await, None);

        let long_key = "k".repeat(400);
        let full = cache.full_key(&long_key);
        assert!(full.starts_with("polyquery:v:"));
        assert_eq!(full.len(), "polyquery:v:".len() + 64);
        assert!(cache.set(&long_key, &1, None).await);
        assert_eq!(cache.get::<i32>(&long_key).await, Some(1));
    }

    #[tokio::test]
    async fn test_compressed_values_round_trip() {
        let config = CacheConfig {
            compression_threshold: 32,
            ..CacheConfig::default()
        };
        let cache = CacheLayer::in_memory(config);
        let rows: Vec<Value> = (0..100).map(|i| json!({ "id": i, "tag": "same-same-same" })).collect();
        assert!(cache.set("rows", &rows, None).await);
        assert!(cache.set("tiny", &1, None).await);
        assert_eq!(cache.get::<Vec<Value>>("rows").await, Some(rows));

        let stats = cache.stats();
        assert_eq!((stats.sets, stats.compressed_sets), (2, 1));
        assert!(stats.backend_entries.is_some());
    }

    #[tokio::test]
    async fn test_user_keys_cannot_clobber_tag_indexes() {
        let cache = layer();
        cache.set_with_tags("q1", &json!([1]), &["users"], None).await;
        assert_ne!(cache.full_key("tag:users"), cache.tag_key("users"));
        assert_ne!(cache.full_key("t:users"), cache.tag_key("users"));

        assert!(cache.set("tag:users", &json!("plain value"), None).await);
        assert!(cache.set("t:users", &json!("plain value"), None).await);
        assert_eq!(cache.invalidate_by_tag("users").await, 1);
        assert_eq!(cache.get::<Value>("q1").await, None);
        assert_eq!(cache.get::<Value>("tag:users").await, Some(json!("plain value")));
    }

    #[tokio::test]
    async fn test_failing_backend_fails_open_to_fallback() {
        let cache = CacheLayer::new(CacheConfig::default(), Arc::new(DownBackend));

        assert_eq!(cache.get::<Value>("k").await, None);
        assert!(cache.set_with_tags("k", &json!("v"), &["t"], None).await);
        assert_eq!(cache.get::<Value>("k").await, Some(json!("v")));
        assert_eq!(cache.invalidate_by_tag("t").await, 1);
        assert_eq!(cache.get::<Value>("k").await, None);

        let stats = cache.stats();
        assert!(stats.errors >= 5, "errors = {}", stats.errors);
        assert_eq!(stats.backend_entries, None);

        let health = cache.health_check().await;
        assert!(!health.healthy);
        assert_eq!(health.message.as_deref(), Some("connection refused"));

        cache.set("left-behind", &1, None).await;
        assert!(cache.stats().fallback_entries > 0);
        cache.shutdown();
        assert_eq!(cache.stats().fallback_entries, 0);
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let cache = CacheLayer::in_memory(CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        assert!(!cache.set("k", &1, None).await);
        assert_eq!(cache.get::<i32>("k").await, None);

        let calls = AtomicUsize::new(0);
        for _ in 0..2 {
            let _: Result<i32, DbError> = cache
                .remember("k", None, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(1)
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(cache.health_check().await.healthy);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = layer();
        cache.set("short", &1, Some(Duration::from_millis(50))).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get::<i32>("short").await, None);
    }

    #[test]
    fn test_remote_urls_need_explicit_backend() {
        let config = CacheConfig {
            url: Some("redis://localhost:6379".to_string()),
            ..CacheConfig::default()
        };
        assert!(matches!(CacheLayer::from_config(config), Err(DbError::Config(_))));
    }
}
