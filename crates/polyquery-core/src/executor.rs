use polyquery_common::{DbResult, EngineKind};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{DatabaseAdapter, QueryResult, TransactionFn};
use crate::cache::CacheLayer;
use crate::query::{QueryBuilder, Statement};

/// Adapter front end that serves reads from the cache and invalidates the
/// target's tag after successful writes.
///
/// A cached read is tagged with every table or collection it depends on
/// (target, joins, `$lookup` sources), so a write to any of them evicts it.
/// Raw statements bypass the cache.
#[derive(Clone)]
pub struct CachedExecutor {
    adapter: Arc<dyn DatabaseAdapter>,
    cache: Option<Arc<CacheLayer>>,
    ttl: Option<Duration>,
}

impl CachedExecutor {
    pub fn new(adapter: Arc<dyn DatabaseAdapter>) -> Self {
        Self {
            adapter,
            cache: None,
            ttl: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// TTL for cached reads; the cache's default applies otherwise.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    pub fn cache(&self) -> Option<&Arc<CacheLayer>> {
        self.cache.as_ref()
    }

    pub fn engine(&self) -> EngineKind {
        self.adapter.engine()
    }

    /// `query:<sha256 of the serialized statement>`.
    pub fn cache_key(statement: &Statement) -> DbResult<String> {
        let bytes = serde_json::to_vec(statement)?;
        Ok(format!("query:{:x}", Sha256::digest(&bytes)))
    }

    pub async fn execute(&self, statement: &Statement) -> DbResult<QueryResult> {
        let Some(cache) = self.cache.as_ref().filter(|c| c.is_enabled() && !statement.is_raw()) else {
            return self.adapter.execute(statement).await;
        };

        if statement.is_read() {
            let key = Self::cache_key(statement)?;
            if let Some(hit) = cache.get::<QueryResult>(&key).await {
                return Ok(hit);
            }
            let result = self.adapter.execute(statement).await?;
            cache.set_with_tags(&key, &result, &statement.dependencies(), self.ttl).await;
            return Ok(result);
        }

        let result = self.adapter.execute(statement).await?;
        let removed = cache.invalidate_by_tag(statement.target()).await;
        tracing::debug!(
            "{} on {} invalidated {} cached reads",
            statement.operation_name(),
            statement.target(),
            removed
        );
        Ok(result)
    }

    /// Build `builder` for this adapter's engine and execute it.
    pub async fn run(&self, builder: &QueryBuilder) -> DbResult<QueryResult> {
        let statement = builder.build_for(self.adapter.engine())?;
        self.execute(&statement).await
    }

    /// Passes straight through; callers invalidate affected targets themselves.
    pub async fn transaction(&self, work: TransactionFn) -> DbResult<Value> {
        self.adapter.transaction(work).await
    }

    pub async fn invalidate(&self, target: &str) -> u64 {
        match &self.cache {
            Some(cache) => cache.invalidate_by_tag(target).await,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{HealthStatus, SqliteAdapter};
    use async_trait::async_trait;
    use polyquery_common::config::CacheConfig;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts statements that reach the engine.
    struct Counting {
        inner: SqliteAdapter,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DatabaseAdapter for Counting {
        fn engine(&self) -> EngineKind {
            EngineKind::Sqlite
        }

        async fn connect(&self) -> DbResult<()> {
            self.inner.connect().await
        }

        async fn execute(&self, statement: &Statement) -> DbResult<QueryResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.execute(statement).await
        }

        async fn health_check(&self) -> DbResult<HealthStatus> {
            self.inner.health_check().await
        }
    }

    async fn setup() -> (Arc<Counting>, CachedExecutor) {
        let adapter = Arc::new(Counting {
            inner: SqliteAdapter::memory(),
            calls: AtomicUsize::new(0),
        });
        adapter.connect().await.unwrap();
        adapter
            .execute(&Statement::raw("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)"))
            .await
            .unwrap();
        adapter.calls.store(0, Ordering::SeqCst);

        let cache = Arc::new(CacheLayer::in_memory(CacheConfig::default()));
        let executor = CachedExecutor::new(adapter.clone()).with_cache(cache);
        (adapter, executor)
    }

    #[tokio::test]
    async fn test_reads_are_cached_until_a_write() {
        let (adapter, executor) = setup().await;
        let list = QueryBuilder::table("items").order_by("id", "ASC");

        assert!(executor.run(&list).await.unwrap().rows.is_empty());
        assert!(executor.run(&list).await.unwrap().rows.is_empty());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        executor
            .run(&QueryBuilder::table("items").insert(json!({ "name": "a" })))
            .await
            .unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);

        let rows = executor.run(&list).await.unwrap().rows;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("a"));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_join_reads_are_evicted_by_writes_to_joined_table() {
        let (adapter, executor) = setup().await;
        for ddl in [
            "CREATE TABLE owners (id INTEGER PRIMARY KEY, name TEXT)",
            "INSERT INTO owners (id, name) VALUES (1, 'ann')",
            "INSERT INTO items (id, name) VALUES (10, 'lamp')",
            "ALTER TABLE items ADD COLUMN owner_id INTEGER",
            "UPDATE items SET owner_id = 1",
        ] {
            executor.execute(&Statement::raw(ddl)).await.unwrap();
        }
        adapter.calls.store(0, Ordering::SeqCst);

        let joined = QueryBuilder::table("items")
            .select(["items.name AS item", "owners.name AS owner"])
            .join("owners", "items.owner_id", "owners.id");
        let first = executor.run(&joined).await.unwrap();
        assert_eq!(first.rows[0]["owner"], json!("ann"));
        executor.run(&joined).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

        executor
            .run(&QueryBuilder::table("owners").set("name", "bea").where_("id", 1))
            .await
            .unwrap();
        let after = executor.run(&joined).await.unwrap();
        assert_eq!(after.rows[0]["owner"], json!("bea"));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_raw_statements_bypass_cache() {
        let (adapter, executor) = setup().await;
        let list = QueryBuilder::table("items");
        executor.run(&list).await.unwrap();

        let raw_read = Statement::raw("SELECT COUNT(*) AS count FROM items");
        executor.execute(&raw_read).await.unwrap();
        executor.execute(&raw_read).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);

        // DDL does not evict cached reads.
        executor.execute(&Statement::raw("CREATE INDEX items_name ON items (name)")).await.unwrap();
        executor.run(&list).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 4);
        assert_eq!(executor.cache().unwrap().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_failed_statements_are_not_cached() {
        let (adapter, executor) = setup().await;
        let missing = QueryBuilder::table("nope");
        assert!(executor.run(&missing).await.is_err());
        assert!(executor.run(&missing).await.is_err());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_without_cache_every_read_hits_engine() {
        let (adapter, _) = setup().await;
        let executor = CachedExecutor::new(adapter.clone());
        let list = QueryBuilder::table("items");
        executor.run(&list).await.unwrap();
        executor.run(&list).await.unwrap();
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.invalidate("items").await, 0);
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a = QueryBuilder::table("t").where_("x", 1).build_for(EngineKind::Sqlite).unwrap();
        let b = QueryBuilder::table("t").where_("x", 2).build_for(EngineKind::Sqlite).unwrap();
        let key = CachedExecutor::cache_key(&a).unwrap();
        assert!(key.starts_with("query:"));
        assert_eq!(key, CachedExecutor::cache_key(&a).unwrap());
        assert_ne!(key, CachedExecutor::cache_key(&b).unwrap());
    }
}
