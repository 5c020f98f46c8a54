use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Remote key/value store seam behind [`super::CacheLayer`].
///
/// A networked client plugs in here; errors are reported with `anyhow` and
/// never escape the layer.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    /// Returns how many of `keys` existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    async fn add_to_set(&self, set_key: &str, member: &str, ttl: Duration) -> Result<()>;
    async fn set_members(&self, set_key: &str) -> Result<Vec<String>>;
    async fn ping(&self) -> Result<()>;

    /// Approximate number of live entries, when the store can tell cheaply.
    fn entry_count(&self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone)]
enum Stored {
    Bytes(Arc<Vec<u8>>),
    Members(Arc<BTreeSet<String>>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Stored,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, Entry> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Entry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process backend on a moka future cache.
pub struct MokaBackend {
    cache: Cache<String, Entry>,
    // Serializes read-modify-write on member sets.
    set_lock: Mutex<()>,
}

impl MokaBackend {
    pub fn new(max_entries: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            cache,
            set_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl CacheBackend for MokaBackend {
    fn name(&self) -> &str {
        "moka"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(match self.cache.get(key).await {
            Some(Entry { value: Stored::Bytes(b), .. }) => Some(b.as_ref().clone()),
            _ => None,
        })
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let entry = Entry {
            value: Stored::Bytes(Arc::new(value)),
            ttl,
        };
        self.cache.insert(key.to_string(), entry).await;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.cache.remove(key).await.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn add_to_set(&self, set_key: &str, member: &str, ttl: Duration) -> Result<()> {
        let _guard = self.set_lock.lock().await;
        let mut members = match self.cache.get(set_key).await {
            Some(Entry { value: Stored::Members(m), .. }) => m.as_ref().clone(),
            _ => BTreeSet::new(),
        };
        members.insert(member.to_string());
        let entry = Entry {
            value: Stored::Members(Arc::new(members)),
            ttl,
        };
        self.cache.insert(set_key.to_string(), entry).await;
        Ok(())
    }

    async fn set_members(&self, set_key: &str) -> Result<Vec<String>> {
        Ok(match self.cache.get(set_key).await {
            Some(Entry { value: Stored::Members(m), .. }) => m.iter().cloned().collect(),
            _ => Vec::new(),
        })
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn entry_count(&self) -> Option<u64> {
        Some(self.cache.entry_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_moka_backend_basics() {
        let backend = MokaBackend::new(100);
        let ttl = Duration::from_secs(60);

        backend.set("k", b"v".to_vec(), ttl).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v".to_vec()));

        backend.add_to_set("tag", "k", ttl).await.unwrap();
        backend.add_to_set("tag", "j", ttl).await.unwrap();
        backend.add_to_set("tag", "k", ttl).await.unwrap();
        assert_eq!(backend.set_members("tag").await.unwrap(), vec!["j".to_string(), "k".to_string()]);
        // A member set is not a byte value.
        assert_eq!(backend.get("tag").await.unwrap(), None);

        let removed = backend.delete(&["k".to_string(), "missing".to_string()]).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(backend.get("k").await.unwrap(), None);

        backend.cache.run_pending_tasks().await;
        assert_eq!(backend.entry_count(), Some(1));
    }

    #[tokio::test]
    async fn test_moka_entries_expire_individually() {
        let backend = MokaBackend::new(100);
        backend.set("short", b"1".to_vec(), Duration::from_millis(50)).await.unwrap();
        backend.set("long", b"2".to_vec(), Duration::from_secs(60)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(backend.get("short").await.unwrap(), None);
        assert_eq!(backend.get("long").await.unwrap(), Some(b"2".to_vec()));
    }
}
