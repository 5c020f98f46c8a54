use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Slot {
    Bytes(Vec<u8>),
    Members(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct LocalEntry {
    slot: Slot,
    expires_at: Instant,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Process-local stand-in used while the cache backend is failing.
///
/// Owns the only background task of the cache: a sweep that drops expired
/// entries every `sweep_interval`. The task stops on `shutdown()` or when
/// the cache is dropped.
pub struct FallbackCache {
    entries: Arc<DashMap<String, LocalEntry>>,
    max_entries: usize,
    shutdown: Arc<Notify>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackCache {
    /// Must be called inside a tokio runtime.
    pub fn new(sweep_interval: Duration, max_entries: usize) -> Self {
        let entries: Arc<DashMap<String, LocalEntry>> = Arc::new(DashMap::new());
        let shutdown = Arc::new(Notify::new());

        let entries_clone = entries.clone();
        let shutdown_clone = shutdown.clone();
        let sweep_task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval.max(Duration::from_millis(10)));
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = Self::sweep_map(&entries_clone);
                        if removed > 0 {
                            tracing::debug!("Fallback cache sweep removed {} expired entries", removed);
                        }
                    }
                    _ = shutdown_clone.notified() => {
                        tracing::debug!("Fallback cache sweep task stopping");
                        break;
                    }
                }
            }
        });

        Self {
            entries,
            max_entries: max_entries.max(1),
            shutdown,
            sweep_task: Mutex::new(Some(sweep_task)),
        }
    }

    fn sweep_map(entries: &DashMap<String, LocalEntry>) -> usize {
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before.saturating_sub(entries.len())
    }

    /// Drop expired entries now; returns how many were removed.
    pub fn sweep(&self) -> usize {
        Self::sweep_map(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_running(&self) -> bool {
        match self.sweep_task.lock() {
            Ok(task) => task.as_ref().map(|t| !t.is_finished()).unwrap_or(false),
            Err(_) => false,
        }
    }

    fn stop_sweeper(&self) {
        self.shutdown.notify_one();
        if let Ok(mut task) = self.sweep_task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }

    fn live(&self, key: &str) -> Option<LocalEntry> {
        let entry = self.entries.get(key)?.clone();
        if entry.is_expired(Instant::now()) {
            self.entries.remove(key);
            return None;
        }
        Some(entry)
    }

    fn insert(&self, key: &str, slot: Slot, ttl: Duration) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.sweep();
            if self.entries.len() >= self.max_entries {
                // Evict whatever expires soonest.
                let victim = self
                    .entries
                    .iter()
                    .min_by_key(|e| e.value().expires_at)
                    .map(|e| e.key().clone());
                if let Some(victim) = victim {
                    self.entries.remove(&victim);
                }
            }
        }
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                slot,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self.live(key)?.slot {
            Slot::Bytes(b) => Some(b),
            Slot::Members(_) => None,
        }
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.insert(key, Slot::Bytes(value), ttl);
    }

    pub fn delete(&self, keys: &[String]) -> u64 {
        keys.iter().filter(|k| self.entries.remove(k.as_str()).is_some()).count() as u64
    }

    pub fn add_to_set(&self, set_key: &str, member: &str, ttl: Duration) {
        let mut members = match self.live(set_key).map(|e| e.slot) {
            Some(Slot::Members(m)) => m,
            _ => BTreeSet::new(),
        };
        members.insert(member.to_string());
        self.insert(set_key, Slot::Members(members), ttl);
    }

    pub fn set_members(&self, set_key: &str) -> Vec<String> {
        match self.live(set_key).map(|e| e.slot) {
            Some(Slot::Members(m)) => m.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Stop the sweep task and drop all entries.
    pub fn shutdown(&self) {
        self.stop_sweeper();
        self.clear();
    }
}

impl Drop for FallbackCache {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_and_sweep() {
        let cache = FallbackCache::new(Duration::from_secs(60), 100);
        cache.set("a", b"1".to_vec(), Duration::from_secs(10));
        cache.set("b", b"2".to_vec(), Duration::from_secs(600));
        assert_eq!(cache.get("a"), Some(b"1".to_vec()));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(b"2".to_vec()));

        cache.set("c", b"3".to_vec(), Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(61)).await;
        // The periodic sweep has removed "c" without anyone reading it.
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_soonest_expiring() {
        let cache = FallbackCache::new(Duration::from_secs(60), 2);
        cache.set("soon", b"1".to_vec(), Duration::from_secs(1));
        cache.set("late", b"2".to_vec(), Duration::from_secs(100));
        cache.set("new", b"3".to_vec(), Duration::from_secs(50));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("soon"), None);
        assert!(cache.get("late").is_some());
    }

    #[tokio::test]
    async fn test_sets_and_shutdown() {
        let cache = FallbackCache::new(Duration::from_secs(60), 100);
        cache.add_to_set("tag", "k1", Duration::from_secs(60));
        cache.add_to_set("tag", "k2", Duration::from_secs(60));
        assert_eq!(cache.set_members("tag"), vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(cache.delete(&["tag".to_string()]), 1);

        assert!(cache.is_running());
        cache.shutdown();
        assert!(!cache.is_running());
        assert!(cache.is_empty());
    }
}
