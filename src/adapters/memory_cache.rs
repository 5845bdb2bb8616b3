use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::CacheError;
use crate::ports::cache::Cache;

/// Every this many writes, expired entries that nobody read again are swept.
const SWEEP_EVERY: u64 = 256;

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// TTL cache held in process memory. Expired entries are dropped on access and by a
/// periodic sweep on the write path.
///
/// `set_offline(true)` makes every operation fail, which is how tests exercise the
/// degraded path.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
    offline: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|entry| entry.value().is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries held in memory, expired or not.
    #[cfg(test)]
    fn stored(&self) -> usize {
        self.entries.len()
    }

    fn sweep_if_due(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY != SWEEP_EVERY - 1 {
            return;
        }
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.is_live(now));
    }

    fn ensure_online(&self) -> Result<(), CacheError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("cache is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.ensure_online()?;

        let now = Instant::now();
        let hit = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if hit {
            self.entries.remove_if(key, |_, entry| !entry.is_live(now));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.ensure_online()?;

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        self.sweep_if_due();
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.ensure_online()?;

        self.entries.remove(key);
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CacheError> {
        self.ensure_online()?;

        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| CacheEntry {
                value: "0".to_string(),
                expires_at: now + ttl,
            });
        if !entry.is_live(now) {
            entry.value = "0".to_string();
            entry.expires_at = now + ttl;
        }

        let current: i64 = entry
            .value
            .parse()
            .map_err(|_| CacheError::NotAnInteger {
                key: key.to_string(),
            })?;
        let next = current + by;
        entry.value = next.to_string();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::MemoryCache;
    use crate::ports::cache::Cache;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = MemoryCache::new();
        cache
            .set("ride:1", "{}".to_string(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(cache.get("ride:1").await.unwrap().as_deref(), Some("{}"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("ride:1").await.unwrap().is_none());
        assert!(!cache.contains("ride:1"));
    }

    #[tokio::test]
    async fn increment_starts_from_zero_and_rejects_non_integers() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);
        assert_eq!(cache.increment("demand", 1, ttl).await.unwrap(), 1);
        assert_eq!(cache.increment("demand", 2, ttl).await.unwrap(), 3);

        cache.set("name", "abc".to_string(), ttl).await.unwrap();
        assert!(cache.increment("name", 1, ttl).await.is_err());
    }

    #[tokio::test]
    async fn expired_entries_are_swept_without_being_read() {
        let cache = MemoryCache::new();
        for i in 0..super::SWEEP_EVERY - 1 {
            cache
                .set(&format!("ride:{i}"), "{}".to_string(), Duration::ZERO)
                .await
                .unwrap();
        }
        assert_eq!(cache.stored(), super::SWEEP_EVERY as usize - 1);
        assert!(cache.is_empty());

        cache
            .set("ride:live", "{}".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.stored(), 1);
        assert!(cache.contains("ride:live"));
    }

    #[tokio::test]
    async fn offline_cache_fails_every_operation() {
        let cache = MemoryCache::new();
        cache.set_offline(true);
        let ttl = Duration::from_secs(1);
        assert!(cache.get("k").await.is_err());
        assert!(cache.set("k", "v".to_string(), ttl).await.is_err());
        assert!(cache.delete("k").await.is_err());
        assert!(cache.increment("k", 1, ttl).await.is_err());
    }
}
