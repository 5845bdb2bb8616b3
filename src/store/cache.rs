//! Read-through / write-invalidate policy shared by everything that caches records.
//!
//! Cache failures stop here: they are logged, counted and turned into a miss or a no-op.
//! Secondary keys (ride number) are written next to the primary key on read but are
//! not cleared when the primary key is invalidated, so they may serve a stale copy
//! until their TTL runs out.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::CacheError;
use crate::observability::metrics::Metrics;
use crate::ports::cache::Cache;

pub mod keys {
    use uuid::Uuid;

    pub fn ride(id: Uuid) -> String {
        format!("ride:{id}")
    }

    pub fn ride_number(ride_number: &str) -> String {
        format!("ride:number:{ride_number}")
    }

    pub fn driver_by_user(user_id: Uuid) -> String {
        format!("driver:user:{user_id}")
    }

    pub fn emergency_for_ride(ride_id: Uuid) -> String {
        format!("emergency:ride:{ride_id}")
    }

    pub fn surge_demand(area_id: Uuid) -> String {
        format!("surge:demand:{area_id}")
    }
}

#[derive(Clone)]
pub struct CacheLayer {
    cache: Arc<dyn Cache>,
    metrics: Metrics,
}

impl CacheLayer {
    pub fn new(cache: Arc<dyn Cache>, metrics: Metrics) -> Self {
        Self { cache, metrics }
    }

    pub async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.cache.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!(key, "cache miss");
                return None;
            }
            Err(err) => {
                self.swallow("get", key, &err);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => {
                debug!(key, "cache hit");
                Some(value)
            }
            Err(err) => {
                warn!(key, error = %err, "discarding undecodable cache entry");
                self.invalidate(key).await;
                None
            }
        }
    }

    pub async fn write<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(err) => {
                self.swallow("set", key, &CacheError::Encode(err.to_string()));
                return;
            }
        };

        if let Err(err) = self.cache.set(key, raw, ttl).await {
            self.swallow("set", key, &err);
        }
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(err) = self.cache.delete(key).await {
            self.swallow("delete", key, &err);
        }
    }

    /// Increments a counter; `None` when the cache could not be reached.
    pub async fn bump(&self, key: &str, by: i64, ttl: Duration) -> Option<i64> {
        match self.cache.increment(key, by, ttl).await {
            Ok(value) => Some(value),
            Err(err) => {
                self.swallow("increment", key, &err);
                None
            }
        }
    }

    pub async fn invalidate_ride(&self, ride_id: Uuid) {
        self.invalidate(&keys::ride(ride_id)).await;
    }

    fn swallow(&self, op: &str, key: &str, err: &CacheError) {
        self.metrics.cache_failures_total.with_label_values(&[op]).inc();
        warn!(op, key, error = %err, "cache operation failed; continuing without cache");
    }
}
