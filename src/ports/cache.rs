use std::time::Duration;

use async_trait::async_trait;

use crate::error::CacheError;

/// Best-effort key/value cache with per-key TTL. Values are opaque strings.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Adds `by` to an integer value, creating it at zero with `ttl` if absent.
    async fn increment(&self, key: &str, by: i64, ttl: Duration) -> Result<i64, CacheError>;
}
