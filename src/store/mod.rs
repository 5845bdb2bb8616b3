//! Persistence for rides and drivers. `RideStore` is the only writer of those records
//! and the only component that populates or invalidates their cache entries.

pub mod cache;
mod drivers;
mod rides;

use std::sync::Arc;

use crate::config::CacheTtls;
use crate::ports::store::DurableStore;
use crate::store::cache::CacheLayer;

pub struct RideStore {
    store: Arc<dyn DurableStore>,
    cache: CacheLayer,
    ttls: CacheTtls,
}

impl RideStore {
    pub fn new(store: Arc<dyn DurableStore>, cache: CacheLayer, ttls: CacheTtls) -> Self {
        Self { store, cache, ttls }
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.store
    }
}
