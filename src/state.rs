use std::sync::Arc;

use tokio::sync::broadcast;

use crate::adapters::{
    BroadcastNotifier, MemoryCache, MemoryStore, QueuedNotifier, StraightLineRouter,
};
use crate::config::Config;
use crate::engine::dispatch::{DispatchCoordinator, DispatchDeps};
use crate::engine::location::DriverLocationIndex;
use crate::engine::surge::SurgePricingEngine;
use crate::models::event::RideEvent;
use crate::observability::metrics::Metrics;
use crate::ports::{Cache, DurableStore, Notifier, RouteProvider};
use crate::store::RideStore;
use crate::store::cache::CacheLayer;

/// Consumed capabilities, injected once at construction.
pub struct Adapters {
    pub store: Arc<dyn DurableStore>,
    pub cache: Arc<dyn Cache>,
    pub router: Arc<dyn RouteProvider>,
    /// Extra delivery channel (push/SMS) next to the event broadcast. Delivered from a
    /// background task, so wiring one requires a running tokio runtime.
    pub notifier: Option<Arc<dyn Notifier>>,
}

pub struct AppState {
    pub dispatch: DispatchCoordinator,
    pub rides: Arc<RideStore>,
    pub ride_events_tx: broadcast::Sender<RideEvent>,
    pub metrics: Metrics,
}

impl AppState {
    /// Wires the service on in-process adapters.
    pub fn new(config: &Config) -> Self {
        Self::with_adapters(
            config,
            Adapters {
                store: Arc::new(MemoryStore::new()),
                cache: Arc::new(MemoryCache::new()),
                router: Arc::new(StraightLineRouter),
                notifier: None,
            },
        )
    }

    pub fn with_adapters(config: &Config, adapters: Adapters) -> Self {
        let metrics = Metrics::new();
        let (ride_events_tx, _unused_rx) = broadcast::channel(config.event_buffer_size);

        let cache = CacheLayer::new(adapters.cache, metrics.clone());
        let rides = Arc::new(RideStore::new(
            adapters.store.clone(),
            cache.clone(),
            config.cache.clone(),
        ));
        let locations = DriverLocationIndex::new(rides.clone(), config.location.clone());
        let surge = SurgePricingEngine::new(adapters.store, cache.clone(), config.surge.clone());

        let broadcast = BroadcastNotifier::new(ride_events_tx.clone());
        let notifier: Arc<dyn Notifier> = match adapters.notifier {
            Some(delivery) => {
                let queued = QueuedNotifier::spawn(delivery, config.event_buffer_size);
                Arc::new(FanOut(vec![Arc::new(broadcast), Arc::new(queued)]))
            }
            None => Arc::new(broadcast),
        };

        let dispatch = DispatchCoordinator::new(
            DispatchDeps {
                rides: rides.clone(),
                locations,
                surge,
                router: adapters.router,
                notifier,
                cache,
            },
            config.dispatch.clone(),
            config.cache.clone(),
            metrics.clone(),
        );

        Self {
            dispatch,
            rides,
            ride_events_tx,
            metrics,
        }
    }
}

/// Delivers each event to every inner notifier; the first failure is reported after all
/// of them have been tried.
struct FanOut(Vec<Arc<dyn Notifier>>);

#[async_trait::async_trait]
impl Notifier for FanOut {
    async fn notify(&self, event: &RideEvent) -> Result<(), crate::error::NotifyError> {
        let mut first_err = None;
        for notifier in &self.0 {
            if let Err(err) = notifier.notify(event).await {
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
