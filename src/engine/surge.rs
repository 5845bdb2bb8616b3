use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::config::SurgeConfig;
use crate::error::AppError;
use crate::models::location::{BoundingBox, GeoPoint};
use crate::models::surge::{SurgeArea, SurgeReading};
use crate::ports::store::DurableStore;
use crate::store::cache::{CacheLayer, keys};

/// Demand counters roll over after this long without a refresh.
const DEMAND_WINDOW: StdDuration = StdDuration::from_secs(15 * 60);

#[derive(Debug, Clone, Deserialize)]
pub struct NewSurgeArea {
    pub name: String,
    pub bounds: BoundingBox,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

/// Higher demand:supply ratio means a higher multiplier, clamped to `[1.0, max]` and
/// rounded to one decimal. Demand with zero supply pins the multiplier at `max`.
pub fn multiplier_for(demand: u32, supply: u32, max_multiplier: f64) -> f64 {
    if demand == 0 {
        return 1.0;
    }
    if supply == 0 {
        return max_multiplier;
    }
    let ratio = f64::from(demand) / f64::from(supply);
    let rounded = (ratio * 10.0).round() / 10.0;
    rounded.clamp(1.0, max_multiplier)
}

#[derive(Clone)]
pub struct SurgePricingEngine {
    store: Arc<dyn DurableStore>,
    cache: CacheLayer,
    config: SurgeConfig,
}

impl SurgePricingEngine {
    pub fn new(store: Arc<dyn DurableStore>, cache: CacheLayer, config: SurgeConfig) -> Self {
        Self {
            store,
            cache,
            config,
        }
    }

    pub async fn define_area(&self, draft: NewSurgeArea) -> Result<SurgeArea, AppError> {
        if draft.name.trim().is_empty() {
            return Err(AppError::Validation("area name cannot be empty".to_string()));
        }
        draft.bounds.validate()?;

        let now = Utc::now();
        let starts_at = draft.starts_at.unwrap_or(now);
        if draft.ends_at.is_some_and(|end| end <= starts_at) {
            return Err(AppError::Validation(
                "surge window must end after it starts".to_string(),
            ));
        }

        let area = SurgeArea {
            id: Uuid::new_v4(),
            name: draft.name,
            bounds: draft.bounds,
            multiplier: 1.0,
            demand: 0,
            supply: 0,
            starts_at,
            ends_at: draft.ends_at,
            updated_at: now,
        };
        self.store.upsert_surge_area(&area).await?;

        info!(area_id = %area.id, name = %area.name, "surge area defined");
        Ok(area)
    }

    pub async fn get_area(&self, id: Uuid) -> Result<SurgeArea, AppError> {
        self.store
            .find_surge_area(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("surge area {id} not found")))
    }

    /// Multiplier in force at `point` and `at`: the highest among active areas covering
    /// the point, or 1.0 when none does.
    pub async fn multiplier_at(&self, point: GeoPoint, at: DateTime<Utc>) -> Result<f64, AppError> {
        let areas = self.store.find_surge_areas_containing(point).await?;
        Ok(areas
            .iter()
            .filter(|area| area.applies_to(&point, at))
            .map(|area| area.multiplier)
            .fold(1.0, f64::max))
    }

    pub async fn record_demand(&self, point: GeoPoint, at: DateTime<Utc>) -> Result<(), AppError> {
        let areas = self.store.find_surge_areas_containing(point).await?;
        for area in areas.iter().filter(|area| area.applies_to(&point, at)) {
            self.cache
                .bump(&keys::surge_demand(area.id), 1, DEMAND_WINDOW)
                .await;
        }
        Ok(())
    }

    /// Demand counted in the current window, or `None` if the counter is unreachable.
    pub async fn counted_demand(&self, area_id: Uuid) -> Option<u32> {
        self.cache
            .bump(&keys::surge_demand(area_id), 0, DEMAND_WINDOW)
            .await
            .map(|count| u32::try_from(count.max(0)).unwrap_or(u32::MAX))
    }

    pub async fn apply_reading(
        &self,
        area_id: Uuid,
        demand: u32,
        supply: u32,
    ) -> Result<SurgeArea, AppError> {
        let reading = SurgeReading {
            demand,
            supply,
            multiplier: multiplier_for(demand, supply, self.config.max_multiplier),
            at: Utc::now(),
        };

        let area = self
            .store
            .update_surge_reading(area_id, &reading)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("surge area {area_id} not found")))?;

        info!(
            area_id = %area.id,
            demand,
            supply,
            multiplier = area.multiplier,
            "surge multiplier updated"
        );
        Ok(area)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};

    use super::{NewSurgeArea, SurgePricingEngine, multiplier_for};
    use crate::adapters::{MemoryCache, MemoryStore};
    use crate::config::SurgeConfig;
    use crate::models::location::{BoundingBox, GeoPoint};
    use crate::observability::metrics::Metrics;
    use crate::store::cache::CacheLayer;

    fn engine() -> SurgePricingEngine {
        SurgePricingEngine::new(
            Arc::new(MemoryStore::new()),
            CacheLayer::new(Arc::new(MemoryCache::new()), Metrics::new()),
            SurgeConfig::default(),
        )
    }

    fn downtown() -> BoundingBox {
        BoundingBox {
            min_lat: 39.9,
            min_lng: -73.1,
            max_lat: 40.1,
            max_lng: -72.9,
        }
    }

    #[test]
    fn multiplier_rises_with_demand_and_is_clamped() {
        assert_eq!(multiplier_for(0, 10, 5.0), 1.0);
        assert_eq!(multiplier_for(5, 10, 5.0), 1.0);
        assert_eq!(multiplier_for(15, 10, 5.0), 1.5);
        assert_eq!(multiplier_for(80, 10, 5.0), 5.0);
        assert_eq!(multiplier_for(3, 0, 5.0), 5.0);
    }

    #[tokio::test]
    async fn active_area_applies_only_inside_its_window() {
        let engine = engine();
        let now = Utc::now();
        let area = engine
            .define_area(NewSurgeArea {
                name: "downtown".to_string(),
                bounds: downtown(),
                starts_at: Some(now - Duration::minutes(5)),
                ends_at: Some(now + Duration::minutes(30)),
            })
            .await
            .unwrap();
        engine.apply_reading(area.id, 20, 10).await.unwrap();

        let inside = GeoPoint::new(40.0, -73.0);
        assert_eq!(engine.multiplier_at(inside, now).await.unwrap(), 2.0);
        assert_eq!(
            engine
                .multiplier_at(inside, now + Duration::hours(1))
                .await
                .unwrap(),
            1.0
        );
        assert_eq!(
            engine
                .multiplier_at(GeoPoint::new(41.0, -73.0), now)
                .await
                .unwrap(),
            1.0
        );
    }

    #[tokio::test]
    async fn demand_is_counted_per_active_area() {
        let engine = engine();
        let area = engine
            .define_area(NewSurgeArea {
                name: "downtown".to_string(),
                bounds: downtown(),
                starts_at: None,
                ends_at: None,
            })
            .await
            .unwrap();

        let now = Utc::now();
        engine.record_demand(GeoPoint::new(40.0, -73.0), now).await.unwrap();
        engine.record_demand(GeoPoint::new(40.05, -73.0), now).await.unwrap();
        engine.record_demand(GeoPoint::new(45.0, -73.0), now).await.unwrap();

        assert_eq!(engine.counted_demand(area.id).await, Some(2));
    }

    #[tokio::test]
    async fn inverted_window_is_rejected() {
        let engine = engine();
        let now = Utc::now();
        let result = engine
            .define_area(NewSurgeArea {
                name: "stadium".to_string(),
                bounds: downtown(),
                starts_at: Some(now),
                ends_at: Some(now - Duration::minutes(1)),
            })
            .await;
        assert!(result.is_err());
    }
}
