use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::config::LocationConfig;
use crate::error::AppError;
use crate::models::driver::{Driver, DriverStatus, DriverUpdate, LocationFix};
use crate::models::location::{BoundingBox, GeoPoint};
use crate::models::ride::RideType;
use crate::ports::store::DriverQuery;
use crate::store::RideStore;

#[derive(Debug, Clone, Serialize)]
pub struct NearbyDriver {
    #[serde(flatten)]
    pub driver: Driver,
    pub distance_km: f64,
}

/// Geospatial driver lookup restricted to drivers that could take a ride right now.
#[derive(Clone)]
pub struct DriverLocationIndex {
    rides: Arc<RideStore>,
    config: LocationConfig,
}

impl DriverLocationIndex {
    pub fn new(rides: Arc<RideStore>, config: LocationConfig) -> Self {
        Self { rides, config }
    }

    pub fn freshness(&self) -> Duration {
        Duration::seconds(self.config.freshness_secs)
    }

    pub async fn update_location(
        &self,
        driver_id: Uuid,
        location: GeoPoint,
    ) -> Result<Driver, AppError> {
        location.validate("location")?;

        let at = Utc::now();
        let update = DriverUpdate {
            location: Some(LocationFix { point: location, at }),
            ..DriverUpdate::at(at)
        };
        self.rides.update_driver(driver_id, update).await
    }

    /// Eligible drivers within `radius_km`, nearest first, at most `nearby_cap` of them.
    /// An empty result is a normal outcome.
    pub async fn get_nearby_drivers(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        ride_type: Option<RideType>,
    ) -> Result<Vec<NearbyDriver>, AppError> {
        self.nearby_excluding(GeoPoint::new(lat, lng), radius_km, ride_type, &[])
            .await
    }

    pub async fn nearby_excluding(
        &self,
        center: GeoPoint,
        radius_km: f64,
        ride_type: Option<RideType>,
        exclude: &[Uuid],
    ) -> Result<Vec<NearbyDriver>, AppError> {
        center.validate("query point")?;
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(AppError::Validation(format!(
                "radius must be a positive number of km, got {radius_km}"
            )));
        }

        let now = Utc::now();
        let query = DriverQuery {
            ride_type,
            exclude: exclude.to_vec(),
            limit: Some(self.config.nearby_cap),
            ..self.eligibility(now)
        };

        let hits = self
            .rides
            .durable()
            .find_drivers_within_radius(center, radius_km, &query)
            .await?;

        debug!(
            lat = center.lat,
            lng = center.lng,
            radius_km,
            found = hits.len(),
            "nearby driver query"
        );

        Ok(hits
            .into_iter()
            .map(|(driver, distance_km)| NearbyDriver {
                driver,
                distance_km,
            })
            .collect())
    }

    /// Bounding-box analogue of the nearby query, for area-wide views (surge supply,
    /// emergency response). Same eligibility filter, no distance ordering, no cap.
    pub async fn get_drivers_in_area(&self, bounds: BoundingBox) -> Result<Vec<Driver>, AppError> {
        bounds.validate()?;

        let query = self.eligibility(Utc::now());
        Ok(self
            .rides
            .durable()
            .find_drivers_within_box(bounds, &query)
            .await?)
    }

    fn eligibility(&self, now: DateTime<Utc>) -> DriverQuery {
        DriverQuery {
            status: Some(DriverStatus::Online),
            available: Some(true),
            compliance_cleared: true,
            updated_since: Some(now - self.freshness()),
            ..DriverQuery::default()
        }
    }
}
