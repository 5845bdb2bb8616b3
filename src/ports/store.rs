use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::driver::{Driver, DriverStatus, DriverUpdate};
use crate::models::emergency::EmergencyAlert;
use crate::models::location::{BoundingBox, GeoPoint};
use crate::models::request::{RequestChange, RideRequest};
use crate::models::ride::{Ride, RideStatus, RideTransition, RideType};
use crate::models::surge::{SurgeArea, SurgeReading};

/// Outcome of a conditional (compare-and-swap) update on a single record.
#[derive(Debug, Clone)]
pub enum Conditional<T> {
    /// Precondition held; carries the record as written.
    Applied(T),
    /// Precondition failed; carries the record as it currently stands, untouched.
    Rejected(T),
    Missing,
}

#[derive(Debug, Clone, Default)]
pub struct RideFilter {
    pub rider_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    /// Empty means any status.
    pub statuses: Vec<RideStatus>,
    pub pickup_within: Option<BoundingBox>,
}

impl RideFilter {
    pub fn matches(&self, ride: &Ride) -> bool {
        self.rider_id.is_none_or(|id| ride.rider_id == id)
            && self.driver_id.is_none_or(|id| ride.driver_id == Some(id))
            && (self.statuses.is_empty() || self.statuses.contains(&ride.status))
            && self
                .pickup_within
                .is_none_or(|bounds| bounds.contains(&ride.pickup.point))
    }
}

/// Driver filter predicate evaluated by the store before any radius/limit is applied.
#[derive(Debug, Clone, Default)]
pub struct DriverQuery {
    pub status: Option<DriverStatus>,
    pub available: Option<bool>,
    pub compliance_cleared: bool,
    pub updated_since: Option<DateTime<Utc>>,
    pub ride_type: Option<RideType>,
    pub exclude: Vec<Uuid>,
    pub limit: Option<usize>,
}

impl DriverQuery {
    pub fn matches(&self, driver: &Driver) -> bool {
        self.status.is_none_or(|status| driver.status == status)
            && self.available.is_none_or(|available| driver.available == available)
            && (!self.compliance_cleared || driver.compliance.is_cleared())
            && self.updated_since.is_none_or(|since| {
                driver
                    .location_updated_at
                    .is_some_and(|updated| updated >= since)
            })
            && self
                .ride_type
                .is_none_or(|ride_type| driver.supports(ride_type))
            && !self.exclude.contains(&driver.id)
    }
}

/// Per-entity document collections with filter, conditional-update and geospatial
/// primitives. Every update is atomic for a single record; there are no cross-record
/// transactions.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn insert_ride(&self, ride: &Ride) -> Result<(), StoreError>;

    async fn find_ride(&self, id: Uuid) -> Result<Option<Ride>, StoreError>;

    async fn find_ride_by_number(&self, ride_number: &str) -> Result<Option<Ride>, StoreError>;

    async fn find_rides(&self, filter: &RideFilter) -> Result<Vec<Ride>, StoreError>;

    /// Applies `transition` only if the ride's current status is one of `expected`.
    async fn update_ride_if(
        &self,
        id: Uuid,
        expected: &[RideStatus],
        transition: &RideTransition,
    ) -> Result<Conditional<Ride>, StoreError>;

    /// Stores the rider's rating only if the ride is completed and not yet rated.
    async fn record_rating(
        &self,
        id: Uuid,
        rating: u8,
        at: DateTime<Utc>,
    ) -> Result<Conditional<Ride>, StoreError>;

    async fn insert_driver(&self, driver: &Driver) -> Result<(), StoreError>;

    async fn find_driver(&self, id: Uuid) -> Result<Option<Driver>, StoreError>;

    async fn find_driver_by_user(&self, user_id: Uuid) -> Result<Option<Driver>, StoreError>;

    /// Applies `update` if `expected_available` is `None` or matches the stored flag.
    async fn update_driver_if(
        &self,
        id: Uuid,
        expected_available: Option<bool>,
        update: &DriverUpdate,
    ) -> Result<Conditional<Driver>, StoreError>;

    /// Drivers matching `query` within `radius_km` of `center`, nearest first, paired with
    /// their distance in km. `query.limit` is applied after sorting.
    async fn find_drivers_within_radius(
        &self,
        center: GeoPoint,
        radius_km: f64,
        query: &DriverQuery,
    ) -> Result<Vec<(Driver, f64)>, StoreError>;

    async fn find_drivers_within_box(
        &self,
        bounds: BoundingBox,
        query: &DriverQuery,
    ) -> Result<Vec<Driver>, StoreError>;

    async fn insert_request(&self, request: &RideRequest) -> Result<(), StoreError>;

    async fn find_request(&self, ride_id: Uuid) -> Result<Option<RideRequest>, StoreError>;

    async fn update_request(
        &self,
        ride_id: Uuid,
        change: &RequestChange,
    ) -> Result<Option<RideRequest>, StoreError>;

    async fn find_requests_expired_at(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<RideRequest>, StoreError>;

    /// Returns whether a request was removed.
    async fn delete_request(&self, ride_id: Uuid) -> Result<bool, StoreError>;

    async fn upsert_surge_area(&self, area: &SurgeArea) -> Result<(), StoreError>;

    async fn find_surge_area(&self, id: Uuid) -> Result<Option<SurgeArea>, StoreError>;

    async fn find_surge_areas_containing(
        &self,
        point: GeoPoint,
    ) -> Result<Vec<SurgeArea>, StoreError>;

    async fn update_surge_reading(
        &self,
        id: Uuid,
        reading: &SurgeReading,
    ) -> Result<Option<SurgeArea>, StoreError>;

    async fn insert_emergency(&self, alert: &EmergencyAlert) -> Result<(), StoreError>;

    async fn find_open_emergency_for_ride(
        &self,
        ride_id: Uuid,
    ) -> Result<Option<EmergencyAlert>, StoreError>;

    /// Sets `resolved_at` only if the alert is still open.
    async fn resolve_emergency(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Conditional<EmergencyAlert>, StoreError>;
}
