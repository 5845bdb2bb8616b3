use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::error::StoreError;
use crate::geo::haversine_km;
use crate::models::driver::{Driver, DriverUpdate};
use crate::models::emergency::EmergencyAlert;
use crate::models::location::{BoundingBox, GeoPoint};
use crate::models::request::{RequestChange, RideRequest};
use crate::models::ride::{Ride, RideStatus, RideTransition};
use crate::models::surge::{SurgeArea, SurgeReading};
use crate::ports::store::{Conditional, DriverQuery, DurableStore, RideFilter};

/// DashMap-backed document store. A conditional update holds the shard write lock of
/// its record for the whole check-and-write, which makes it atomic per record.
#[derive(Default)]
pub struct MemoryStore {
    rides: DashMap<Uuid, Ride>,
    drivers: DashMap<Uuid, Driver>,
    requests: DashMap<Uuid, RideRequest>,
    surge_areas: DashMap<Uuid, SurgeArea>,
    emergencies: DashMap<Uuid, EmergencyAlert>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ride_count(&self) -> usize {
        self.rides.len()
    }

    pub fn request_count(&self) -> usize {
        self.requests.len()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn insert_ride(&self, ride: &Ride) -> Result<(), StoreError> {
        match self.rides.entry(ride.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("ride {}", ride.id))),
            Entry::Vacant(slot) => {
                slot.insert(ride.clone());
                Ok(())
            }
        }
    }

    async fn find_ride(&self, id: Uuid) -> Result<Option<Ride>, StoreError> {
        Ok(self.rides.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_ride_by_number(&self, ride_number: &str) -> Result<Option<Ride>, StoreError> {
        Ok(self
            .rides
            .iter()
            .find(|entry| entry.value().ride_number == ride_number)
            .map(|entry| entry.value().clone()))
    }

    async fn find_rides(&self, filter: &RideFilter) -> Result<Vec<Ride>, StoreError> {
        let mut rides: Vec<Ride> = self
            .rides
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        rides.sort_by_key(|ride| ride.created_at);
        Ok(rides)
    }

    async fn update_ride_if(
        &self,
        id: Uuid,
        expected: &[RideStatus],
        transition: &RideTransition,
    ) -> Result<Conditional<Ride>, StoreError> {
        let Some(mut ride) = self.rides.get_mut(&id) else {
            return Ok(Conditional::Missing);
        };

        if !expected.contains(&ride.status) {
            return Ok(Conditional::Rejected(ride.clone()));
        }

        ride.apply(transition);
        Ok(Conditional::Applied(ride.clone()))
    }

    async fn record_rating(
        &self,
        id: Uuid,
        rating: u8,
        at: DateTime<Utc>,
    ) -> Result<Conditional<Ride>, StoreError> {
        let Some(mut ride) = self.rides.get_mut(&id) else {
            return Ok(Conditional::Missing);
        };

        if !ride.can_be_rated() {
            return Ok(Conditional::Rejected(ride.clone()));
        }

        ride.rider_rating = Some(rating);
        ride.updated_at = at;
        Ok(Conditional::Applied(ride.clone()))
    }

    async fn insert_driver(&self, driver: &Driver) -> Result<(), StoreError> {
        if self
            .drivers
            .iter()
            .any(|entry| entry.value().user_id == driver.user_id)
        {
            return Err(StoreError::Duplicate(format!(
                "driver for user {}",
                driver.user_id
            )));
        }

        match self.drivers.entry(driver.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("driver {}", driver.id))),
            Entry::Vacant(slot) => {
                slot.insert(driver.clone());
                Ok(())
            }
        }
    }

    async fn find_driver(&self, id: Uuid) -> Result<Option<Driver>, StoreError> {
        Ok(self.drivers.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_driver_by_user(&self, user_id: Uuid) -> Result<Option<Driver>, StoreError> {
        Ok(self
            .drivers
            .iter()
            .find(|entry| entry.value().user_id == user_id)
            .map(|entry| entry.value().clone()))
    }

    async fn update_driver_if(
        &self,
        id: Uuid,
        expected_available: Option<bool>,
        update: &DriverUpdate,
    ) -> Result<Conditional<Driver>, StoreError> {
        let Some(mut driver) = self.drivers.get_mut(&id) else {
            return Ok(Conditional::Missing);
        };

        if expected_available.is_some_and(|expected| driver.available != expected) {
            return Ok(Conditional::Rejected(driver.clone()));
        }

        driver.apply(update);
        Ok(Conditional::Applied(driver.clone()))
    }

    async fn find_drivers_within_radius(
        &self,
        center: GeoPoint,
        radius_km: f64,
        query: &DriverQuery,
    ) -> Result<Vec<(Driver, f64)>, StoreError> {
        let mut hits: Vec<(Driver, f64)> = self
            .drivers
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .filter_map(|entry| {
                let driver = entry.value();
                let distance = haversine_km(&center, &driver.location?);
                (distance <= radius_km).then(|| (driver.clone(), distance))
            })
            .collect();

        hits.sort_by(|a, b| a.1.total_cmp(&b.1));
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn find_drivers_within_box(
        &self,
        bounds: BoundingBox,
        query: &DriverQuery,
    ) -> Result<Vec<Driver>, StoreError> {
        let mut hits: Vec<Driver> = self
            .drivers
            .iter()
            .filter(|entry| {
                let driver = entry.value();
                query.matches(driver)
                    && driver
                        .location
                        .is_some_and(|location| bounds.contains(&location))
            })
            .map(|entry| entry.value().clone())
            .collect();

        hits.sort_by_key(|driver| driver.id);
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    async fn insert_request(&self, request: &RideRequest) -> Result<(), StoreError> {
        match self.requests.entry(request.ride_id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!(
                "ride request {}",
                request.ride_id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(request.clone());
                Ok(())
            }
        }
    }

    async fn find_request(&self, ride_id: Uuid) -> Result<Option<RideRequest>, StoreError> {
        Ok(self.requests.get(&ride_id).map(|entry| entry.value().clone()))
    }

    async fn update_request(
        &self,
        ride_id: Uuid,
        change: &RequestChange,
    ) -> Result<Option<RideRequest>, StoreError> {
        Ok(self.requests.get_mut(&ride_id).map(|mut request| {
            request.apply(change);
            request.clone()
        }))
    }

    async fn find_requests_expired_at(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<RideRequest>, StoreError> {
        let mut expired: Vec<RideRequest> = self
            .requests
            .iter()
            .filter(|entry| entry.value().is_expired(at))
            .map(|entry| entry.value().clone())
            .collect();
        expired.sort_by_key(|request| request.expires_at);
        Ok(expired)
    }

    async fn delete_request(&self, ride_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.requests.remove(&ride_id).is_some())
    }

    async fn upsert_surge_area(&self, area: &SurgeArea) -> Result<(), StoreError> {
        self.surge_areas.insert(area.id, area.clone());
        Ok(())
    }

    async fn find_surge_area(&self, id: Uuid) -> Result<Option<SurgeArea>, StoreError> {
        Ok(self.surge_areas.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_surge_areas_containing(
        &self,
        point: GeoPoint,
    ) -> Result<Vec<SurgeArea>, StoreError> {
        Ok(self
            .surge_areas
            .iter()
            .filter(|entry| entry.value().bounds.contains(&point))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn update_surge_reading(
        &self,
        id: Uuid,
        reading: &SurgeReading,
    ) -> Result<Option<SurgeArea>, StoreError> {
        Ok(self.surge_areas.get_mut(&id).map(|mut area| {
            area.demand = reading.demand;
            area.supply = reading.supply;
            area.multiplier = reading.multiplier;
            area.updated_at = reading.at;
            area.clone()
        }))
    }

    async fn insert_emergency(&self, alert: &EmergencyAlert) -> Result<(), StoreError> {
        match self.emergencies.entry(alert.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("emergency {}", alert.id))),
            Entry::Vacant(slot) => {
                slot.insert(alert.clone());
                Ok(())
            }
        }
    }

    async fn find_open_emergency_for_ride(
        &self,
        ride_id: Uuid,
    ) -> Result<Option<EmergencyAlert>, StoreError> {
        Ok(self
            .emergencies
            .iter()
            .find(|entry| entry.value().ride_id == ride_id && entry.value().is_open())
            .map(|entry| entry.value().clone()))
    }

    async fn resolve_emergency(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Conditional<EmergencyAlert>, StoreError> {
        let Some(mut alert) = self.emergencies.get_mut(&id) else {
            return Ok(Conditional::Missing);
        };

        if !alert.is_open() {
            return Ok(Conditional::Rejected(alert.clone()));
        }

        alert.resolved_at = Some(at);
        Ok(Conditional::Applied(alert.clone()))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::MemoryStore;
    use crate::models::location::Location;
    use crate::models::ride::{NewRide, Ride, RideStatus, RideTransition, RideType, TripMetrics};
    use crate::ports::store::{Conditional, DurableStore, RideFilter};

    fn ride() -> Ride {
        Ride::new(
            NewRide {
                rider_id: Uuid::new_v4(),
                ride_type: RideType::Comfort,
                pickup: Location::at(40.0, -73.0),
                dropoff: Location::at(40.02, -73.01),
                waypoints: Vec::new(),
                estimated: TripMetrics {
                    distance_km: 2.5,
                    duration_secs: 400,
                    fare: 9.0,
                },
                surge_multiplier: 1.0,
                route_polyline: None,
            },
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn conditional_update_leaves_record_untouched_on_mismatch() {
        let store = MemoryStore::new();
        let ride = ride();
        store.insert_ride(&ride).await.unwrap();

        let outcome = store
            .update_ride_if(
                ride.id,
                &[RideStatus::InProgress],
                &RideTransition::Complete {
                    at: Utc::now(),
                    actual: ride.estimated,
                },
            )
            .await
            .unwrap();

        match outcome {
            Conditional::Rejected(current) => assert_eq!(current.status, RideStatus::Requested),
            other => panic!("expected rejection, got {other:?}"),
        }
        let stored = store.find_ride(ride.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RideStatus::Requested);
        assert!(stored.actual.is_none());
    }

    #[tokio::test]
    async fn conditional_update_on_unknown_ride_is_missing() {
        let store = MemoryStore::new();
        let outcome = store
            .update_ride_if(
                Uuid::new_v4(),
                &[RideStatus::Accepted],
                &RideTransition::DriverArrived { at: Utc::now() },
            )
            .await
            .unwrap();
        assert!(matches!(outcome, Conditional::Missing));
    }

    #[tokio::test]
    async fn duplicate_ride_insert_is_rejected() {
        let store = MemoryStore::new();
        let ride = ride();
        store.insert_ride(&ride).await.unwrap();
        assert!(store.insert_ride(&ride).await.is_err());
        assert_eq!(store.ride_count(), 1);
    }

    #[tokio::test]
    async fn ride_filter_matches_rider_and_status() {
        let store = MemoryStore::new();
        let first = ride();
        let second = ride();
        store.insert_ride(&first).await.unwrap();
        store.insert_ride(&second).await.unwrap();

        let found = store
            .find_rides(&RideFilter {
                rider_id: Some(first.rider_id),
                statuses: vec![RideStatus::Requested],
                ..RideFilter::default()
            })
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, first.id);
        assert_eq!(
            store
                .find_ride_by_number(&second.ride_number)
                .await
                .unwrap()
                .map(|r| r.id),
            Some(second.id)
        );
    }

    #[tokio::test]
    async fn rating_is_recorded_once_and_only_after_completion() {
        let store = MemoryStore::new();
        let mut ride = ride();
        store.insert_ride(&ride).await.unwrap();

        let early = store.record_rating(ride.id, 4, Utc::now()).await.unwrap();
        assert!(matches!(early, Conditional::Rejected(_)));

        ride.apply(&RideTransition::Assign {
            driver_id: Uuid::new_v4(),
            vehicle_id: Uuid::new_v4(),
            at: Utc::now(),
        });
        ride.apply(&RideTransition::Complete {
            at: Utc::now(),
            actual: ride.estimated,
        });
        let completed = Ride {
            id: Uuid::new_v4(),
            ..ride
        };
        store.insert_ride(&completed).await.unwrap();

        let first = store
            .record_rating(completed.id, 4, Utc::now())
            .await
            .unwrap();
        match first {
            Conditional::Applied(rated) => assert_eq!(rated.rider_rating, Some(4)),
            other => panic!("expected the rating to apply, got {other:?}"),
        }

        let second = store
            .record_rating(completed.id, 1, Utc::now())
            .await
            .unwrap();
        match second {
            Conditional::Rejected(current) => assert_eq!(current.rider_rating, Some(4)),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
