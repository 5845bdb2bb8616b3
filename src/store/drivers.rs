use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, StoreError};
use crate::models::driver::{Compliance, Driver, DriverStatus, DriverUpdate, NewDriver};
use crate::models::ride::RideStatus;
use crate::ports::store::{Conditional, RideFilter};
use crate::store::RideStore;
use crate::store::cache::keys;

impl RideStore {
    pub async fn register_driver(&self, draft: NewDriver) -> Result<Driver, AppError> {
        if draft.name.trim().is_empty() {
            return Err(AppError::Validation("name cannot be empty".to_string()));
        }
        if draft.ride_types.is_empty() {
            return Err(AppError::Validation(
                "driver must support at least one ride type".to_string(),
            ));
        }

        let now = Utc::now();
        let driver = Driver {
            id: Uuid::new_v4(),
            user_id: draft.user_id,
            name: draft.name,
            vehicle_id: draft.vehicle_id,
            ride_types: draft.ride_types,
            status: DriverStatus::Offline,
            available: false,
            location: None,
            location_updated_at: None,
            compliance: Compliance::pending(),
            rating: 0.0,
            rating_count: 0,
            completed_rides: 0,
            cancelled_rides: 0,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_driver(&driver).await.map_err(|err| match err {
            StoreError::Duplicate(what) => {
                AppError::Conflict(format!("{what} already exists"))
            }
            other => AppError::Store(other),
        })?;

        info!(driver_id = %driver.id, user_id = %driver.user_id, "driver registered");
        Ok(driver)
    }

    /// Always reads the store: dispatch decisions need the current flags and location.
    pub async fn get_driver(&self, id: Uuid) -> Result<Driver, AppError> {
        self.store
            .find_driver(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))
    }

    pub async fn get_driver_by_user(&self, user_id: Uuid) -> Result<Driver, AppError> {
        let key = keys::driver_by_user(user_id);
        if let Some(driver) = self.cache.read::<Driver>(&key).await {
            return Ok(driver);
        }

        let driver = self
            .store
            .find_driver_by_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no driver for user {user_id}")))?;

        self.cache
            .write(&key, &driver, self.ttls.driver_by_user)
            .await;
        Ok(driver)
    }

    pub async fn update_driver(&self, id: Uuid, update: DriverUpdate) -> Result<Driver, AppError> {
        if update.available == Some(true) {
            let online = match update.status {
                Some(status) => status == DriverStatus::Online,
                None => self.get_driver(id).await?.status == DriverStatus::Online,
            };
            if !online {
                return Err(AppError::Validation(format!(
                    "driver {id} must be online to become available"
                )));
            }

            // Only release_driver may reopen a driver that still holds a ride.
            let bound = self
                .store
                .find_rides(&RideFilter {
                    driver_id: Some(id),
                    statuses: RideStatus::ACTIVE.to_vec(),
                    ..RideFilter::default()
                })
                .await?;
            if let Some(ride) = bound.first() {
                return Err(AppError::Conflict(format!(
                    "driver {id} is bound to active ride {}",
                    ride.id
                )));
            }
        }

        self.update_driver_if(id, None, update).await
    }

    /// Conditional driver write keyed on the availability flag. Used to reserve a driver
    /// for exactly one ride.
    pub async fn update_driver_if(
        &self,
        id: Uuid,
        expected_available: Option<bool>,
        update: DriverUpdate,
    ) -> Result<Driver, AppError> {
        match self
            .store
            .update_driver_if(id, expected_available, &update)
            .await?
        {
            Conditional::Applied(driver) => {
                self.cache
                    .invalidate(&keys::driver_by_user(driver.user_id))
                    .await;
                Ok(driver)
            }
            Conditional::Rejected(current) => Err(AppError::Conflict(format!(
                "driver {id} availability is {}",
                current.available
            ))),
            Conditional::Missing => Err(AppError::NotFound(format!("driver {id} not found"))),
        }
    }
}
