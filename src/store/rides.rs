use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::ride::{
    CancellationActor, NewRide, Ride, RideStatus, RideTransition, TripMetrics,
};
use crate::ports::store::{Conditional, RideFilter};
use crate::store::RideStore;
use crate::store::cache::keys;

impl RideStore {
    pub async fn create(&self, draft: NewRide) -> Result<Ride, AppError> {
        let ride = Ride::new(draft, Utc::now());
        self.store.insert_ride(&ride).await?;

        info!(ride_id = %ride.id, ride_number = %ride.ride_number, "ride created");
        Ok(ride)
    }

    /// Cache first; on a miss reads the store and caches the record only while it is in
    /// a non-terminal status.
    pub async fn get_by_id(&self, id: Uuid) -> Result<Ride, AppError> {
        if let Some(ride) = self.cache.read::<Ride>(&keys::ride(id)).await {
            return Ok(ride);
        }

        let ride = self
            .store
            .find_ride(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ride {id} not found")))?;

        self.populate(&ride).await;
        Ok(ride)
    }

    pub async fn get_by_number(&self, ride_number: &str) -> Result<Ride, AppError> {
        if let Some(ride) = self.cache.read::<Ride>(&keys::ride_number(ride_number)).await {
            return Ok(ride);
        }

        let ride = self
            .store
            .find_ride_by_number(ride_number)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ride {ride_number} not found")))?;

        self.populate(&ride).await;
        Ok(ride)
    }

    pub async fn rides_for_rider(&self, rider_id: Uuid) -> Result<Vec<Ride>, AppError> {
        let filter = RideFilter {
            rider_id: Some(rider_id),
            ..RideFilter::default()
        };
        Ok(self.store.find_rides(&filter).await?)
    }

    pub async fn find_rides(&self, filter: &RideFilter) -> Result<Vec<Ride>, AppError> {
        Ok(self.store.find_rides(filter).await?)
    }

    pub async fn assign_driver(
        &self,
        id: Uuid,
        driver_id: Uuid,
        vehicle_id: Uuid,
    ) -> Result<Ride, AppError> {
        self.transition(
            id,
            RideTransition::Assign {
                driver_id,
                vehicle_id,
                at: Utc::now(),
            },
        )
        .await
    }

    pub async fn mark_driver_arrived(&self, id: Uuid) -> Result<Ride, AppError> {
        self.transition(id, RideTransition::DriverArrived { at: Utc::now() })
            .await
    }

    pub async fn start_ride(&self, id: Uuid) -> Result<Ride, AppError> {
        self.transition(id, RideTransition::Start { at: Utc::now() })
            .await
    }

    pub async fn complete_ride(&self, id: Uuid, actual: TripMetrics) -> Result<Ride, AppError> {
        self.transition(
            id,
            RideTransition::Complete {
                at: Utc::now(),
                actual,
            },
        )
        .await
    }

    pub async fn cancel_ride(
        &self,
        id: Uuid,
        reason: String,
        actor: CancellationActor,
    ) -> Result<Ride, AppError> {
        self.transition(
            id,
            RideTransition::Cancel {
                at: Utc::now(),
                reason,
                actor,
            },
        )
        .await
    }

    /// Cancels only while no driver has been bound yet. Used for expiry, where losing to a
    /// concurrent acceptance must leave the accepted ride alone.
    pub async fn cancel_unassigned(
        &self,
        id: Uuid,
        reason: String,
        actor: CancellationActor,
    ) -> Result<Ride, AppError> {
        let transition = RideTransition::Cancel {
            at: Utc::now(),
            reason,
            actor,
        };
        self.transition_from(id, &[RideStatus::Requested], transition)
            .await
    }

    pub async fn record_rating(&self, id: Uuid, rating: u8) -> Result<Ride, AppError> {
        match self.store.record_rating(id, rating, Utc::now()).await? {
            Conditional::Applied(ride) => {
                self.cache.invalidate_ride(ride.id).await;
                info!(ride_id = %ride.id, rating, "ride rated");
                Ok(ride)
            }
            Conditional::Rejected(current) if current.rider_rating.is_some() => Err(
                AppError::Conflict(format!("ride {id} has already been rated")),
            ),
            Conditional::Rejected(current) => Err(AppError::Conflict(format!(
                "ride {id} is {}; only completed rides can be rated",
                current.status
            ))),
            Conditional::Missing => Err(AppError::NotFound(format!("ride {id} not found"))),
        }
    }

    async fn transition(&self, id: Uuid, transition: RideTransition) -> Result<Ride, AppError> {
        self.transition_from(id, transition.allowed_from(), transition)
            .await
    }

    async fn transition_from(
        &self,
        id: Uuid,
        expected: &[RideStatus],
        transition: RideTransition,
    ) -> Result<Ride, AppError> {
        let target = transition.target();
        let outcome = self.store.update_ride_if(id, expected, &transition).await?;

        match outcome {
            Conditional::Applied(ride) => {
                self.cache.invalidate_ride(ride.id).await;
                info!(ride_id = %ride.id, status = %ride.status, "ride status updated");
                Ok(ride)
            }
            Conditional::Rejected(current) => {
                warn!(
                    ride_id = %id,
                    current = %current.status,
                    target = %target,
                    "ride transition rejected"
                );
                Err(AppError::Conflict(format!(
                    "ride {id} is {}; cannot move to {target}",
                    current.status
                )))
            }
            Conditional::Missing => Err(AppError::NotFound(format!("ride {id} not found"))),
        }
    }

    async fn populate(&self, ride: &Ride) {
        if ride.status.is_terminal() {
            return;
        }
        let ttl = self.ttls.ride;
        self.cache.write(&keys::ride(ride.id), ride, ttl).await;
        self.cache
            .write(&keys::ride_number(&ride.ride_number), ride, ttl)
            .await;
    }
}
