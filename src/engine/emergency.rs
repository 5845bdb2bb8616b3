use chrono::Utc;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::dispatch::DispatchCoordinator;
use crate::error::AppError;
use crate::geo::bounding_box_around;
use crate::models::emergency::EmergencyAlert;
use crate::models::event::{RideEvent, RideEventKind};
use crate::models::location::GeoPoint;
use crate::ports::store::Conditional;
use crate::store::cache::keys;

const RESPONSE_RADIUS_KM: f64 = 3.0;

#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyInput {
    pub raised_by: Uuid,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub message: Option<String>,
}

impl DispatchCoordinator {
    /// Opens an alert on a ride that has a driver bound and is not finished. Captures the
    /// dispatchable drivers around the reported location for responders.
    pub async fn raise_emergency(
        &self,
        ride_id: Uuid,
        input: EmergencyInput,
    ) -> Result<EmergencyAlert, AppError> {
        let ride = self.rides.get_by_id(ride_id).await?;
        if !ride.status.has_driver() || ride.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is {}; emergencies apply to ongoing rides",
                ride.status
            )));
        }

        let bound_driver = match ride.driver_id {
            Some(driver_id) => Some(self.rides.get_driver(driver_id).await?),
            None => None,
        };
        let allowed = input.raised_by == ride.rider_id
            || bound_driver
                .as_ref()
                .is_some_and(|d| d.id == input.raised_by || d.user_id == input.raised_by);
        if !allowed {
            return Err(AppError::Validation(format!(
                "{} is not a participant of ride {ride_id}",
                input.raised_by
            )));
        }

        let location = match input.location {
            Some(point) => {
                point.validate("emergency location")?;
                point
            }
            None => bound_driver
                .as_ref()
                .and_then(|d| d.location)
                .unwrap_or(ride.pickup.point),
        };

        if self
            .rides
            .durable()
            .find_open_emergency_for_ride(ride_id)
            .await?
            .is_some()
        {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} already has an open emergency"
            )));
        }

        let nearby_drivers = self
            .locations
            .get_drivers_in_area(bounding_box_around(&location, RESPONSE_RADIUS_KM))
            .await?
            .into_iter()
            .map(|driver| driver.id)
            .filter(|id| Some(*id) != ride.driver_id)
            .collect();

        let alert = EmergencyAlert {
            id: Uuid::new_v4(),
            ride_id,
            raised_by: input.raised_by,
            location,
            message: input.message,
            nearby_drivers,
            raised_at: Utc::now(),
            resolved_at: None,
        };
        self.rides.durable().insert_emergency(&alert).await?;
        self.cache
            .write(&keys::emergency_for_ride(ride_id), &alert, self.ttls.emergency)
            .await;

        warn!(
            ride_id = %ride_id,
            alert_id = %alert.id,
            responders = alert.nearby_drivers.len(),
            "emergency raised"
        );
        let mut event = RideEvent::for_ride(RideEventKind::Emergency, &ride);
        event.at = alert.raised_at;
        self.publish(event).await;

        Ok(alert)
    }

    pub async fn active_emergency(&self, ride_id: Uuid) -> Result<EmergencyAlert, AppError> {
        let key = keys::emergency_for_ride(ride_id);
        if let Some(alert) = self.cache.read::<EmergencyAlert>(&key).await {
            return Ok(alert);
        }

        let alert = self
            .rides
            .durable()
            .find_open_emergency_for_ride(ride_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no open emergency for ride {ride_id}")))?;

        self.cache.write(&key, &alert, self.ttls.emergency).await;
        Ok(alert)
    }

    pub async fn resolve_emergency(&self, ride_id: Uuid) -> Result<EmergencyAlert, AppError> {
        let open = self
            .rides
            .durable()
            .find_open_emergency_for_ride(ride_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no open emergency for ride {ride_id}")))?;

        let resolved = match self
            .rides
            .durable()
            .resolve_emergency(open.id, Utc::now())
            .await?
        {
            Conditional::Applied(alert) => alert,
            Conditional::Rejected(_) => {
                return Err(AppError::Conflict(format!(
                    "emergency {} is already resolved",
                    open.id
                )));
            }
            Conditional::Missing => {
                return Err(AppError::NotFound(format!("emergency {} not found", open.id)));
            }
        };

        self.cache.invalidate(&keys::emergency_for_ride(ride_id)).await;
        info!(ride_id = %ride_id, alert_id = %resolved.id, "emergency resolved");
        Ok(resolved)
    }
}
