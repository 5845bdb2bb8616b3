use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::ride::{Ride, RideStatus};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RideEventKind {
    Requested,
    Offered,
    Accepted,
    DriverArrived,
    Started,
    Completed,
    Cancelled,
    Expired,
    Emergency,
}

/// Notification payload published on ride lifecycle changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideEvent {
    pub kind: RideEventKind,
    pub ride_id: Uuid,
    pub rider_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub status: RideStatus,
    pub at: DateTime<Utc>,
}

impl RideEvent {
    pub fn for_ride(kind: RideEventKind, ride: &Ride) -> Self {
        Self {
            kind,
            ride_id: ride.id,
            rider_id: ride.rider_id,
            driver_id: ride
                .driver_id
                .or_else(|| ride.cancellation.as_ref().and_then(|c| c.driver_id)),
            status: ride.status,
            at: ride.updated_at,
        }
    }

    pub fn offered(ride: &Ride, driver_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            kind: RideEventKind::Offered,
            ride_id: ride.id,
            rider_id: ride.rider_id,
            driver_id: Some(driver_id),
            status: ride.status,
            at,
        }
    }
}
