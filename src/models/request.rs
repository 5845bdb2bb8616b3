use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::Location;
use crate::models::ride::RideType;

/// Pre-assignment dispatch state for a ride. Keyed by the ride it dispatches and
/// destroyed once a driver is bound or the request expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequest {
    pub ride_id: Uuid,
    pub rider_id: Uuid,
    pub ride_type: RideType,
    pub pickup: Location,
    pub dropoff: Location,
    pub search_radius_km: f64,
    /// Ranked candidates not yet rejected.
    pub candidate_drivers: Vec<Uuid>,
    /// Drivers an offer has been sent to.
    pub requested_drivers: Vec<Uuid>,
    pub rejected_drivers: Vec<Uuid>,
    pub max_wait_secs: u64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl RideRequest {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn has_rejected(&self, driver_id: &Uuid) -> bool {
        self.rejected_drivers.contains(driver_id)
    }

    /// Records a rejection: the driver leaves the candidate and offered lists for good.
    pub fn reject(&mut self, driver_id: Uuid) {
        self.candidate_drivers.retain(|id| *id != driver_id);
        self.requested_drivers.retain(|id| *id != driver_id);
        if !self.rejected_drivers.contains(&driver_id) {
            self.rejected_drivers.push(driver_id);
        }
    }

    pub fn apply(&mut self, change: &RequestChange) {
        match change {
            RequestChange::Offered(drivers) => {
                for id in drivers {
                    if !self.requested_drivers.contains(id) && !self.rejected_drivers.contains(id) {
                        self.requested_drivers.push(*id);
                    }
                }
            }
            RequestChange::Rejected(driver_id) => self.reject(*driver_id),
            RequestChange::Candidates(ranked) => {
                self.candidate_drivers = ranked
                    .iter()
                    .filter(|id| !self.rejected_drivers.contains(id))
                    .copied()
                    .collect();
            }
        }
    }

    /// Ranked candidates that have not been offered the ride yet.
    pub fn unoffered(&self) -> impl Iterator<Item = &Uuid> {
        self.candidate_drivers
            .iter()
            .filter(|id| !self.requested_drivers.contains(id))
    }
}

/// Request-scoped mutation, applied atomically by the store.
#[derive(Debug, Clone)]
pub enum RequestChange {
    Offered(Vec<Uuid>),
    Rejected(Uuid),
    /// Replaces the ranked candidate list; rejected drivers are filtered out on apply.
    Candidates(Vec<Uuid>),
}
