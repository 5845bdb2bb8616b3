use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::GeoPoint;
use crate::models::ride::RideType;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Compliance {
    pub license: ComplianceStatus,
    pub insurance: ComplianceStatus,
    pub background_check: ComplianceStatus,
}

impl Compliance {
    pub fn pending() -> Self {
        Self {
            license: ComplianceStatus::Pending,
            insurance: ComplianceStatus::Pending,
            background_check: ComplianceStatus::Pending,
        }
    }

    pub fn approved() -> Self {
        Self {
            license: ComplianceStatus::Approved,
            insurance: ComplianceStatus::Approved,
            background_check: ComplianceStatus::Approved,
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.license == ComplianceStatus::Approved
            && self.insurance == ComplianceStatus::Approved
            && self.background_check == ComplianceStatus::Approved
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Driver {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub vehicle_id: Uuid,
    pub ride_types: Vec<RideType>,
    pub status: DriverStatus,
    pub available: bool,
    pub location: Option<GeoPoint>,
    pub location_updated_at: Option<DateTime<Utc>>,
    pub compliance: Compliance,
    pub rating: f64,
    pub rating_count: u32,
    pub completed_rides: u32,
    pub cancelled_rides: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Driver {
    /// Whether the driver may be offered rides at `now`, ignoring distance and ride type.
    pub fn is_dispatchable(&self, now: DateTime<Utc>, freshness: chrono::Duration) -> bool {
        self.status == DriverStatus::Online
            && self.available
            && self.compliance.is_cleared()
            && self
                .location_updated_at
                .is_some_and(|updated| now - updated <= freshness)
    }

    pub fn supports(&self, ride_type: RideType) -> bool {
        self.ride_types.contains(&ride_type)
    }

    pub fn apply(&mut self, update: &DriverUpdate) {
        if let Some(status) = update.status {
            self.status = status;
            if status == DriverStatus::Offline {
                self.available = false;
            }
        }
        if let Some(available) = update.available {
            self.available = available && self.status == DriverStatus::Online;
        }
        if let Some(fix) = update.location {
            self.location = Some(fix.point);
            self.location_updated_at = Some(fix.at);
        }
        if let Some(license) = update.license {
            self.compliance.license = license;
        }
        if let Some(insurance) = update.insurance {
            self.compliance.insurance = insurance;
        }
        if let Some(background_check) = update.background_check {
            self.compliance.background_check = background_check;
        }
        if let Some(ride_types) = &update.ride_types {
            self.ride_types = ride_types.clone();
        }
        if let Some(sample) = update.rating_sample {
            let total = self.rating * f64::from(self.rating_count) + sample;
            self.rating_count += 1;
            self.rating = total / f64::from(self.rating_count);
        }
        match update.ride_outcome {
            Some(RideOutcome::Completed) => self.completed_rides += 1,
            Some(RideOutcome::Cancelled) => self.cancelled_rides += 1,
            None => {}
        }
        self.updated_at = update.at;
    }
}

#[derive(Debug, Clone)]
pub struct NewDriver {
    pub user_id: Uuid,
    pub name: String,
    pub vehicle_id: Uuid,
    pub ride_types: Vec<RideType>,
}

#[derive(Debug, Clone, Copy)]
pub struct LocationFix {
    pub point: GeoPoint,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RideOutcome {
    Completed,
    Cancelled,
}

/// Field-optional driver update. `None` leaves the field as stored.
#[derive(Debug, Clone)]
pub struct DriverUpdate {
    pub at: DateTime<Utc>,
    pub status: Option<DriverStatus>,
    pub available: Option<bool>,
    pub location: Option<LocationFix>,
    pub license: Option<ComplianceStatus>,
    pub insurance: Option<ComplianceStatus>,
    pub background_check: Option<ComplianceStatus>,
    pub ride_types: Option<Vec<RideType>>,
    pub rating_sample: Option<f64>,
    pub ride_outcome: Option<RideOutcome>,
}

impl DriverUpdate {
    pub fn at(at: DateTime<Utc>) -> Self {
        Self {
            at,
            status: None,
            available: None,
            location: None,
            license: None,
            insurance: None,
            background_check: None,
            ride_types: None,
            rating_sample: None,
            ride_outcome: None,
        }
    }

    pub fn availability(at: DateTime<Utc>, available: bool) -> Self {
        Self {
            available: Some(available),
            ..Self::at(at)
        }
    }
}
