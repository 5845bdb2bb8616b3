use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::location::Location;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideStatus {
    Requested,
    Accepted,
    DriverArrived,
    InProgress,
    Completed,
    Cancelled,
}

impl RideStatus {
    pub const ACTIVE: [RideStatus; 4] = [
        RideStatus::Requested,
        RideStatus::Accepted,
        RideStatus::DriverArrived,
        RideStatus::InProgress,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, RideStatus::Completed | RideStatus::Cancelled)
    }

    /// Statuses in which a ride carries a driver and vehicle binding.
    pub fn has_driver(self) -> bool {
        matches!(
            self,
            RideStatus::Accepted
                | RideStatus::DriverArrived
                | RideStatus::InProgress
                | RideStatus::Completed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RideStatus::Requested => "requested",
            RideStatus::Accepted => "accepted",
            RideStatus::DriverArrived => "driver_arrived",
            RideStatus::InProgress => "in_progress",
            RideStatus::Completed => "completed",
            RideStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RideStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RideStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(RideStatus::Requested),
            "accepted" => Ok(RideStatus::Accepted),
            "driver_arrived" => Ok(RideStatus::DriverArrived),
            "in_progress" => Ok(RideStatus::InProgress),
            "completed" => Ok(RideStatus::Completed),
            "cancelled" => Ok(RideStatus::Cancelled),
            other => Err(AppError::Validation(format!("unknown ride status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RideType {
    Economy,
    Comfort,
    Premium,
    Xl,
}

impl RideType {
    pub fn as_str(self) -> &'static str {
        match self {
            RideType::Economy => "economy",
            RideType::Comfort => "comfort",
            RideType::Premium => "premium",
            RideType::Xl => "xl",
        }
    }
}

impl FromStr for RideType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "economy" => Ok(RideType::Economy),
            "comfort" => Ok(RideType::Comfort),
            "premium" => Ok(RideType::Premium),
            "xl" => Ok(RideType::Xl),
            other => Err(AppError::Validation(format!(
                "unknown ride type: {other}, expected economy/comfort/premium/xl"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TripMetrics {
    pub distance_km: f64,
    pub duration_secs: u32,
    pub fare: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CancellationActor {
    Rider,
    Driver,
    System,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cancellation {
    pub reason: String,
    pub actor: CancellationActor,
    /// Driver that was bound when the ride was cancelled, if any.
    pub driver_id: Option<Uuid>,
}

/// Per-transition timestamps. Each is written once by the transition that owns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RideTimeline {
    pub requested_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub driver_arrived_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ride {
    pub id: Uuid,
    pub ride_number: String,
    pub rider_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub vehicle_id: Option<Uuid>,
    pub ride_type: RideType,
    pub status: RideStatus,
    pub pickup: Location,
    pub dropoff: Location,
    pub waypoints: Vec<Location>,
    pub estimated: TripMetrics,
    pub actual: Option<TripMetrics>,
    pub surge_multiplier: f64,
    pub route_polyline: Option<String>,
    pub timeline: RideTimeline,
    pub cancellation: Option<Cancellation>,
    /// Rider's 1-5 score for the driver. Set at most once, after completion.
    #[serde(default)]
    pub rider_rating: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to insert a new ride in the `Requested` state.
#[derive(Debug, Clone)]
pub struct NewRide {
    pub rider_id: Uuid,
    pub ride_type: RideType,
    pub pickup: Location,
    pub dropoff: Location,
    pub waypoints: Vec<Location>,
    pub estimated: TripMetrics,
    pub surge_multiplier: f64,
    pub route_polyline: Option<String>,
}

impl Ride {
    pub fn new(draft: NewRide, now: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            ride_number: ride_number_for(&id),
            rider_id: draft.rider_id,
            driver_id: None,
            vehicle_id: None,
            ride_type: draft.ride_type,
            status: RideStatus::Requested,
            pickup: draft.pickup,
            dropoff: draft.dropoff,
            waypoints: draft.waypoints,
            estimated: draft.estimated,
            actual: None,
            surge_multiplier: draft.surge_multiplier,
            route_polyline: draft.route_polyline,
            timeline: RideTimeline {
                requested_at: Some(now),
                ..RideTimeline::default()
            },
            cancellation: None,
            rider_rating: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn can_be_rated(&self) -> bool {
        self.status == RideStatus::Completed
            && self.driver_id.is_some()
            && self.rider_rating.is_none()
    }

    /// Applies a transition without checking the precondition; the store does that
    /// atomically before calling this.
    pub fn apply(&mut self, transition: &RideTransition) {
        match transition {
            RideTransition::Assign {
                driver_id,
                vehicle_id,
                at,
            } => {
                self.driver_id = Some(*driver_id);
                self.vehicle_id = Some(*vehicle_id);
                self.timeline.accepted_at.get_or_insert(*at);
            }
            RideTransition::DriverArrived { at } => {
                self.timeline.driver_arrived_at.get_or_insert(*at);
            }
            RideTransition::Start { at } => {
                self.timeline.started_at.get_or_insert(*at);
            }
            RideTransition::Complete { at, actual } => {
                self.actual = Some(*actual);
                self.timeline.completed_at.get_or_insert(*at);
            }
            RideTransition::Cancel { at, reason, actor } => {
                self.cancellation = Some(Cancellation {
                    reason: reason.clone(),
                    actor: *actor,
                    driver_id: self.driver_id,
                });
                self.driver_id = None;
                self.vehicle_id = None;
                self.timeline.cancelled_at.get_or_insert(*at);
            }
        }
        self.status = transition.target();
        self.updated_at = transition.at();
    }
}

/// Human-readable ride reference derived from the id.
pub fn ride_number_for(id: &Uuid) -> String {
    let simple = id.simple().to_string();
    format!("RD-{}", simple[..8].to_uppercase())
}

/// A typed status-changing update. Each variant only carries the fields its transition
/// may write.
#[derive(Debug, Clone)]
pub enum RideTransition {
    Assign {
        driver_id: Uuid,
        vehicle_id: Uuid,
        at: DateTime<Utc>,
    },
    DriverArrived {
        at: DateTime<Utc>,
    },
    Start {
        at: DateTime<Utc>,
    },
    Complete {
        at: DateTime<Utc>,
        actual: TripMetrics,
    },
    Cancel {
        at: DateTime<Utc>,
        reason: String,
        actor: CancellationActor,
    },
}

impl RideTransition {
    /// Statuses the record must currently be in for this transition to apply.
    pub fn allowed_from(&self) -> &'static [RideStatus] {
        match self {
            RideTransition::Assign { .. } => &[RideStatus::Requested],
            RideTransition::DriverArrived { .. } => &[RideStatus::Accepted],
            RideTransition::Start { .. } => &[RideStatus::DriverArrived],
            RideTransition::Complete { .. } => &[RideStatus::InProgress],
            RideTransition::Cancel { .. } => &RideStatus::ACTIVE,
        }
    }

    pub fn target(&self) -> RideStatus {
        match self {
            RideTransition::Assign { .. } => RideStatus::Accepted,
            RideTransition::DriverArrived { .. } => RideStatus::DriverArrived,
            RideTransition::Start { .. } => RideStatus::InProgress,
            RideTransition::Complete { .. } => RideStatus::Completed,
            RideTransition::Cancel { .. } => RideStatus::Cancelled,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            RideTransition::Assign { at, .. }
            | RideTransition::DriverArrived { at }
            | RideTransition::Start { at }
            | RideTransition::Complete { at, .. }
            | RideTransition::Cancel { at, .. } => *at,
        }
    }
}
