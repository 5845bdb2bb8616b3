use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyAlert {
    pub id: Uuid,
    pub ride_id: Uuid,
    pub raised_by: Uuid,
    pub location: GeoPoint,
    pub message: Option<String>,
    /// Dispatchable drivers in the area when the alert was raised.
    pub nearby_drivers: Vec<Uuid>,
    pub raised_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EmergencyAlert {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
