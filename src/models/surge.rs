use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::{BoundingBox, GeoPoint};

/// Geofenced surge record. `multiplier` is always >= 1.0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurgeArea {
    pub id: Uuid,
    pub name: String,
    pub bounds: BoundingBox,
    pub multiplier: f64,
    pub demand: u32,
    pub supply: u32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl SurgeArea {
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.starts_at <= at && self.ends_at.is_none_or(|end| at < end)
    }

    pub fn applies_to(&self, point: &GeoPoint, at: DateTime<Utc>) -> bool {
        self.is_active_at(at) && self.bounds.contains(point)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SurgeReading {
    pub demand: u32,
    pub supply: u32,
    pub multiplier: f64,
    pub at: DateTime<Utc>,
}
