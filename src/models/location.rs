use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn validate(&self, field: &str) -> Result<(), AppError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(AppError::Validation(format!(
                "{field} coordinates must be finite numbers"
            )));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::Validation(format!(
                "{field} latitude {} is outside [-90, 90]",
                self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::Validation(format!(
                "{field} longitude {} is outside [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }
}

/// A pickup, dropoff or waypoint: coordinates plus whatever the geocoder told us about them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Location {
    pub point: GeoPoint,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub place_id: Option<String>,
}

impl Location {
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            point: GeoPoint::new(lat, lng),
            address: None,
            place_id: None,
        }
    }
}

/// Axis-aligned lat/lng rectangle. Does not handle boxes crossing the antimeridian.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub min_lng: f64,
    pub max_lat: f64,
    pub max_lng: f64,
}

impl BoundingBox {
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.lat >= self.min_lat
            && point.lat <= self.max_lat
            && point.lng >= self.min_lng
            && point.lng <= self.max_lng
    }

    pub fn validate(&self) -> Result<(), AppError> {
        GeoPoint::new(self.min_lat, self.min_lng).validate("bounds min corner")?;
        GeoPoint::new(self.max_lat, self.max_lng).validate("bounds max corner")?;
        if self.min_lat > self.max_lat || self.min_lng > self.max_lng {
            return Err(AppError::Validation(
                "bounds min corner must not exceed max corner".to_string(),
            ));
        }
        Ok(())
    }
}
