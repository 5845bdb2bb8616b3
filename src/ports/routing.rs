use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::location::GeoPoint;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteEstimate {
    pub distance_km: f64,
    pub duration_secs: u32,
    pub polyline: Option<String>,
}

/// Directions provider: distance, duration and polyline for an ordered list of stops.
#[async_trait]
pub trait RouteProvider: Send + Sync {
    async fn route(&self, stops: &[GeoPoint]) -> Result<RouteEstimate, AppError>;
}
