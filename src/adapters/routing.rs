use async_trait::async_trait;

use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::location::GeoPoint;
use crate::ports::routing::{RouteEstimate, RouteProvider};

const DETOUR_FACTOR: f64 = 1.3;
const AVERAGE_SPEED_KMH: f64 = 30.0;

/// Offline fallback for a directions provider: great-circle legs scaled by a detour
/// factor, timed at a fixed urban average speed. Produces no polyline.
#[derive(Debug, Clone, Default)]
pub struct StraightLineRouter;

#[async_trait]
impl RouteProvider for StraightLineRouter {
    async fn route(&self, stops: &[GeoPoint]) -> Result<RouteEstimate, AppError> {
        if stops.len() < 2 {
            return Err(AppError::Validation(
                "a route needs at least two stops".to_string(),
            ));
        }

        let straight: f64 = stops
            .windows(2)
            .map(|leg| haversine_km(&leg[0], &leg[1]))
            .sum();
        let distance_km = straight * DETOUR_FACTOR;
        let duration_secs = (distance_km / AVERAGE_SPEED_KMH * 3600.0).round() as u32;

        Ok(RouteEstimate {
            distance_km,
            duration_secs,
            polyline: None,
        })
    }
}
