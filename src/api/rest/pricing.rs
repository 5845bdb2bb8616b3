use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::fare::FareQuote;
use crate::engine::surge::NewSurgeArea;
use crate::error::AppError;
use crate::models::location::{GeoPoint, Location};
use crate::models::ride::RideType;
use crate::models::surge::SurgeArea;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/fares/estimate", post(estimate_fare))
        .route("/surge/areas", post(define_area))
        .route("/surge/areas/:id", get(get_area))
        .route("/surge/areas/:id/refresh", post(refresh_area))
        .route("/surge/multiplier", get(multiplier_at))
}

#[derive(Deserialize)]
pub struct EstimateRequest {
    pub ride_type: String,
    pub pickup: Location,
    pub dropoff: Location,
    #[serde(default)]
    pub waypoints: Vec<Location>,
}

#[derive(Serialize)]
pub struct MultiplierResponse {
    pub lat: f64,
    pub lng: f64,
    pub multiplier: f64,
}

async fn estimate_fare(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EstimateRequest>,
) -> Result<Json<FareQuote>, AppError> {
    let ride_type: RideType = payload.ride_type.parse()?;
    let quote = state
        .dispatch
        .estimate_fare(ride_type, &payload.pickup, &payload.dropoff, &payload.waypoints)
        .await?;
    Ok(Json(quote))
}

async fn define_area(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<NewSurgeArea>,
) -> Result<Json<SurgeArea>, AppError> {
    Ok(Json(state.dispatch.surge().define_area(payload).await?))
}

async fn get_area(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SurgeArea>, AppError> {
    Ok(Json(state.dispatch.surge().get_area(id).await?))
}

async fn refresh_area(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SurgeArea>, AppError> {
    Ok(Json(state.dispatch.refresh_surge(id).await?))
}

async fn multiplier_at(
    State(state): State<Arc<AppState>>,
    Query(point): Query<GeoPoint>,
) -> Result<Json<MultiplierResponse>, AppError> {
    point.validate("query point")?;
    let multiplier = state
        .dispatch
        .surge()
        .multiplier_at(point, Utc::now())
        .await?;
    Ok(Json(MultiplierResponse {
        lat: point.lat,
        lng: point.lng,
        multiplier,
    }))
}
