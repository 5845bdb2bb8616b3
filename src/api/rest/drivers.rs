use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::location::NearbyDriver;
use crate::error::AppError;
use crate::models::driver::{ComplianceStatus, Driver, DriverStatus, DriverUpdate, NewDriver};
use crate::models::location::{BoundingBox, GeoPoint};
use crate::models::ride::RideType;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/drivers", post(register_driver))
        .route("/drivers/nearby", get(nearby_drivers))
        .route("/drivers/area", get(drivers_in_area))
        .route("/drivers/by-user/:user_id", get(driver_by_user))
        .route("/drivers/:id", get(get_driver))
        .route("/drivers/:id/location", patch(update_location))
        .route("/drivers/:id/status", patch(update_status))
        .route("/drivers/:id/availability", patch(update_availability))
        .route("/drivers/:id/compliance", patch(update_compliance))
}

#[derive(Deserialize)]
pub struct RegisterDriverRequest {
    pub user_id: Uuid,
    pub name: String,
    pub vehicle_id: Uuid,
    pub ride_types: Vec<String>,
}

#[derive(Deserialize)]
pub struct NearbyQuery {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
    pub ride_type: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateLocationRequest {
    pub location: GeoPoint,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: DriverStatus,
}

#[derive(Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub available: bool,
}

#[derive(Deserialize)]
pub struct UpdateComplianceRequest {
    pub license: Option<ComplianceStatus>,
    pub insurance: Option<ComplianceStatus>,
    pub background_check: Option<ComplianceStatus>,
}

async fn register_driver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterDriverRequest>,
) -> Result<Json<Driver>, AppError> {
    let ride_types = payload
        .ride_types
        .iter()
        .map(|raw| raw.parse::<RideType>())
        .collect::<Result<Vec<_>, _>>()?;

    let driver = state
        .rides
        .register_driver(NewDriver {
            user_id: payload.user_id,
            name: payload.name,
            vehicle_id: payload.vehicle_id,
            ride_types,
        })
        .await?;
    Ok(Json(driver))
}

async fn get_driver(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(state.rides.get_driver(id).await?))
}

async fn driver_by_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(state.rides.get_driver_by_user(user_id).await?))
}

async fn nearby_drivers(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NearbyQuery>,
) -> Result<Json<Vec<NearbyDriver>>, AppError> {
    let ride_type = query
        .ride_type
        .as_deref()
        .map(str::parse::<RideType>)
        .transpose()?;

    let drivers = state
        .dispatch
        .get_nearby_drivers(query.lat, query.lng, query.radius_km, ride_type)
        .await?;
    Ok(Json(drivers))
}

async fn drivers_in_area(
    State(state): State<Arc<AppState>>,
    Query(bounds): Query<BoundingBox>,
) -> Result<Json<Vec<Driver>>, AppError> {
    Ok(Json(
        state.dispatch.locations().get_drivers_in_area(bounds).await?,
    ))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateLocationRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(
        state
            .dispatch
            .locations()
            .update_location(id, payload.location)
            .await?,
    ))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Driver>, AppError> {
    let update = DriverUpdate {
        status: Some(payload.status),
        ..DriverUpdate::at(Utc::now())
    };
    Ok(Json(state.rides.update_driver(id, update).await?))
}

async fn update_availability(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<Driver>, AppError> {
    let update = DriverUpdate::availability(Utc::now(), payload.available);
    Ok(Json(state.rides.update_driver(id, update).await?))
}

async fn update_compliance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateComplianceRequest>,
) -> Result<Json<Driver>, AppError> {
    let update = DriverUpdate {
        license: payload.license,
        insurance: payload.insurance,
        background_check: payload.background_check,
        ..DriverUpdate::at(Utc::now())
    };
    Ok(Json(state.rides.update_driver(id, update).await?))
}
