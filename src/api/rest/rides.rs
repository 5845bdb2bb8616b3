use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, patch, post};
use axum::Json;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::engine::dispatch::{Offer, RideRequestInput, TripActuals};
use crate::engine::emergency::EmergencyInput;
use crate::error::AppError;
use crate::models::driver::Driver;
use crate::models::emergency::EmergencyAlert;
use crate::models::request::RideRequest;
use crate::models::ride::{CancellationActor, Ride, RideStatus};
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rides", post(request_ride))
        .route("/rides/:id", get(get_ride))
        .route("/rides/number/:number", get(get_ride_by_number))
        .route("/rides/:id/request", get(get_request))
        .route("/rides/:id/offer", post(offer_next))
        .route("/rides/:id/accept", post(accept_ride))
        .route("/rides/:id/reject", post(reject_ride))
        .route("/rides/:id/status", patch(update_status))
        .route("/rides/:id/cancel", post(cancel_ride))
        .route("/rides/:id/expire", post(expire_request))
        .route("/rides/:id/rating", post(rate_ride))
        .route(
            "/rides/:id/emergency",
            post(raise_emergency)
                .get(active_emergency)
                .delete(resolve_emergency),
        )
        .route("/riders/:id/rides", get(rides_for_rider))
}

#[derive(Deserialize)]
pub struct DriverRef {
    pub driver_id: Uuid,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub actual: Option<TripActuals>,
}

#[derive(Deserialize)]
pub struct CancelRequest {
    pub reason: String,
    pub actor: CancellationActor,
}

#[derive(Deserialize)]
pub struct RatingRequest {
    pub rider_id: Uuid,
    pub rating: u8,
}

async fn request_ride(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RideRequestInput>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(state.dispatch.request_ride(payload).await?))
}

async fn get_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, AppError> {
    Ok(Json(state.rides.get_by_id(id).await?))
}

async fn get_ride_by_number(
    State(state): State<Arc<AppState>>,
    Path(number): Path<String>,
) -> Result<Json<Ride>, AppError> {
    Ok(Json(state.rides.get_by_number(&number).await?))
}

async fn get_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(state.dispatch.get_request(id).await?))
}

async fn offer_next(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Offer>, AppError> {
    Ok(Json(state.dispatch.offer_next(id).await?))
}

async fn accept_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverRef>,
) -> Result<Json<Ride>, AppError> {
    Ok(Json(state.dispatch.assign_driver(id, payload.driver_id).await?))
}

async fn reject_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<DriverRef>,
) -> Result<Json<RideRequest>, AppError> {
    Ok(Json(state.dispatch.reject_offer(id, payload.driver_id).await?))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<Ride>, AppError> {
    let target: RideStatus = payload.status.parse()?;
    Ok(Json(
        state
            .dispatch
            .update_ride_status(id, target, payload.actual)
            .await?,
    ))
}

async fn cancel_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<CancelRequest>,
) -> Result<Json<Ride>, AppError> {
    Ok(Json(
        state
            .dispatch
            .cancel_ride(id, payload.reason, payload.actor)
            .await?,
    ))
}

async fn expire_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Ride>, AppError> {
    Ok(Json(state.dispatch.expire_request(id, Utc::now()).await?))
}

async fn rate_ride(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<RatingRequest>,
) -> Result<Json<Driver>, AppError> {
    Ok(Json(
        state
            .dispatch
            .rate_ride(id, payload.rider_id, payload.rating)
            .await?,
    ))
}

async fn raise_emergency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<EmergencyInput>,
) -> Result<Json<EmergencyAlert>, AppError> {
    Ok(Json(state.dispatch.raise_emergency(id, payload).await?))
}

async fn active_emergency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<EmergencyAlert>, AppError> {
    Ok(Json(state.dispatch.active_emergency(id).await?))
}

async fn resolve_emergency(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<EmergencyAlert>, AppError> {
    Ok(Json(state.dispatch.resolve_emergency(id).await?))
}

async fn rides_for_rider(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Ride>>, AppError> {
    Ok(Json(state.rides.rides_for_rider(id).await?))
}
