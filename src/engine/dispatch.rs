use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{CacheTtls, DispatchConfig};
use crate::engine::fare::{self, FareQuote, FareSchedule};
use crate::engine::location::{DriverLocationIndex, NearbyDriver};
use crate::engine::surge::SurgePricingEngine;
use crate::error::AppError;
use crate::models::driver::{Driver, DriverUpdate, RideOutcome};
use crate::models::event::{RideEvent, RideEventKind};
use crate::models::location::{GeoPoint, Location};
use crate::models::request::{RequestChange, RideRequest};
use crate::models::ride::{CancellationActor, NewRide, Ride, RideStatus, RideType, TripMetrics};
use crate::models::surge::SurgeArea;
use crate::observability::metrics::Metrics;
use crate::ports::notify::Notifier;
use crate::ports::routing::RouteProvider;
use crate::ports::store::RideFilter;
use crate::store::RideStore;
use crate::store::cache::CacheLayer;

const MAX_WAIT_LIMIT_SECS: u64 = 3_600;

#[derive(Debug, Clone, Deserialize)]
pub struct RideRequestInput {
    pub rider_id: Uuid,
    pub ride_type: String,
    pub pickup: Location,
    pub dropoff: Location,
    #[serde(default)]
    pub waypoints: Vec<Location>,
    #[serde(default)]
    pub search_radius_km: Option<f64>,
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TripActuals {
    pub distance_km: f64,
    pub duration_secs: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Offer {
    pub ride_id: Uuid,
    pub drivers: Vec<Uuid>,
    pub expires_at: DateTime<Utc>,
}

pub struct DispatchDeps {
    pub rides: Arc<RideStore>,
    pub locations: DriverLocationIndex,
    pub surge: SurgePricingEngine,
    pub router: Arc<dyn RouteProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub cache: CacheLayer,
}

/// Holds no per-request state; everything lives in the store. Never arms timers: expiry
/// is acted on by whoever calls [`DispatchCoordinator::expire_request`].
pub struct DispatchCoordinator {
    pub(crate) rides: Arc<RideStore>,
    pub(crate) locations: DriverLocationIndex,
    pub(crate) surge: SurgePricingEngine,
    router: Arc<dyn RouteProvider>,
    notifier: Arc<dyn Notifier>,
    pub(crate) cache: CacheLayer,
    pub(crate) ttls: CacheTtls,
    config: DispatchConfig,
    pub(crate) metrics: Metrics,
}

impl DispatchCoordinator {
    pub fn new(
        deps: DispatchDeps,
        config: DispatchConfig,
        ttls: CacheTtls,
        metrics: Metrics,
    ) -> Self {
        Self {
            rides: deps.rides,
            locations: deps.locations,
            surge: deps.surge,
            router: deps.router,
            notifier: deps.notifier,
            cache: deps.cache,
            ttls,
            config,
            metrics,
        }
    }

    pub fn rides(&self) -> &RideStore {
        &self.rides
    }

    pub fn locations(&self) -> &DriverLocationIndex {
        &self.locations
    }

    pub fn surge(&self) -> &SurgePricingEngine {
        &self.surge
    }

    pub async fn request_ride(&self, input: RideRequestInput) -> Result<RideRequest, AppError> {
        let ride_type: RideType = input.ride_type.parse()?;
        input.pickup.point.validate("pickup")?;
        input.dropoff.point.validate("dropoff")?;
        for waypoint in &input.waypoints {
            waypoint.point.validate("waypoint")?;
        }
        let radius_km = input.search_radius_km.unwrap_or(self.config.search_radius_km);
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(AppError::Validation(format!(
                "search radius must be a positive number of km, got {radius_km}"
            )));
        }
        let max_wait_secs = input.max_wait_secs.unwrap_or(self.config.max_wait_secs);
        if max_wait_secs == 0 || max_wait_secs > MAX_WAIT_LIMIT_SECS {
            return Err(AppError::Validation(format!(
                "max wait must be between 1 and {MAX_WAIT_LIMIT_SECS} seconds"
            )));
        }

        let active = self
            .rides
            .find_rides(&RideFilter {
                rider_id: Some(input.rider_id),
                statuses: RideStatus::ACTIVE.to_vec(),
                ..RideFilter::default()
            })
            .await?;
        if let Some(existing) = active.first() {
            return Err(AppError::Conflict(format!(
                "rider {} already has active ride {}",
                input.rider_id, existing.id
            )));
        }

        let now = Utc::now();
        let quote = self
            .estimate(ride_type, &input.pickup, &input.dropoff, &input.waypoints, now)
            .await?;
        self.surge.record_demand(input.pickup.point, now).await?;
        let candidates = self
            .ranked_candidates(input.pickup.point, radius_km, ride_type, &[])
            .await?;

        let ride = self
            .rides
            .create(NewRide {
                rider_id: input.rider_id,
                ride_type,
                pickup: input.pickup.clone(),
                dropoff: input.dropoff.clone(),
                waypoints: input.waypoints,
                estimated: TripMetrics {
                    distance_km: quote.quote.distance_km,
                    duration_secs: quote.quote.duration_secs,
                    fare: quote.quote.fare,
                },
                surge_multiplier: quote.quote.surge_multiplier,
                route_polyline: quote.polyline,
            })
            .await?;

        let request = RideRequest {
            ride_id: ride.id,
            rider_id: ride.rider_id,
            ride_type,
            pickup: input.pickup,
            dropoff: input.dropoff,
            search_radius_km: radius_km,
            candidate_drivers: candidates,
            requested_drivers: Vec::new(),
            rejected_drivers: Vec::new(),
            max_wait_secs,
            expires_at: now + Duration::seconds(max_wait_secs as i64),
            created_at: now,
        };
        if let Err(err) = self.rides.durable().insert_request(&request).await {
            self.abandon(&ride).await;
            return Err(err.into());
        }

        self.metrics.rides_requested_total.inc();
        self.metrics.open_ride_requests.inc();
        if request.candidate_drivers.is_empty() {
            warn!(ride_id = %ride.id, radius_km, "no eligible drivers near pickup");
        }
        info!(
            ride_id = %ride.id,
            candidates = request.candidate_drivers.len(),
            surge = ride.surge_multiplier,
            "ride requested"
        );
        self.publish(RideEvent::for_ride(RideEventKind::Requested, &ride))
            .await;

        Ok(request)
    }

    pub async fn estimate_fare(
        &self,
        ride_type: RideType,
        pickup: &Location,
        dropoff: &Location,
        waypoints: &[Location],
    ) -> Result<FareQuote, AppError> {
        pickup.point.validate("pickup")?;
        dropoff.point.validate("dropoff")?;
        Ok(self
            .estimate(ride_type, pickup, dropoff, waypoints, Utc::now())
            .await?
            .quote)
    }

    pub async fn get_request(&self, ride_id: Uuid) -> Result<RideRequest, AppError> {
        self.rides
            .durable()
            .find_request(ride_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no open request for ride {ride_id}")))
    }

    /// Offers the ride to the next batch of ranked candidates. Re-queries the index when
    /// every known candidate has already been offered.
    pub async fn offer_next(&self, ride_id: Uuid) -> Result<Offer, AppError> {
        let now = Utc::now();
        let mut request = self.get_request(ride_id).await?;
        if request.is_expired(now) {
            return Err(AppError::Conflict(format!(
                "request for ride {ride_id} expired at {}",
                request.expires_at
            )));
        }

        if request.unoffered().next().is_none() {
            let ranked = self
                .ranked_candidates(
                    request.pickup.point,
                    request.search_radius_km,
                    request.ride_type,
                    &request.rejected_drivers,
                )
                .await?;
            request = self
                .change_request(ride_id, RequestChange::Candidates(ranked))
                .await?;
        }

        let batch: Vec<Uuid> = request
            .unoffered()
            .take(self.config.offer_batch_size)
            .copied()
            .collect();
        if batch.is_empty() {
            return Err(AppError::Unavailable(format!(
                "no eligible drivers for ride {ride_id}"
            )));
        }

        let request = self
            .change_request(ride_id, RequestChange::Offered(batch.clone()))
            .await?;

        let ride = self.rides.get_by_id(ride_id).await?;
        for driver_id in &batch {
            info!(ride_id = %ride_id, driver_id = %driver_id, "ride offered");
            self.publish(RideEvent::offered(&ride, *driver_id, now)).await;
        }

        Ok(Offer {
            ride_id,
            drivers: batch,
            expires_at: request.expires_at,
        })
    }

    pub async fn reject_offer(
        &self,
        ride_id: Uuid,
        driver_id: Uuid,
    ) -> Result<RideRequest, AppError> {
        let request = self
            .change_request(ride_id, RequestChange::Rejected(driver_id))
            .await?;
        info!(ride_id = %ride_id, driver_id = %driver_id, "ride offer rejected");

        let ranked = self
            .ranked_candidates(
                request.pickup.point,
                request.search_radius_km,
                request.ride_type,
                &request.rejected_drivers,
            )
            .await?;
        self.change_request(ride_id, RequestChange::Candidates(ranked))
            .await
    }

    /// Binds `driver_id` to the ride. The driver is reserved first; the ride update then
    /// only succeeds while the ride is still `Requested`, so concurrent acceptances
    /// resolve to exactly one winner. A losing driver's reservation is released.
    pub async fn assign_driver(&self, ride_id: Uuid, driver_id: Uuid) -> Result<Ride, AppError> {
        let start = Instant::now();
        let result = self.try_assign(ride_id, driver_id).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(AppError::Conflict(_)) => "conflict",
            Err(_) => "error",
        };
        self.metrics
            .assignment_latency_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());
        self.metrics
            .assignments_total
            .with_label_values(&[outcome])
            .inc();

        result
    }

    async fn try_assign(&self, ride_id: Uuid, driver_id: Uuid) -> Result<Ride, AppError> {
        if let Some(request) = self.rides.durable().find_request(ride_id).await? {
            if request.has_rejected(&driver_id) {
                return Err(AppError::Conflict(format!(
                    "driver {driver_id} already rejected ride {ride_id}"
                )));
            }
        }

        let ride = self.rides.get_by_id(ride_id).await?;
        if ride.status != RideStatus::Requested {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is no longer available ({})",
                ride.status
            )));
        }

        let driver = self.rides.get_driver(driver_id).await?;
        self.ensure_can_take(&driver, ride.ride_type)?;

        let now = Utc::now();
        let reserved = self
            .rides
            .update_driver_if(driver_id, Some(true), DriverUpdate::availability(now, false))
            .await
            .map_err(|err| match err {
                AppError::Conflict(_) => {
                    AppError::Conflict(format!("driver {driver_id} is already on another ride"))
                }
                other => other,
            })?;

        let ride = match self
            .rides
            .assign_driver(ride_id, driver_id, reserved.vehicle_id)
            .await
        {
            Ok(ride) => ride,
            Err(err) => {
                warn!(ride_id = %ride_id, driver_id = %driver_id, error = %err, "assignment lost");
                if let Err(release_err) = self
                    .rides
                    .update_driver_if(
                        driver_id,
                        Some(false),
                        DriverUpdate::availability(Utc::now(), true),
                    )
                    .await
                {
                    error!(
                        driver_id = %driver_id,
                        error = %release_err,
                        "failed to release driver reservation"
                    );
                }
                return Err(match err {
                    AppError::Conflict(_) => AppError::Conflict(format!(
                        "ride {ride_id} is no longer available"
                    )),
                    other => other,
                });
            }
        };

        self.consume_request(ride_id).await;
        self.metrics
            .ride_transitions_total
            .with_label_values(&[ride.status.as_str()])
            .inc();
        info!(ride_id = %ride.id, driver_id = %driver_id, "driver assigned");
        self.publish(RideEvent::for_ride(RideEventKind::Accepted, &ride))
            .await;

        Ok(ride)
    }

    /// Completion prices the trip from `actuals`, or the estimate, at the frozen surge.
    pub async fn update_ride_status(
        &self,
        ride_id: Uuid,
        target: RideStatus,
        actuals: Option<TripActuals>,
    ) -> Result<Ride, AppError> {
        let (ride, kind) = match target {
            RideStatus::DriverArrived => (
                self.rides.mark_driver_arrived(ride_id).await?,
                RideEventKind::DriverArrived,
            ),
            RideStatus::InProgress => (
                self.rides.start_ride(ride_id).await?,
                RideEventKind::Started,
            ),
            RideStatus::Completed => (
                self.complete(ride_id, actuals).await?,
                RideEventKind::Completed,
            ),
            RideStatus::Cancelled => {
                return self
                    .cancel_ride(
                        ride_id,
                        "cancelled by operator".to_string(),
                        CancellationActor::Admin,
                    )
                    .await;
            }
            RideStatus::Requested | RideStatus::Accepted => {
                let current = self.rides.get_by_id(ride_id).await?;
                return Err(AppError::Conflict(format!(
                    "ride {ride_id} is {}; cannot move to {target} by status update",
                    current.status
                )));
            }
        };

        self.metrics
            .ride_transitions_total
            .with_label_values(&[ride.status.as_str()])
            .inc();
        self.publish(RideEvent::for_ride(kind, &ride)).await;
        Ok(ride)
    }

    async fn complete(
        &self,
        ride_id: Uuid,
        actuals: Option<TripActuals>,
    ) -> Result<Ride, AppError> {
        let ride = self.rides.get_by_id(ride_id).await?;
        if ride.status != RideStatus::InProgress {
            return Err(AppError::Conflict(format!(
                "ride {ride_id} is {}; cannot move to {}",
                ride.status,
                RideStatus::Completed
            )));
        }

        let (distance_km, duration_secs) = match actuals {
            Some(actuals) => (actuals.distance_km, actuals.duration_secs),
            None => (ride.estimated.distance_km, ride.estimated.duration_secs),
        };
        let fare = fare::compute_fare(
            &FareSchedule::for_ride_type(ride.ride_type),
            distance_km,
            duration_secs,
            ride.surge_multiplier,
        )?;

        let completed = self
            .rides
            .complete_ride(
                ride_id,
                TripMetrics {
                    distance_km,
                    duration_secs,
                    fare,
                },
            )
            .await?;

        if let Some(driver_id) = completed.driver_id {
            self.release_driver(driver_id, RideOutcome::Completed).await;
        }
        Ok(completed)
    }

    pub async fn cancel_ride(
        &self,
        ride_id: Uuid,
        reason: String,
        actor: CancellationActor,
    ) -> Result<Ride, AppError> {
        if reason.trim().is_empty() {
            return Err(AppError::Validation(
                "cancellation reason cannot be empty".to_string(),
            ));
        }

        let ride = self.rides.cancel_ride(ride_id, reason, actor).await?;
        self.finish_cancellation(&ride, RideEventKind::Cancelled).await;
        Ok(ride)
    }

    pub async fn expired_requests(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<RideRequest>, AppError> {
        Ok(self.rides.durable().find_requests_expired_at(now).await?)
    }

    pub async fn expire_request(
        &self,
        ride_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Ride, AppError> {
        let request = self.get_request(ride_id).await?;
        if !request.is_expired(now) {
            return Err(AppError::Conflict(format!(
                "request for ride {ride_id} does not expire until {}",
                request.expires_at
            )));
        }

        let ride = self
            .rides
            .cancel_unassigned(
                ride_id,
                "no driver accepted within the maximum wait".to_string(),
                CancellationActor::System,
            )
            .await?;
        self.finish_cancellation(&ride, RideEventKind::Expired).await;
        Ok(ride)
    }

    pub async fn get_nearby_drivers(
        &self,
        lat: f64,
        lng: f64,
        radius_km: f64,
        ride_type: Option<RideType>,
    ) -> Result<Vec<NearbyDriver>, AppError> {
        self.locations
            .get_nearby_drivers(lat, lng, radius_km, ride_type)
            .await
    }

    /// Rider feedback on a completed ride's driver, accepted once per ride.
    pub async fn rate_ride(
        &self,
        ride_id: Uuid,
        rider_id: Uuid,
        rating: u8,
    ) -> Result<Driver, AppError> {
        if !(1..=5).contains(&rating) {
            return Err(AppError::Validation(format!(
                "rating must be between 1 and 5, got {rating}"
            )));
        }

        let ride = self.rides.get_by_id(ride_id).await?;
        if ride.rider_id != rider_id {
            return Err(AppError::Validation(format!(
                "rider {rider_id} did not take ride {ride_id}"
            )));
        }
        let driver_id = match (ride.status, ride.driver_id) {
            (RideStatus::Completed, Some(driver_id)) => driver_id,
            _ => {
                return Err(AppError::Conflict(format!(
                    "ride {ride_id} is {}; only completed rides can be rated",
                    ride.status
                )));
            }
        };

        // Claims the ride's single rating slot before touching the driver aggregate.
        self.rides.record_rating(ride_id, rating).await?;

        let update = DriverUpdate {
            rating_sample: Some(f64::from(rating)),
            ..DriverUpdate::at(Utc::now())
        };
        self.rides.update_driver_if(driver_id, None, update).await
    }

    /// Recomputes an area's multiplier from counted demand and the drivers currently in
    /// the area. Falls back to open ride requests in the area when the demand counter
    /// cannot be read.
    pub async fn refresh_surge(&self, area_id: Uuid) -> Result<SurgeArea, AppError> {
        let area = self.surge.get_area(area_id).await?;
        let supply = self.locations.get_drivers_in_area(area.bounds).await?.len();

        let demand = match self.surge.counted_demand(area_id).await {
            Some(demand) => demand,
            None => {
                let open = self
                    .rides
                    .find_rides(&RideFilter {
                        statuses: vec![RideStatus::Requested],
                        pickup_within: Some(area.bounds),
                        ..RideFilter::default()
                    })
                    .await?;
                u32::try_from(open.len()).unwrap_or(u32::MAX)
            }
        };

        self.surge
            .apply_reading(area_id, demand, u32::try_from(supply).unwrap_or(u32::MAX))
            .await
    }

    async fn estimate(
        &self,
        ride_type: RideType,
        pickup: &Location,
        dropoff: &Location,
        waypoints: &[Location],
        now: DateTime<Utc>,
    ) -> Result<Estimate, AppError> {
        let mut stops: Vec<GeoPoint> = Vec::with_capacity(waypoints.len() + 2);
        stops.push(pickup.point);
        stops.extend(waypoints.iter().map(|w| w.point));
        stops.push(dropoff.point);

        let route = self.router.route(&stops).await?;
        let multiplier = self.surge.multiplier_at(pickup.point, now).await?;
        let quote = fare::quote(ride_type, route.distance_km, route.duration_secs, multiplier)?;

        Ok(Estimate {
            quote,
            polyline: route.polyline,
        })
    }

    async fn ranked_candidates(
        &self,
        pickup: GeoPoint,
        radius_km: f64,
        ride_type: RideType,
        rejected: &[Uuid],
    ) -> Result<Vec<Uuid>, AppError> {
        let nearby = self
            .locations
            .nearby_excluding(pickup, radius_km, Some(ride_type), rejected)
            .await?;

        Ok(self
            .config
            .ranking_policy
            .rank(nearby)
            .into_iter()
            .map(|candidate| candidate.driver.id)
            .collect())
    }

    fn ensure_can_take(&self, driver: &Driver, ride_type: RideType) -> Result<(), AppError> {
        if !driver.is_dispatchable(Utc::now(), self.locations.freshness()) {
            return Err(AppError::Conflict(format!(
                "driver {} is not eligible for dispatch",
                driver.id
            )));
        }
        if !driver.supports(ride_type) {
            return Err(AppError::Validation(format!(
                "driver {} does not offer {} rides",
                driver.id,
                ride_type.as_str()
            )));
        }
        Ok(())
    }

    async fn change_request(
        &self,
        ride_id: Uuid,
        change: RequestChange,
    ) -> Result<RideRequest, AppError> {
        self.rides
            .durable()
            .update_request(ride_id, &change)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("no open request for ride {ride_id}")))
    }

    /// Runs after the ride write has committed; a leftover request is found again by
    /// the expiry poller and dropped there.
    async fn consume_request(&self, ride_id: Uuid) {
        match self.rides.durable().delete_request(ride_id).await {
            Ok(true) => self.metrics.open_ride_requests.dec(),
            Ok(false) => {}
            Err(err) => {
                error!(ride_id = %ride_id, error = %err, "failed to delete ride request");
            }
        }
    }

    async fn finish_cancellation(&self, ride: &Ride, kind: RideEventKind) {
        self.consume_request(ride.id).await;
        if let Some(driver_id) = ride.cancellation.as_ref().and_then(|c| c.driver_id) {
            self.release_driver(driver_id, RideOutcome::Cancelled).await;
        }

        self.metrics
            .ride_transitions_total
            .with_label_values(&[ride.status.as_str()])
            .inc();
        self.publish(RideEvent::for_ride(kind, ride)).await;
    }

    /// Cancels a ride whose request record could not be written, so the rider is not left
    /// holding an active ride nobody can accept.
    async fn abandon(&self, ride: &Ride) {
        let cancelled = self
            .rides
            .cancel_unassigned(
                ride.id,
                "ride request could not be recorded".to_string(),
                CancellationActor::System,
            )
            .await;
        match cancelled {
            Ok(_) => warn!(ride_id = %ride.id, "ride abandoned before dispatch"),
            Err(err) => error!(ride_id = %ride.id, error = %err, "failed to abandon ride"),
        }
    }

    /// The ride write has already committed; a failure here is logged, not returned.
    async fn release_driver(&self, driver_id: Uuid, outcome: RideOutcome) {
        let update = DriverUpdate {
            available: Some(true),
            ride_outcome: Some(outcome),
            ..DriverUpdate::at(Utc::now())
        };
        if let Err(err) = self.rides.update_driver_if(driver_id, None, update).await {
            error!(driver_id = %driver_id, error = %err, "failed to release driver");
        }
    }

    pub(crate) async fn publish(&self, event: RideEvent) {
        if let Err(err) = self.notifier.notify(&event).await {
            warn!(
                ride_id = %event.ride_id,
                kind = ?event.kind,
                error = %err,
                "ride notification dropped"
            );
        }
    }
}

struct Estimate {
    quote: FareQuote,
    polyline: Option<String>,
}
