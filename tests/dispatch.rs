use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use ride_dispatch::adapters::{MemoryCache, MemoryStore, StraightLineRouter};
use ride_dispatch::config::Config;
use ride_dispatch::engine::dispatch::{RideRequestInput, TripActuals};
use ride_dispatch::engine::emergency::EmergencyInput;
use ride_dispatch::engine::fare::{FareSchedule, compute_fare};
use ride_dispatch::engine::surge::NewSurgeArea;
use ride_dispatch::error::{AppError, NotifyError, StoreError};
use ride_dispatch::models::driver::{Compliance, Driver, DriverStatus, DriverUpdate};
use ride_dispatch::models::emergency::EmergencyAlert;
use ride_dispatch::models::event::{RideEvent, RideEventKind};
use ride_dispatch::models::location::{BoundingBox, GeoPoint, Location};
use ride_dispatch::models::request::{RequestChange, RideRequest};
use ride_dispatch::models::ride::{CancellationActor, Ride, RideStatus, RideTransition, RideType};
use ride_dispatch::models::surge::{SurgeArea, SurgeReading};
use ride_dispatch::ports::{Conditional, DriverQuery, DurableStore, Notifier, RideFilter};
use ride_dispatch::state::{Adapters, AppState};
use ride_dispatch::store::cache::keys;
use uuid::Uuid;

const KM_PER_DEGREE: f64 = 111.19493;
const PICKUP: (f64, f64) = (40.000, -73.000);

struct Harness {
    state: Arc<AppState>,
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
}

fn harness() -> Harness {
    harness_with(None)
}

fn harness_with(notifier: Option<Arc<dyn Notifier>>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    harness_on(store.clone(), store, notifier)
}

/// `durable` is what the service writes through; `store` is the memory store underneath
/// it, used by the tests for seeding and inspection.
fn harness_on(
    durable: Arc<dyn DurableStore>,
    store: Arc<MemoryStore>,
    notifier: Option<Arc<dyn Notifier>>,
) -> Harness {
    let cache = Arc::new(MemoryCache::new());
    let state = AppState::with_adapters(
        &Config::default(),
        Adapters {
            store: durable,
            cache: cache.clone(),
            router: Arc::new(StraightLineRouter),
            notifier,
        },
    );
    Harness {
        state: Arc::new(state),
        store,
        cache,
    }
}

fn north_of_pickup(km: f64) -> GeoPoint {
    GeoPoint::new(PICKUP.0 + km / KM_PER_DEGREE, PICKUP.1)
}

fn driver_at(point: GeoPoint, seen_at: DateTime<Utc>, rating: f64) -> Driver {
    let now = Utc::now();
    Driver {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        name: "Test Driver".to_string(),
        vehicle_id: Uuid::new_v4(),
        ride_types: vec![RideType::Economy, RideType::Comfort],
        status: DriverStatus::Online,
        available: true,
        location: Some(point),
        location_updated_at: Some(seen_at),
        compliance: Compliance::approved(),
        rating,
        rating_count: 10,
        completed_rides: 0,
        cancelled_rides: 0,
        created_at: now,
        updated_at: now,
    }
}

async fn add_driver(store: &MemoryStore, km: f64) -> Driver {
    let driver = driver_at(north_of_pickup(km), Utc::now(), 4.8);
    store.insert_driver(&driver).await.unwrap();
    driver
}

fn ride_input(rider_id: Uuid) -> RideRequestInput {
    RideRequestInput {
        rider_id,
        ride_type: "economy".to_string(),
        pickup: Location::at(PICKUP.0, PICKUP.1),
        dropoff: Location::at(40.05, -73.02),
        waypoints: Vec::new(),
        search_radius_km: Some(5.0),
        max_wait_secs: None,
    }
}

async fn accepted_ride(h: &Harness) -> (Uuid, Driver) {
    let driver = add_driver(&h.store, 1.0).await;
    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();
    h.state
        .dispatch
        .assign_driver(request.ride_id, driver.id)
        .await
        .unwrap();
    (request.ride_id, driver)
}

#[tokio::test]
async fn nearby_drivers_are_fresh_and_nearest_first() {
    let h = harness();
    let one = add_driver(&h.store, 1.0).await;
    let three = add_driver(&h.store, 3.0).await;
    add_driver(&h.store, 6.0).await;
    let stale = driver_at(north_of_pickup(2.0), Utc::now() - Duration::minutes(11), 5.0);
    h.store.insert_driver(&stale).await.unwrap();

    let nearby = h
        .state
        .dispatch
        .get_nearby_drivers(PICKUP.0, PICKUP.1, 5.0, None)
        .await
        .unwrap();

    let ids: Vec<Uuid> = nearby.iter().map(|n| n.driver.id).collect();
    assert_eq!(ids, vec![one.id, three.id]);
    assert!((nearby[0].distance_km - 1.0).abs() < 0.01);
    assert!((nearby[1].distance_km - 3.0).abs() < 0.01);
}

#[tokio::test]
async fn nearby_query_is_capped() {
    let h = harness();
    for i in 0..60 {
        add_driver(&h.store, 0.05 * f64::from(i)).await;
    }

    let nearby = h
        .state
        .dispatch
        .get_nearby_drivers(PICKUP.0, PICKUP.1, 10.0, None)
        .await
        .unwrap();
    assert_eq!(nearby.len(), 50);
    assert!(
        nearby
            .windows(2)
            .all(|pair| pair[0].distance_km <= pair[1].distance_km)
    );
}

#[tokio::test]
async fn area_query_uses_the_same_eligibility() {
    let h = harness();
    let inside = add_driver(&h.store, 1.0).await;
    let mut offline = driver_at(north_of_pickup(1.5), Utc::now(), 4.0);
    offline.status = DriverStatus::Offline;
    offline.available = false;
    h.store.insert_driver(&offline).await.unwrap();

    let drivers = h
        .state
        .dispatch
        .locations()
        .get_drivers_in_area(BoundingBox {
            min_lat: 39.9,
            min_lng: -73.1,
            max_lat: 40.1,
            max_lng: -72.9,
        })
        .await
        .unwrap();

    assert_eq!(drivers.len(), 1);
    assert_eq!(drivers[0].id, inside.id);
}

#[tokio::test]
async fn request_ranks_candidates_and_prices_the_trip() {
    let h = harness();
    let far = add_driver(&h.store, 3.0).await;
    let near = add_driver(&h.store, 1.0).await;

    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();

    assert_eq!(request.candidate_drivers, vec![near.id, far.id]);
    assert!(request.requested_drivers.is_empty());

    let ride = h.state.rides.get_by_id(request.ride_id).await.unwrap();
    assert_eq!(ride.status, RideStatus::Requested);
    assert!(ride.ride_number.starts_with("RD-"));
    assert_eq!(ride.surge_multiplier, 1.0);
    assert!(ride.estimated.fare >= FareSchedule::for_ride_type(RideType::Economy).minimum_fare);
}

#[tokio::test]
async fn rider_cannot_hold_two_active_rides() {
    let h = harness();
    add_driver(&h.store, 1.0).await;
    let rider = Uuid::new_v4();

    h.state.dispatch.request_ride(ride_input(rider)).await.unwrap();
    let second = h.state.dispatch.request_ride(ride_input(rider)).await;

    assert!(matches!(second, Err(AppError::Conflict(_))));
}

#[tokio::test]
async fn invalid_request_input_is_rejected() {
    let h = harness();

    let mut input = ride_input(Uuid::new_v4());
    input.ride_type = "limo".to_string();
    let result = h.state.dispatch.request_ride(input).await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    let mut input = ride_input(Uuid::new_v4());
    input.pickup = Location::at(91.0, 0.0);
    let result = h.state.dispatch.request_ride(input).await;
    assert!(matches!(result, Err(AppError::Validation(_))));

    assert_eq!(h.store.ride_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_accepts_have_exactly_one_winner() {
    let h = harness();
    let mut drivers = Vec::new();
    for i in 0..8 {
        drivers.push(add_driver(&h.store, 0.5 + 0.1 * f64::from(i)).await);
    }
    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for driver in &drivers {
        let state = h.state.clone();
        let ride_id = request.ride_id;
        let driver_id = driver.id;
        handles.push(tokio::spawn(async move {
            state.dispatch.assign_driver(ride_id, driver_id).await
        }));
    }

    let mut winners = Vec::new();
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(ride) => winners.push(ride),
            Err(AppError::Conflict(_)) => conflicts += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(conflicts, drivers.len() - 1);
    assert_eq!(winners[0].status, RideStatus::Accepted);

    let winner_id = winners[0].driver_id.unwrap();
    let stored = h.state.rides.get_by_id(request.ride_id).await.unwrap();
    assert_eq!(stored.driver_id, Some(winner_id));

    for driver in &drivers {
        let current = h.state.rides.get_driver(driver.id).await.unwrap();
        assert_eq!(current.available, driver.id != winner_id);
    }
    assert_eq!(h.store.request_count(), 0);
}

#[tokio::test]
async fn ride_follows_the_lifecycle() {
    let h = harness();
    let (ride_id, driver) = accepted_ride(&h).await;
    let dispatch = &h.state.dispatch;

    let ride = dispatch
        .update_ride_status(ride_id, RideStatus::DriverArrived, None)
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::DriverArrived);
    assert!(ride.timeline.driver_arrived_at.is_some());

    let ride = dispatch
        .update_ride_status(ride_id, RideStatus::InProgress, None)
        .await
        .unwrap();
    assert!(ride.timeline.started_at.is_some());

    h.state.rides.get_by_id(ride_id).await.unwrap();
    assert!(h.cache.contains(&keys::ride(ride_id)));

    let ride = dispatch
        .update_ride_status(
            ride_id,
            RideStatus::Completed,
            Some(TripActuals {
                distance_km: 7.5,
                duration_secs: 1_200,
            }),
        )
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Completed);
    let actual = ride.actual.unwrap();
    assert_eq!(actual.distance_km, 7.5);
    assert_eq!(
        actual.fare,
        compute_fare(
            &FareSchedule::for_ride_type(RideType::Economy),
            7.5,
            1_200,
            1.0
        )
        .unwrap()
    );
    assert!(!h.cache.contains(&keys::ride(ride_id)));

    let reread = h.state.rides.get_by_id(ride_id).await.unwrap();
    assert_eq!(reread.status, RideStatus::Completed);
    assert!(!h.cache.contains(&keys::ride(ride_id)));

    let released = h.state.rides.get_driver(driver.id).await.unwrap();
    assert!(released.available);
    assert_eq!(released.completed_rides, 1);
}

#[tokio::test]
async fn invalid_transitions_conflict_and_leave_the_ride_unchanged() {
    let h = harness();
    add_driver(&h.store, 1.0).await;
    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();
    let dispatch = &h.state.dispatch;

    for target in [
        RideStatus::DriverArrived,
        RideStatus::InProgress,
        RideStatus::Completed,
        RideStatus::Accepted,
        RideStatus::Requested,
    ] {
        let result = dispatch
            .update_ride_status(request.ride_id, target, None)
            .await;
        assert!(
            matches!(result, Err(AppError::Conflict(_))),
            "{target} from requested should conflict"
        );
    }

    let ride = h.state.rides.get_by_id(request.ride_id).await.unwrap();
    assert_eq!(ride.status, RideStatus::Requested);
    assert!(ride.driver_id.is_none());
}

#[tokio::test]
async fn terminal_rides_cannot_move_and_are_not_cached() {
    let h = harness();
    let (ride_id, driver) = accepted_ride(&h).await;

    h.state.rides.get_by_id(ride_id).await.unwrap();
    assert!(h.cache.contains(&keys::ride(ride_id)));

    let cancelled = h
        .state
        .dispatch
        .cancel_ride(ride_id, "changed plans".to_string(), CancellationActor::Rider)
        .await
        .unwrap();
    assert_eq!(cancelled.status, RideStatus::Cancelled);
    assert!(cancelled.driver_id.is_none());
    assert_eq!(
        cancelled.cancellation.as_ref().and_then(|c| c.driver_id),
        Some(driver.id)
    );
    assert!(!h.cache.contains(&keys::ride(ride_id)));

    let again = h.state.rides.get_by_id(ride_id).await.unwrap();
    assert_eq!(again.status, RideStatus::Cancelled);
    assert!(!h.cache.contains(&keys::ride(ride_id)));

    let result = h
        .state
        .dispatch
        .cancel_ride(ride_id, "again".to_string(), CancellationActor::Rider)
        .await;
    assert!(matches!(result, Err(AppError::Conflict(_))));

    let driver = h.state.rides.get_driver(driver.id).await.unwrap();
    assert!(driver.available);
    assert_eq!(driver.cancelled_rides, 1);
}

#[tokio::test]
async fn ride_number_key_can_serve_a_stale_copy() {
    let h = harness();
    let driver = add_driver(&h.store, 1.0).await;
    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();

    let ride = h.state.rides.get_by_id(request.ride_id).await.unwrap();
    h.state
        .dispatch
        .assign_driver(request.ride_id, driver.id)
        .await
        .unwrap();

    let by_id = h.state.rides.get_by_id(request.ride_id).await.unwrap();
    let by_number = h.state.rides.get_by_number(&ride.ride_number).await.unwrap();
    assert_eq!(by_id.status, RideStatus::Accepted);
    assert_eq!(by_number.status, RideStatus::Requested);
}

#[tokio::test]
async fn cache_outage_does_not_fail_operations() {
    let h = harness();
    let driver = add_driver(&h.store, 1.0).await;
    h.cache.set_offline(true);

    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();
    let ride = h
        .state
        .dispatch
        .assign_driver(request.ride_id, driver.id)
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Accepted);

    let fetched = h.state.rides.get_by_id(request.ride_id).await.unwrap();
    assert_eq!(fetched.status, RideStatus::Accepted);

    let failures: u64 = ["get", "set", "delete", "increment"]
        .iter()
        .map(|op| {
            h.state
                .metrics
                .cache_failures_total
                .with_label_values(&[op])
                .get()
        })
        .sum();
    assert!(failures > 0);
}

#[tokio::test]
async fn rejection_moves_the_offer_to_the_next_driver() {
    let h = harness();
    let near = add_driver(&h.store, 1.0).await;
    let far = add_driver(&h.store, 2.0).await;
    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();
    let dispatch = &h.state.dispatch;

    let offer = dispatch.offer_next(request.ride_id).await.unwrap();
    assert_eq!(offer.drivers, vec![near.id]);

    let updated = dispatch.reject_offer(request.ride_id, near.id).await.unwrap();
    assert_eq!(updated.rejected_drivers, vec![near.id]);
    assert!(!updated.candidate_drivers.contains(&near.id));

    let offer = dispatch.offer_next(request.ride_id).await.unwrap();
    assert_eq!(offer.drivers, vec![far.id]);

    let result = dispatch.assign_driver(request.ride_id, near.id).await;
    assert!(matches!(result, Err(AppError::Conflict(_))));
    let current = h.state.rides.get_driver(near.id).await.unwrap();
    assert!(current.available);

    let ride = dispatch.assign_driver(request.ride_id, far.id).await.unwrap();
    assert_eq!(ride.driver_id, Some(far.id));
}

#[tokio::test]
async fn offer_without_drivers_is_unavailable() {
    let h = harness();
    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();
    assert!(request.candidate_drivers.is_empty());

    let result = h.state.dispatch.offer_next(request.ride_id).await;
    assert!(matches!(result, Err(AppError::Unavailable(_))));
}

#[tokio::test]
async fn expiry_is_detected_by_the_caller() {
    let h = harness();
    let mut input = ride_input(Uuid::new_v4());
    input.max_wait_secs = Some(30);
    let request = h.state.dispatch.request_ride(input).await.unwrap();
    let dispatch = &h.state.dispatch;

    let early = dispatch.expire_request(request.ride_id, Utc::now()).await;
    assert!(matches!(early, Err(AppError::Conflict(_))));

    let later = request.expires_at + Duration::seconds(1);
    let due = dispatch.expired_requests(later).await.unwrap();
    assert_eq!(due.len(), 1);

    let ride = dispatch.expire_request(request.ride_id, later).await.unwrap();
    assert_eq!(ride.status, RideStatus::Cancelled);
    assert_eq!(
        ride.cancellation.map(|c| c.actor),
        Some(CancellationActor::System)
    );
    assert!(matches!(
        dispatch.get_request(request.ride_id).await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(h.state.metrics.open_ride_requests.get(), 0);
}

#[tokio::test]
async fn surge_is_frozen_at_request_time() {
    let h = harness();
    let driver = add_driver(&h.store, 1.0).await;
    let surge = h.state.dispatch.surge();
    let area = surge
        .define_area(NewSurgeArea {
            name: "downtown".to_string(),
            bounds: BoundingBox {
                min_lat: 39.9,
                min_lng: -73.1,
                max_lat: 40.1,
                max_lng: -72.9,
            },
            starts_at: None,
            ends_at: None,
        })
        .await
        .unwrap();
    surge.apply_reading(area.id, 20, 10).await.unwrap();

    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();
    let ride = h.state.rides.get_by_id(request.ride_id).await.unwrap();
    assert_eq!(ride.surge_multiplier, 2.0);

    surge.apply_reading(area.id, 0, 10).await.unwrap();

    let dispatch = &h.state.dispatch;
    dispatch.assign_driver(ride.id, driver.id).await.unwrap();
    dispatch
        .update_ride_status(ride.id, RideStatus::DriverArrived, None)
        .await
        .unwrap();
    dispatch
        .update_ride_status(ride.id, RideStatus::InProgress, None)
        .await
        .unwrap();
    let done = dispatch
        .update_ride_status(
            ride.id,
            RideStatus::Completed,
            Some(TripActuals {
                distance_km: 6.0,
                duration_secs: 900,
            }),
        )
        .await
        .unwrap();

    let expected = compute_fare(
        &FareSchedule::for_ride_type(RideType::Economy),
        6.0,
        900,
        2.0,
    )
    .unwrap();
    assert_eq!(done.actual.unwrap().fare, expected);
}

#[tokio::test]
async fn refresh_counts_demand_against_area_supply() {
    let h = harness();
    add_driver(&h.store, 1.0).await;
    let area = h
        .state
        .dispatch
        .surge()
        .define_area(NewSurgeArea {
            name: "downtown".to_string(),
            bounds: BoundingBox {
                min_lat: 39.9,
                min_lng: -73.1,
                max_lat: 40.1,
                max_lng: -72.9,
            },
            starts_at: None,
            ends_at: None,
        })
        .await
        .unwrap();

    for _ in 0..3 {
        h.state
            .dispatch
            .request_ride(ride_input(Uuid::new_v4()))
            .await
            .unwrap();
    }

    let refreshed = h.state.dispatch.refresh_surge(area.id).await.unwrap();
    assert_eq!(refreshed.demand, 3);
    assert_eq!(refreshed.supply, 1);
    assert_eq!(refreshed.multiplier, 3.0);
}

#[tokio::test]
async fn emergency_alert_lifecycle() {
    let h = harness();
    let (ride_id, driver) = accepted_ride(&h).await;
    let responder = add_driver(&h.store, 2.0).await;
    let ride = h.state.rides.get_by_id(ride_id).await.unwrap();
    let dispatch = &h.state.dispatch;

    let outsider = dispatch
        .raise_emergency(
            ride_id,
            EmergencyInput {
                raised_by: Uuid::new_v4(),
                location: None,
                message: None,
            },
        )
        .await;
    assert!(matches!(outsider, Err(AppError::Validation(_))));

    let alert = dispatch
        .raise_emergency(
            ride_id,
            EmergencyInput {
                raised_by: ride.rider_id,
                location: None,
                message: Some("help".to_string()),
            },
        )
        .await
        .unwrap();
    assert!(alert.is_open());
    assert!(alert.nearby_drivers.contains(&responder.id));
    assert!(!alert.nearby_drivers.contains(&driver.id));

    let duplicate = dispatch
        .raise_emergency(
            ride_id,
            EmergencyInput {
                raised_by: driver.user_id,
                location: None,
                message: None,
            },
        )
        .await;
    assert!(matches!(duplicate, Err(AppError::Conflict(_))));

    let active = dispatch.active_emergency(ride_id).await.unwrap();
    assert_eq!(active.id, alert.id);

    let resolved = dispatch.resolve_emergency(ride_id).await.unwrap();
    assert!(!resolved.is_open());
    assert!(matches!(
        dispatch.active_emergency(ride_id).await,
        Err(AppError::NotFound(_))
    ));
}

struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn notify(&self, _event: &RideEvent) -> Result<(), NotifyError> {
        Err(NotifyError::Delivery("push gateway down".to_string()))
    }
}

#[tokio::test]
async fn notification_failures_do_not_fail_dispatch() {
    let h = harness_with(Some(Arc::new(FailingNotifier)));
    let driver = add_driver(&h.store, 1.0).await;
    let mut events = h.state.ride_events_tx.subscribe();

    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();
    let ride = h
        .state
        .dispatch
        .assign_driver(request.ride_id, driver.id)
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Accepted);

    let first = events.recv().await.unwrap();
    assert_eq!(first.ride_id, request.ride_id);
}

#[tokio::test]
async fn rating_requires_a_completed_ride() {
    let h = harness();
    let (ride_id, driver) = accepted_ride(&h).await;
    let ride = h.state.rides.get_by_id(ride_id).await.unwrap();
    let dispatch = &h.state.dispatch;

    let early = dispatch.rate_ride(ride_id, ride.rider_id, 5).await;
    assert!(matches!(early, Err(AppError::Conflict(_))));

    dispatch
        .update_ride_status(ride_id, RideStatus::DriverArrived, None)
        .await
        .unwrap();
    dispatch
        .update_ride_status(ride_id, RideStatus::InProgress, None)
        .await
        .unwrap();
    dispatch
        .update_ride_status(ride_id, RideStatus::Completed, None)
        .await
        .unwrap();

    let out_of_range = dispatch.rate_ride(ride_id, ride.rider_id, 6).await;
    assert!(matches!(out_of_range, Err(AppError::Validation(_))));

    let rated = dispatch.rate_ride(ride_id, ride.rider_id, 3).await.unwrap();
    assert_eq!(rated.id, driver.id);
    assert_eq!(rated.rating_count, 11);
    assert!(rated.rating < 4.8);

    let again = dispatch.rate_ride(ride_id, ride.rider_id, 1).await;
    assert!(matches!(again, Err(AppError::Conflict(_))));

    let driver = h.state.rides.get_driver(driver.id).await.unwrap();
    assert_eq!(driver.rating_count, 11);
    assert_eq!(driver.rating, rated.rating);
    let ride = h.state.rides.get_by_id(ride_id).await.unwrap();
    assert_eq!(ride.rider_rating, Some(3));
}

#[tokio::test]
async fn concurrent_ratings_count_once() {
    let h = harness();
    let (ride_id, driver) = accepted_ride(&h).await;
    let rider_id = h.state.rides.get_by_id(ride_id).await.unwrap().rider_id;
    let dispatch = &h.state.dispatch;
    for target in [
        RideStatus::DriverArrived,
        RideStatus::InProgress,
        RideStatus::Completed,
    ] {
        dispatch
            .update_ride_status(ride_id, target, None)
            .await
            .unwrap();
    }

    let results = join_all((0..8).map(|_| dispatch.rate_ride(ride_id, rider_id, 5))).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(AppError::is_conflict)
    );
    let driver = h.state.rides.get_driver(driver.id).await.unwrap();
    assert_eq!(driver.rating_count, 11);
}

#[tokio::test]
async fn driver_on_an_active_ride_cannot_reopen_availability() {
    let h = harness();
    let (ride_id, driver) = accepted_ride(&h).await;

    let reopened = h
        .state
        .rides
        .update_driver(driver.id, DriverUpdate::availability(Utc::now(), true))
        .await;
    assert!(matches!(reopened, Err(AppError::Conflict(_))));
    assert!(!h.state.rides.get_driver(driver.id).await.unwrap().available);

    let second = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();
    let taken = h.state.dispatch.assign_driver(second.ride_id, driver.id).await;
    assert!(matches!(taken, Err(AppError::Conflict(_))));

    h.state
        .dispatch
        .cancel_ride(ride_id, "rider left".to_string(), CancellationActor::Rider)
        .await
        .unwrap();
    let driver = h
        .state
        .rides
        .update_driver(driver.id, DriverUpdate::availability(Utc::now(), true))
        .await
        .unwrap();
    assert!(driver.available);
}

/// Delegates to a memory store; individual request writes can be switched to fail.
struct FlakyStore {
    inner: Arc<MemoryStore>,
    fail_insert_request: AtomicBool,
    fail_delete_request: AtomicBool,
}

impl FlakyStore {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_insert_request: AtomicBool::new(false),
            fail_delete_request: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("request collection unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn insert_ride(&self, ride: &Ride) -> Result<(), StoreError> {
        self.inner.insert_ride(ride).await
    }

    async fn find_ride(&self, id: Uuid) -> Result<Option<Ride>, StoreError> {
        self.inner.find_ride(id).await
    }

    async fn find_ride_by_number(&self, ride_number: &str) -> Result<Option<Ride>, StoreError> {
        self.inner.find_ride_by_number(ride_number).await
    }

    async fn find_rides(&self, filter: &RideFilter) -> Result<Vec<Ride>, StoreError> {
        self.inner.find_rides(filter).await
    }

    async fn update_ride_if(
        &self,
        id: Uuid,
        expected: &[RideStatus],
        transition: &RideTransition,
    ) -> Result<Conditional<Ride>, StoreError> {
        self.inner.update_ride_if(id, expected, transition).await
    }

    async fn record_rating(
        &self,
        id: Uuid,
        rating: u8,
        at: DateTime<Utc>,
    ) -> Result<Conditional<Ride>, StoreError> {
        self.inner.record_rating(id, rating, at).await
    }

    async fn insert_driver(&self, driver: &Driver) -> Result<(), StoreError> {
        self.inner.insert_driver(driver).await
    }

    async fn find_driver(&self, id: Uuid) -> Result<Option<Driver>, StoreError> {
        self.inner.find_driver(id).await
    }

    async fn find_driver_by_user(&self, user_id: Uuid) -> Result<Option<Driver>, StoreError> {
        self.inner.find_driver_by_user(user_id).await
    }

    async fn update_driver_if(
        &self,
        id: Uuid,
        expected_available: Option<bool>,
        update: &DriverUpdate,
    ) -> Result<Conditional<Driver>, StoreError> {
        self.inner.update_driver_if(id, expected_available, update).await
    }

    async fn find_drivers_within_radius(
        &self,
        center: GeoPoint,
        radius_km: f64,
        query: &DriverQuery,
    ) -> Result<Vec<(Driver, f64)>, StoreError> {
        self.inner
            .find_drivers_within_radius(center, radius_km, query)
            .await
    }

    async fn find_drivers_within_box(
        &self,
        bounds: BoundingBox,
        query: &DriverQuery,
    ) -> Result<Vec<Driver>, StoreError> {
        self.inner.find_drivers_within_box(bounds, query).await
    }

    async fn insert_request(&self, request: &RideRequest) -> Result<(), StoreError> {
        Self::check(&self.fail_insert_request)?;
        self.inner.insert_request(request).await
    }

    async fn find_request(&self, ride_id: Uuid) -> Result<Option<RideRequest>, StoreError> {
        self.inner.find_request(ride_id).await
    }

    async fn update_request(
        &self,
        ride_id: Uuid,
        change: &RequestChange,
    ) -> Result<Option<RideRequest>, StoreError> {
        self.inner.update_request(ride_id, change).await
    }

    async fn find_requests_expired_at(
        &self,
        at: DateTime<Utc>,
    ) -> Result<Vec<RideRequest>, StoreError> {
        self.inner.find_requests_expired_at(at).await
    }

    async fn delete_request(&self, ride_id: Uuid) -> Result<bool, StoreError> {
        Self::check(&self.fail_delete_request)?;
        self.inner.delete_request(ride_id).await
    }

    async fn upsert_surge_area(&self, area: &SurgeArea) -> Result<(), StoreError> {
        self.inner.upsert_surge_area(area).await
    }

    async fn find_surge_area(&self, id: Uuid) -> Result<Option<SurgeArea>, StoreError> {
        self.inner.find_surge_area(id).await
    }

    async fn find_surge_areas_containing(
        &self,
        point: GeoPoint,
    ) -> Result<Vec<SurgeArea>, StoreError> {
        self.inner.find_surge_areas_containing(point).await
    }

    async fn update_surge_reading(
        &self,
        id: Uuid,
        reading: &SurgeReading,
    ) -> Result<Option<SurgeArea>, StoreError> {
        self.inner.update_surge_reading(id, reading).await
    }

    async fn insert_emergency(&self, alert: &EmergencyAlert) -> Result<(), StoreError> {
        self.inner.insert_emergency(alert).await
    }

    async fn find_open_emergency_for_ride(
        &self,
        ride_id: Uuid,
    ) -> Result<Option<EmergencyAlert>, StoreError> {
        self.inner.find_open_emergency_for_ride(ride_id).await
    }

    async fn resolve_emergency(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Conditional<EmergencyAlert>, StoreError> {
        self.inner.resolve_emergency(id, at).await
    }
}

fn flaky_harness() -> (Harness, Arc<FlakyStore>) {
    let store = Arc::new(MemoryStore::new());
    let flaky = Arc::new(FlakyStore::new(store.clone()));
    (harness_on(flaky.clone(), store, None), flaky)
}

#[tokio::test]
async fn failed_request_write_does_not_strand_the_rider() {
    let (h, flaky) = flaky_harness();
    add_driver(&h.store, 1.0).await;
    let rider = Uuid::new_v4();

    flaky.fail_insert_request.store(true, Ordering::SeqCst);
    let failed = h.state.dispatch.request_ride(ride_input(rider)).await;
    assert!(matches!(failed, Err(AppError::Store(_))));

    let rides = h.state.rides.rides_for_rider(rider).await.unwrap();
    assert_eq!(rides.len(), 1);
    assert_eq!(rides[0].status, RideStatus::Cancelled);
    assert_eq!(
        rides[0].cancellation.as_ref().map(|c| c.actor),
        Some(CancellationActor::System)
    );

    flaky.fail_insert_request.store(false, Ordering::SeqCst);
    let retried = h.state.dispatch.request_ride(ride_input(rider)).await.unwrap();
    assert_eq!(h.store.request_count(), 1);
    assert_ne!(retried.ride_id, rides[0].id);
}

#[tokio::test]
async fn committed_transitions_survive_request_cleanup_failures() {
    let (h, flaky) = flaky_harness();
    let driver = add_driver(&h.store, 1.0).await;
    let request = h
        .state
        .dispatch
        .request_ride(ride_input(Uuid::new_v4()))
        .await
        .unwrap();

    flaky.fail_delete_request.store(true, Ordering::SeqCst);
    let ride = h
        .state
        .dispatch
        .assign_driver(request.ride_id, driver.id)
        .await
        .unwrap();
    assert_eq!(ride.status, RideStatus::Accepted);
    assert_eq!(h.store.request_count(), 1);

    let cancelled = h
        .state
        .dispatch
        .cancel_ride(ride.id, "changed plans".to_string(), CancellationActor::Rider)
        .await
        .unwrap();
    assert_eq!(cancelled.status, RideStatus::Cancelled);
    assert!(h.state.rides.get_driver(driver.id).await.unwrap().available);

    flaky.fail_delete_request.store(false, Ordering::SeqCst);
    let stale = h
        .state
        .dispatch
        .assign_driver(request.ride_id, driver.id)
        .await;
    assert!(matches!(stale, Err(AppError::Conflict(_))));
}

struct StalledNotifier;

#[async_trait]
impl Notifier for StalledNotifier {
    async fn notify(&self, _event: &RideEvent) -> Result<(), NotifyError> {
        tokio::time::sleep(StdDuration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test]
async fn slow_push_delivery_does_not_hold_up_dispatch() {
    let h = harness_with(Some(Arc::new(StalledNotifier)));
    let driver = add_driver(&h.store, 1.0).await;
    let mut events = h.state.ride_events_tx.subscribe();

    let accepted = tokio::time::timeout(StdDuration::from_secs(2), async {
        let request = h
            .state
            .dispatch
            .request_ride(ride_input(Uuid::new_v4()))
            .await
            .unwrap();
        h.state
            .dispatch
            .assign_driver(request.ride_id, driver.id)
            .await
            .unwrap()
    })
    .await
    .expect("dispatch waited on push delivery");
    assert_eq!(accepted.status, RideStatus::Accepted);

    assert_eq!(events.recv().await.unwrap().kind, RideEventKind::Requested);
    assert_eq!(events.recv().await.unwrap().kind, RideEventKind::Accepted);
}
