use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::ride::RideType;

pub const MAX_DISTANCE_KM: f64 = 1_000.0;
pub const MAX_DURATION_SECS: u32 = 86_400;
pub const MAX_FARE: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FareSchedule {
    pub base_fare: f64,
    pub price_per_km: f64,
    pub price_per_minute: f64,
    pub minimum_fare: f64,
}

impl FareSchedule {
    pub fn for_ride_type(ride_type: RideType) -> Self {
        match ride_type {
            RideType::Economy => Self {
                base_fare: 2.50,
                price_per_km: 1.20,
                price_per_minute: 0.25,
                minimum_fare: 6.00,
            },
            RideType::Comfort => Self {
                base_fare: 3.50,
                price_per_km: 1.60,
                price_per_minute: 0.35,
                minimum_fare: 8.00,
            },
            RideType::Premium => Self {
                base_fare: 6.00,
                price_per_km: 2.80,
                price_per_minute: 0.60,
                minimum_fare: 15.00,
            },
            RideType::Xl => Self {
                base_fare: 4.50,
                price_per_km: 2.00,
                price_per_minute: 0.45,
                minimum_fare: 10.00,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FareQuote {
    pub ride_type: RideType,
    pub distance_km: f64,
    pub duration_secs: u32,
    pub surge_multiplier: f64,
    pub fare: f64,
}

/// `max(minimum, base + per_km * km + per_minute * minutes) * surge`, rounded to cents.
/// Inputs and result outside their allowed ranges are rejected, never clamped.
pub fn compute_fare(
    schedule: &FareSchedule,
    distance_km: f64,
    duration_secs: u32,
    surge_multiplier: f64,
) -> Result<f64, AppError> {
    if !distance_km.is_finite() || !(0.0..=MAX_DISTANCE_KM).contains(&distance_km) {
        return Err(AppError::Validation(format!(
            "distance {distance_km} km is outside [0, {MAX_DISTANCE_KM}]"
        )));
    }
    if duration_secs > MAX_DURATION_SECS {
        return Err(AppError::Validation(format!(
            "duration {duration_secs} s is outside [0, {MAX_DURATION_SECS}]"
        )));
    }
    if !surge_multiplier.is_finite() || surge_multiplier < 1.0 {
        return Err(AppError::Validation(format!(
            "surge multiplier {surge_multiplier} must be >= 1.0"
        )));
    }

    let minutes = f64::from(duration_secs) / 60.0;
    let metered = schedule.base_fare
        + schedule.price_per_km * distance_km
        + schedule.price_per_minute * minutes;
    let fare = round_to_cents(metered.max(schedule.minimum_fare) * surge_multiplier);

    if fare > MAX_FARE {
        return Err(AppError::Validation(format!(
            "fare {fare} exceeds the maximum of {MAX_FARE}"
        )));
    }
    Ok(fare)
}

pub fn quote(
    ride_type: RideType,
    distance_km: f64,
    duration_secs: u32,
    surge_multiplier: f64,
) -> Result<FareQuote, AppError> {
    let fare = compute_fare(
        &FareSchedule::for_ride_type(ride_type),
        distance_km,
        duration_secs,
        surge_multiplier,
    )?;
    Ok(FareQuote {
        ride_type,
        distance_km,
        duration_secs,
        surge_multiplier,
        fare,
    })
}

fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
