use std::env;
use std::time::Duration;

use crate::engine::ranking::RankingPolicy;
use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub expiry_poll_interval_ms: u64,
    pub dispatch: DispatchConfig,
    pub location: LocationConfig,
    pub cache: CacheTtls,
    pub surge: SurgeConfig,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub search_radius_km: f64,
    pub max_wait_secs: u64,
    pub offer_batch_size: usize,
    pub ranking_policy: RankingPolicy,
}

#[derive(Debug, Clone)]
pub struct LocationConfig {
    pub freshness_secs: i64,
    pub nearby_cap: usize,
}

#[derive(Debug, Clone)]
pub struct CacheTtls {
    pub ride: Duration,
    pub driver_by_user: Duration,
    pub emergency: Duration,
}

#[derive(Debug, Clone)]
pub struct SurgeConfig {
    pub max_multiplier: f64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            search_radius_km: 5.0,
            max_wait_secs: 120,
            offer_batch_size: 1,
            ranking_policy: RankingPolicy::NearestThenRating,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            freshness_secs: 600,
            nearby_cap: 50,
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            ride: Duration::from_secs(15 * 60),
            driver_by_user: Duration::from_secs(30 * 60),
            emergency: Duration::from_secs(5 * 60),
        }
    }
}

impl Default for SurgeConfig {
    fn default() -> Self {
        Self {
            max_multiplier: 5.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            event_buffer_size: 1024,
            expiry_poll_interval_ms: 1000,
            dispatch: DispatchConfig::default(),
            location: LocationConfig::default(),
            cache: CacheTtls::default(),
            surge: SurgeConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        let config = Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            expiry_poll_interval_ms: parse_or_default(
                "EXPIRY_POLL_INTERVAL_MS",
                defaults.expiry_poll_interval_ms,
            )?,
            dispatch: DispatchConfig {
                search_radius_km: parse_or_default(
                    "SEARCH_RADIUS_KM",
                    defaults.dispatch.search_radius_km,
                )?,
                max_wait_secs: parse_or_default("MAX_WAIT_SECS", defaults.dispatch.max_wait_secs)?,
                offer_batch_size: parse_or_default(
                    "OFFER_BATCH_SIZE",
                    defaults.dispatch.offer_batch_size,
                )?,
                ranking_policy: parse_or_default(
                    "RANKING_POLICY",
                    defaults.dispatch.ranking_policy,
                )?,
            },
            location: LocationConfig {
                freshness_secs: parse_or_default(
                    "LOCATION_FRESHNESS_SECS",
                    defaults.location.freshness_secs,
                )?,
                nearby_cap: parse_or_default("NEARBY_DRIVER_CAP", defaults.location.nearby_cap)?,
            },
            cache: CacheTtls {
                ride: Duration::from_secs(parse_or_default("RIDE_CACHE_TTL_SECS", 15 * 60)?),
                driver_by_user: Duration::from_secs(parse_or_default(
                    "DRIVER_CACHE_TTL_SECS",
                    30 * 60,
                )?),
                emergency: Duration::from_secs(parse_or_default(
                    "EMERGENCY_CACHE_TTL_SECS",
                    5 * 60,
                )?),
            },
            surge: SurgeConfig {
                max_multiplier: parse_or_default(
                    "SURGE_MAX_MULTIPLIER",
                    defaults.surge.max_multiplier,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.dispatch.offer_batch_size == 0 {
            return Err(AppError::Internal("OFFER_BATCH_SIZE must be > 0".to_string()));
        }
        if !(self.dispatch.search_radius_km > 0.0) {
            return Err(AppError::Internal("SEARCH_RADIUS_KM must be > 0".to_string()));
        }
        if self.location.nearby_cap == 0 {
            return Err(AppError::Internal("NEARBY_DRIVER_CAP must be > 0".to_string()));
        }
        if !(self.surge.max_multiplier >= 1.0) {
            return Err(AppError::Internal(
                "SURGE_MAX_MULTIPLIER must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
