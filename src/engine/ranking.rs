use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::engine::location::NearbyDriver;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RankingPolicy {
    #[default]
    NearestThenRating,
    RatingThenNearest,
}

/// Distances are compared in whole millimetres so near-equal candidates fall to the
/// rating tiebreak while the ordering stays total.
const DISTANCE_BUCKETS_PER_KM: f64 = 1e6;

fn distance_bucket(distance_km: f64) -> i64 {
    (distance_km * DISTANCE_BUCKETS_PER_KM).round() as i64
}

impl RankingPolicy {
    pub fn compare(self, a: &NearbyDriver, b: &NearbyDriver) -> Ordering {
        let by_distance = || distance_bucket(a.distance_km).cmp(&distance_bucket(b.distance_km));
        let by_rating = || b.driver.rating.total_cmp(&a.driver.rating);

        let ordering = match self {
            RankingPolicy::NearestThenRating => by_distance().then_with(by_rating),
            RankingPolicy::RatingThenNearest => by_rating().then_with(by_distance),
        };
        ordering.then_with(|| a.driver.id.cmp(&b.driver.id))
    }

    pub fn rank(self, mut candidates: Vec<NearbyDriver>) -> Vec<NearbyDriver> {
        candidates.sort_by(|a, b| self.compare(a, b));
        candidates
    }
}

impl fmt::Display for RankingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankingPolicy::NearestThenRating => f.write_str("nearest_then_rating"),
            RankingPolicy::RatingThenNearest => f.write_str("rating_then_nearest"),
        }
    }
}

impl FromStr for RankingPolicy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nearest_then_rating" => Ok(RankingPolicy::NearestThenRating),
            "rating_then_nearest" => Ok(RankingPolicy::RatingThenNearest),
            other => Err(AppError::Validation(format!(
                "unknown ranking policy: {other}"
            ))),
        }
    }
}
