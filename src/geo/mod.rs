use crate::models::location::{BoundingBox, GeoPoint};

const EARTH_RADIUS_KM: f64 = 6_371.0;
const KM_PER_DEGREE_LAT: f64 = 111.195;

pub fn haversine_km(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_KM * central_angle
}

/// Smallest box that fully contains the circle of `radius_km` around `center`.
pub fn bounding_box_around(center: &GeoPoint, radius_km: f64) -> BoundingBox {
    let lat_delta = radius_km / KM_PER_DEGREE_LAT;
    let cos_lat = center.lat.to_radians().cos().abs().max(1e-6);
    let lng_delta = (radius_km / (KM_PER_DEGREE_LAT * cos_lat)).min(180.0);

    BoundingBox {
        min_lat: (center.lat - lat_delta).max(-90.0),
        min_lng: (center.lng - lng_delta).max(-180.0),
        max_lat: (center.lat + lat_delta).min(90.0),
        max_lng: (center.lng + lng_delta).min(180.0),
    }
}
