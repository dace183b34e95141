//! Geographic utilities shared by the filter, stop detector and aggregator.

use geo::{Distance, Haversine, Point};

/// Calculate haversine distance between two coordinates in meters.
///
/// Arguments are (latitude, longitude) in degrees.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let point1 = Point::new(lon1, lat1);
    let point2 = Point::new(lon2, lat2);
    Haversine::distance(point1, point2)
}

/// Seconds elapsed between two millisecond timestamps.
///
/// Negative when `later_ms` is actually earlier; callers guard on sign.
/// Saturates for timestamps too far apart to subtract.
pub fn elapsed_seconds(earlier_ms: i64, later_ms: i64) -> f64 {
    later_ms.saturating_sub(earlier_ms) as f64 / 1000.0
}

/// Check that a coordinate pair is finite and within WGS84 range.
pub fn is_valid_coordinate(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite()
        && longitude.is_finite()
        && (-90.0..=90.0).contains(&latitude)
        && (-180.0..=180.0).contains(&longitude)
}
