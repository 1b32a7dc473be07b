// src/geo.rs
//! Great-circle helpers shared by the recorder, geofence and playback

use crate::position::Position;

/// Mean Earth radius used by every distance computation in the crate.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Haversine distance between two coordinates, in meters.
pub fn haversine_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}

/// Great-circle distance between two positions, in meters.
pub fn distance_meters(a: &Position, b: &Position) -> f64 {
    haversine_meters(a.latitude, a.longitude, b.latitude, b.longitude)
}

/// True when `p` lies on or inside the circle of `radius_meters` around `center`.
pub fn is_within_radius(p: &Position, center: &Position, radius_meters: f64) -> bool {
    distance_meters(p, center) <= radius_meters
}

/// Sum of consecutive pairwise distances along `points`.
pub fn path_length(points: &[Position]) -> f64 {
    points
        .windows(2)
        .map(|pair| distance_meters(&pair[0], &pair[1]))
        .sum()
}

/// Coordinate reached by travelling `distance_meters` from a start point on
/// the given initial bearing (degrees clockwise from north).
pub fn destination(lat: f64, lon: f64, bearing_degrees: f64, distance_meters: f64) -> (f64, f64) {
    let delta = distance_meters / EARTH_RADIUS_METERS;
    let theta = bearing_degrees.to_radians();
    let phi1 = lat.to_radians();
    let lambda1 = lon.to_radians();

    let phi2 = (phi1.sin() * delta.cos() + phi1.cos() * delta.sin() * theta.cos()).asin();
    let lambda2 = lambda1
        + (theta.sin() * delta.sin() * phi1.cos()).atan2(delta.cos() - phi1.sin() * phi2.sin());

    (phi2.to_degrees(), lambda2.to_degrees())
}
