//! WGS84 geodesy helpers.
//!
//! Distances are measured as the straight line between two points converted
//! to Earth-Centered-Earth-Fixed coordinates, which is accurate enough for
//! the short hops between consecutive captures.

use crate::point::GeoPoint;

/// WGS84 semi-major axis in meters
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 semi-minor axis in meters
pub const WGS84_B: f64 = 6_356_752.314245;

const WGS84_A_SQ: f64 = WGS84_A * WGS84_A;
const WGS84_B_SQ: f64 = WGS84_B * WGS84_B;

/// Convert a latitude/longitude pair (degrees, on the ellipsoid surface) to ECEF meters.
pub fn ecef_from_lat_lon(lat: f64, lon: f64) -> [f64; 3] {
    let lat = lat.to_radians();
    let lon = lon.to_radians();
    let (sin_lat, cos_lat) = lat.sin_cos();

    let l = 1.0 / (WGS84_A_SQ * cos_lat * cos_lat + WGS84_B_SQ * sin_lat * sin_lat).sqrt();
    let k = WGS84_A_SQ * l * cos_lat;

    [k * lon.cos(), k * lon.sin(), WGS84_B_SQ * l * sin_lat]
}

/// Distance in meters between two latitude/longitude pairs.
pub fn distance_lat_lon(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let [x1, y1, z1] = ecef_from_lat_lon(lat1, lon1);
    let [x2, y2, z2] = ecef_from_lat_lon(lat2, lon2);

    ((x1 - x2).powi(2) + (y1 - y2).powi(2) + (z1 - z2).powi(2)).sqrt()
}

/// Distance in meters between two points.
pub fn distance(p1: &GeoPoint, p2: &GeoPoint) -> f64 {
    distance_lat_lon(p1.lat, p1.lon, p2.lat, p2.lon)
}

/// Initial compass bearing from `(start_lat, start_lon)` to `(end_lat, end_lon)`,
/// in degrees within `[0, 360)`.
pub fn bearing_lat_lon(start_lat: f64, start_lon: f64, end_lat: f64, end_lon: f64) -> f64 {
    use std::f64::consts::PI;

    let start_lat = start_lat.to_radians();
    let end_lat = end_lat.to_radians();
    let mut delta_lon = end_lon.to_radians() - start_lon.to_radians();

    if delta_lon.abs() > PI {
        delta_lon = if delta_lon > 0.0 {
            -(2.0 * PI - delta_lon)
        } else {
            2.0 * PI + delta_lon
        };
    }

    let y = delta_lon.sin() * end_lat.cos();
    let x = start_lat.cos() * end_lat.sin() - start_lat.sin() * end_lat.cos() * delta_lon.cos();

    normalize_bearing(y.atan2(x).to_degrees())
}

/// Initial compass bearing from `p1` to `p2`.
pub fn bearing(p1: &GeoPoint, p2: &GeoPoint) -> f64 {
    bearing_lat_lon(p1.lat, p1.lon, p2.lat, p2.lon)
}

/// Wrap any angle in degrees into `[0, 360)`.
pub fn normalize_bearing(degrees: f64) -> f64 {
    let wrapped = degrees.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Smallest absolute difference between two bearings, in `[0, 180]`.
pub fn bearing_difference(b1: f64, b2: f64) -> f64 {
    let difference = (normalize_bearing(b2) - normalize_bearing(b1)).abs();
    if difference > 180.0 {
        360.0 - difference
    } else {
        difference
    }
}

/// Linearly interpolate a point at time `t` on the segment `start -> end`.
///
/// Times outside the segment extrapolate along it. The heading of the
/// returned point is the bearing of the segment.
pub fn interpolate(start: &GeoPoint, end: &GeoPoint, t: f64) -> GeoPoint {
    let weight = if start.time == end.time {
        0.0
    } else {
        (t - start.time) / (end.time - start.time)
    };

    let altitude = match (start.altitude, end.altitude) {
        (Some(a), Some(b)) => Some(a + (b - a) * weight),
        _ => None,
    };

    GeoPoint {
        time: t,
        lat: start.lat + (end.lat - start.lat) * weight,
        lon: start.lon + (end.lon - start.lon) * weight,
        altitude,
        heading: Some(bearing(start, end)),
    }
}
