//! # Geographic Utilities
//!
//! Distance and coordinate-conversion helpers shared by every clustering phase.
//!
//! ## Overview
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`epsilon_degrees`] | Convert a distance in feet into a DBSCAN radius in degrees |
//! | [`planar_degree_distance`] | Euclidean distance between two points in raw degrees |
//! | [`geodesic_distance_ft`] | Ellipsoidal distance between two points in feet |
//! | [`compute_bounds`] | Bounding box of the valid points of a set |
//! | [`compute_center`] | Arithmetic mean of the valid points of a set |
//!
//! ## Example
//!
//! ```rust
//! use building_matcher::{GpsPoint, geo_utils};
//!
//! let a = GpsPoint::new(42.354304, -71.069223);
//! let b = GpsPoint::new(42.353843, -71.070958);
//!
//! let feet = geo_utils::geodesic_distance_ft(&a, &b);
//! assert!((feet - 500.0).abs() < 10.0);
//!
//! let eps = geo_utils::epsilon_degrees(500.0);
//! assert!((eps - geo_utils::planar_degree_distance(&a, &b)).abs() < 1e-8);
//! ```
//!
//! ## Coordinate System
//!
//! Clustering runs on raw (latitude, longitude) pairs with a Euclidean metric,
//! so every radius handed to DBSCAN is expressed in decimal degrees. The
//! feet-to-degrees factor is calibrated once from two reference points that
//! sit 500 ft apart in Boston. Latitude and longitude degrees are treated as
//! locally planar, which only holds at city scale.

use geo::{Distance, Geodesic, Point};

use crate::{Bounds, GpsPoint};

/// Feet per meter.
pub const FEET_PER_METER: f64 = 3.280_839_895;

/// Reference points known to be [`CALIBRATION_FEET`] apart.
pub const CALIBRATION_POINTS: [(f64, f64); 2] = [
    (42.354304, -71.069223),
    (42.353843, -71.070958),
];

/// Ground distance between the two [`CALIBRATION_POINTS`].
pub const CALIBRATION_FEET: f64 = 500.0;

// =============================================================================
// Coordinate System Adapter
// =============================================================================

/// Degrees-per-foot factor derived from the calibration points.
fn feet_factor() -> f64 {
    let [(lat1, lng1), (lat2, lng2)] = CALIBRATION_POINTS;
    let a = GpsPoint::new(lat1, lng1);
    let b = GpsPoint::new(lat2, lng2);
    planar_degree_distance(&a, &b) / CALIBRATION_FEET
}

/// Convert a desired neighborhood distance in feet into a DBSCAN epsilon in
/// decimal degrees, rounded to 8 places.
///
/// The result is only meaningful for the planar (lat, lon) metric used by
/// [`crate::dbscan::dbscan`]; the effective ground radius drifts slightly with
/// bearing because a degree of longitude is shorter than a degree of latitude.
///
/// # Example
///
/// ```rust
/// use building_matcher::geo_utils::epsilon_degrees;
///
/// assert_eq!(epsilon_degrees(0.0), 0.0);
/// assert!(epsilon_degrees(300.0) < epsilon_degrees(500.0));
/// ```
pub fn epsilon_degrees(desired_feet: f64) -> f64 {
    round_to(desired_feet * feet_factor(), 8)
}

/// Euclidean distance between two points treating degrees as planar units.
#[inline]
pub fn planar_degree_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let dlat = p1.latitude - p2.latitude;
    let dlng = p1.longitude - p2.longitude;
    (dlat * dlat + dlng * dlng).sqrt()
}

// =============================================================================
// Distance Functions
// =============================================================================

/// Ellipsoidal (WGS84) distance between two points, in feet.
///
/// This is the distance used for recognition and radial statistics.
#[inline]
pub fn geodesic_distance_ft(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Geodesic::distance(point1, point2) * FEET_PER_METER
}

// =============================================================================
// Bounding Box / Center Functions
// =============================================================================

/// Bounding box of the valid points of a set.
///
/// Returns `None` when no point is valid.
pub fn compute_bounds(points: &[GpsPoint]) -> Option<Bounds> {
    let mut valid = points.iter().filter(|p| p.is_valid()).peekable();
    valid.peek()?;

    let mut bounds = Bounds {
        min_lat: f64::MAX,
        max_lat: f64::MIN,
        min_lng: f64::MAX,
        max_lng: f64::MIN,
    };
    for p in valid {
        bounds.min_lat = bounds.min_lat.min(p.latitude);
        bounds.max_lat = bounds.max_lat.max(p.latitude);
        bounds.min_lng = bounds.min_lng.min(p.longitude);
        bounds.max_lng = bounds.max_lng.max(p.longitude);
    }
    Some(bounds)
}

/// Arithmetic mean of the valid points of a set.
///
/// Invalid coordinates never pull the center; a set without any valid point
/// has an invalid (NaN) center, and an empty set is centered on (0, 0).
/// Adequate for building-sized clusters; not suitable for sets crossing the
/// antimeridian.
pub fn compute_center(points: &[GpsPoint]) -> GpsPoint {
    if points.is_empty() {
        return GpsPoint::new(0.0, 0.0);
    }

    let (sum_lat, sum_lng, n) = points
        .iter()
        .filter(|p| p.is_valid())
        .fold((0.0, 0.0, 0usize), |(lat, lng, n), p| {
            (lat + p.latitude, lng + p.longitude, n + 1)
        });
    if n == 0 {
        return GpsPoint::new(f64::NAN, f64::NAN);
    }

    GpsPoint::new(sum_lat / n as f64, sum_lng / n as f64)
}

/// Round `value` to `places` decimal places.
#[inline]
pub fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f64, b: f64, epsilon: f64) -> bool {
        (a - b).abs() < epsilon
    }

    fn calibration() -> (GpsPoint, GpsPoint) {
        let [(lat1, lng1), (lat2, lng2)] = CALIBRATION_POINTS;
        (GpsPoint::new(lat1, lng1), GpsPoint::new(lat2, lng2))
    }

    #[test]
    fn test_epsilon_for_calibration_distance() {
        let (a, b) = calibration();
        let eps = epsilon_degrees(500.0);
        assert!(approx_eq(eps, planar_degree_distance(&a, &b), 1e-8));
        assert!(approx_eq(eps, 0.0017952, 1e-9));
    }

    #[test]
    fn test_epsilon_is_rounded_to_eight_places() {
        let eps = epsilon_degrees(300.0);
        assert_eq!(eps, 0.00107712);
        assert_eq!(round_to(eps, 8), eps);
    }

    #[test]
    fn test_epsilon_scales_linearly() {
        let small = epsilon_degrees(100.0);
        let large = epsilon_degrees(1000.0);
        assert!(approx_eq(large, small * 10.0, 1e-7));
    }

    #[test]
    fn test_calibration_points_are_500_feet_apart() {
        let (a, b) = calibration();
        let feet = geodesic_distance_ft(&a, &b);
        assert!(approx_eq(feet, 500.0, 10.0), "got {feet} ft");
    }

    #[test]
    fn test_geodesic_same_point() {
        let p = GpsPoint::new(42.35, -71.06);
        assert_eq!(geodesic_distance_ft(&p, &p), 0.0);
    }

    #[test]
    fn test_compute_bounds() {
        let points = vec![
            GpsPoint::new(42.350, -71.070),
            GpsPoint::new(42.360, -71.060),
            GpsPoint::new(42.355, -71.065),
        ];
        let bounds = compute_bounds(&points).unwrap();
        assert_eq!(bounds.min_lat, 42.350);
        assert_eq!(bounds.max_lat, 42.360);
        assert_eq!(bounds.min_lng, -71.070);
        assert_eq!(bounds.max_lng, -71.060);
    }

    #[test]
    fn test_compute_center() {
        let points = vec![GpsPoint::new(42.35, -71.06), GpsPoint::new(42.37, -71.08)];
        let center = compute_center(&points);
        assert!(approx_eq(center.latitude, 42.36, 1e-9));
        assert!(approx_eq(center.longitude, -71.07, 1e-9));
    }

    #[test]
    fn test_invalid_points_are_ignored() {
        let points = vec![
            GpsPoint::new(42.35, -71.06),
            GpsPoint::new(f64::NAN, -71.06),
            GpsPoint::new(42.37, -71.08),
        ];
        let center = compute_center(&points);
        assert!(approx_eq(center.latitude, 42.36, 1e-9));
        assert_eq!(compute_bounds(&points).map(|b| b.max_lat), Some(42.37));

        let only_invalid = vec![GpsPoint::new(f64::NAN, f64::NAN)];
        assert!(!compute_center(&only_invalid).is_valid());
        assert!(compute_bounds(&only_invalid).is_none());
    }

    #[test]
    fn test_compute_center_empty() {
        let center = compute_center(&[]);
        assert_eq!(center, GpsPoint::new(0.0, 0.0));
    }
}
