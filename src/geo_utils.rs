//! # Geographic Utilities
//!
//! Distance and speed helpers shared by the spatial index, the trajectory
//! detector and the per-task compute unit.
//!
//! | Function | Description |
//! |----------|-------------|
//! | [`haversine_km`] | Great-circle distance between two lat/lon pairs, in kilometers |
//! | [`speed_kmh`] | Average speed for a distance and a duration |
//! | [`clamp_speed`] | Clamp a speed into the plausible bus range |
//! | [`ms_to_hours`] | Convert a millisecond span to hours |
//!
//! ## Example
//!
//! ```rust
//! use arc_speed::geo_utils;
//!
//! let km = geo_utils::haversine_km(3.4500, -76.5300, 3.4515, -76.5300);
//! assert!((km - 0.1668).abs() < 0.001);
//! ```
//!
//! ## Haversine Formula
//!
//! Distances come from `geo`'s haversine implementation (spherical Earth, mean
//! radius ~6371 km), accurate to within 0.3% for the short urban hops this crate
//! deals with.

use geo::{Distance, Haversine, Point};

/// Milliseconds in one hour.
pub const MS_PER_HOUR: f64 = 3_600_000.0;

/// Calculate the great-circle distance between two WGS84 positions in kilometers.
///
/// # Example
///
/// ```rust
/// use arc_speed::geo_utils;
///
/// // Cali to Palmira is roughly 27 km
/// let km = geo_utils::haversine_km(3.4516, -76.5320, 3.5394, -76.3036);
/// assert!((km - 27.2).abs() < 1.0);
/// ```
#[inline]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let point1 = Point::new(lon1, lat1);
    let point2 = Point::new(lon2, lat2);
    Haversine::distance(point1, point2) / 1000.0
}

/// Convert a millisecond span to hours.
#[inline]
pub fn ms_to_hours(span_ms: i64) -> f64 {
    span_ms as f64 / MS_PER_HOUR
}

/// Raw speed in km/h. Callers guard against a zero duration.
#[inline]
pub fn speed_kmh(distance_km: f64, time_hours: f64) -> f64 {
    distance_km / time_hours
}

/// Clamp a speed into `[0, max_kmh]`.
#[inline]
pub fn clamp_speed(speed_kmh: f64, max_kmh: f64) -> f64 {
    speed_kmh.clamp(0.0, max_kmh)
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

    #[test]
    fn test_haversine_same_point() {
        assert_eq!(haversine_km(3.45, -76.53, 3.45, -76.53), 0.0);
    }

    #[test]
    fn test_haversine_known_value() {
        // London to Paris is approximately 344 km
        let dist = haversine_km(51.5074, -0.1278, 48.8566, 2.3522);
        assert!(approx_eq(dist, 343.56, 5.0));
    }

    #[test]
    fn test_haversine_is_symmetric() {
        let a = haversine_km(3.40, -76.50, 3.41, -76.52);
        let b = haversine_km(3.41, -76.52, 3.40, -76.50);
        assert!(approx_eq(a, b, 1e-12));
    }

    #[test]
    fn test_short_hop_along_meridian() {
        // 0.0015 degrees of latitude ~ 166.8 m
        let km = haversine_km(3.4500, -76.5300, 3.4515, -76.5300);
        assert!(approx_eq(km, 0.1668, 0.0005));
    }

    #[test]
    fn test_ms_to_hours() {
        assert_eq!(ms_to_hours(3_600_000), 1.0);
        assert!(approx_eq(ms_to_hours(60_000), 1.0 / 60.0, 1e-12));
    }

    #[test]
    fn test_clamp_speed() {
        assert_eq!(clamp_speed(600.0, 120.0), 120.0);
        assert_eq!(clamp_speed(-3.0, 120.0), 0.0);
        assert_eq!(clamp_speed(42.0, 120.0), 42.0);
        assert_eq!(speed_kmh(10.0, 0.5), 20.0);
    }
}
