//! Geodetic to Cartesian conversion for GPS position priors.

use nalgebra::Vector3;

// WGS84 ellipsoid.
const SEMI_MAJOR_AXIS: f64 = 6_378_137.0;
const ECCENTRICITY_SQ: f64 = 6.694_379_990_141_316e-3;

/// Convert geodetic coordinates (latitude and longitude in degrees,
/// altitude in meters) to Earth-centered Earth-fixed Cartesian coordinates
/// in meters.
pub fn ecef_from_geodetic(latitude: f64, longitude: f64, altitude: f64) -> Vector3<f64> {
    let lat = latitude.to_radians();
    let lon = longitude.to_radians();

    let sin_lat = lat.sin();
    let cos_lat = lat.cos();

    // Prime vertical radius of curvature.
    let n = SEMI_MAJOR_AXIS / (1.0 - ECCENTRICITY_SQ * sin_lat * sin_lat).sqrt();

    Vector3::new(
        (n + altitude) * cos_lat * lon.cos(),
        (n + altitude) * cos_lat * lon.sin(),
        (n * (1.0 - ECCENTRICITY_SQ) + altitude) * sin_lat,
    )
}
