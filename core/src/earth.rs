//! Earth-related constants and functions
//!
//! This module contains the WGS84 ellipsoid constants and the handful of geodetic helpers the
//! navigation filters need: principal radii of curvature, Somigliana gravity, conversions
//! between geodetic and Earth-centered Earth-fixed (ECEF) coordinates, and small-displacement
//! conversions between geodetic coordinates and local North-East-Down (NED) offsets.
//!
//! Unlike the sensor structures (where the GPS receiver reports degrees), every filter state
//! in this crate carries latitude and longitude in **radians** and altitude in meters above the
//! WGS84 ellipsoid. All functions here follow that convention unless the name says otherwise.
//!
//! For the positional conversions the [`nav-types`](https://crates.io/crates/nav-types) crate
//! provides the `WGS84` and `ECEF` types.
use ::nalgebra::{Matrix3, Vector3};
use ::nav_types::{ECEF, WGS84};

// Earth constants (WGS84)
/// Earth's equitorial radius in meters
pub const EQUATORIAL_RADIUS: f64 = 6378137.0;
/// Earth's polar radius in meters
pub const POLAR_RADIUS: f64 = 6356752.31425;
/// Earth's eccentricity ($e$)
pub const ECCENTRICITY: f64 = 0.0818191908425;
/// Earth's eccentricity squared ($e^2$)
pub const ECCENTRICITY_SQUARED: f64 = ECCENTRICITY * ECCENTRICITY;
/// Earth's gravitational acceleration at the equator ($g_e$) in $m/s^2$
pub const GE: f64 = 9.7803253359;
/// Earth's gravitational acceleration at the poles ($g_p$) in $m/s^2$
pub const GP: f64 = 9.8321849378;
/// Somigliana's constant ($K$)
pub const K: f64 = (POLAR_RADIUS * GP - EQUATORIAL_RADIUS * GE) / (EQUATORIAL_RADIUS * GE);
/// Nominal gravity used by the flight code for specific-force sanity checks, $m/s^2$
pub const STANDARD_GRAVITY: f64 = 9.814;

/// Principal radii of curvature of the WGS84 ellipsoid
///
/// Returns the meridian radius $R_N$ and the transverse (prime vertical) radius $R_E$ at the
/// given geodetic latitude:
///
/// $$
/// R_N = \frac{a(1-e^2)}{(1-e^2\sin^2\phi)^{3/2}} \qquad R_E = \frac{a}{\sqrt{1-e^2\sin^2\phi}}
/// $$
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in radians
///
/// # Example
/// ```rust
/// use uasnav::earth;
/// let (r_n, r_e) = earth::principal_radii(45.0_f64.to_radians());
/// assert!(r_e > r_n);
/// ```
pub fn principal_radii(latitude: f64) -> (f64, f64) {
    let sin_lat = latitude.sin();
    let denom = 1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat;
    let r_n = EQUATORIAL_RADIUS * (1.0 - ECCENTRICITY_SQUARED) / denom.powf(1.5);
    let r_e = EQUATORIAL_RADIUS / denom.sqrt();
    (r_n, r_e)
}
/// Calculate the WGS84 gravity scalar
///
/// Somigliana normal gravity with a free-air correction for altitude.
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in radians
/// - `altitude` - The WGS84 altitude in meters
pub fn gravity(latitude: f64, altitude: f64) -> f64 {
    let sin_lat = latitude.sin();
    let g0 = (GE * (1.0 + K * sin_lat * sin_lat))
        / (1.0 - ECCENTRICITY_SQUARED * sin_lat * sin_lat).sqrt();
    g0 - 3.08e-6 * altitude
}
/// Convert a geodetic position (degrees, meters) to ECEF coordinates in meters
pub fn geodetic_to_ecef(latitude_deg: f64, longitude_deg: f64, altitude: f64) -> Vector3<f64> {
    let wgs84: WGS84<f64> = WGS84::from_degrees_and_meters(latitude_deg, longitude_deg, altitude);
    let ecef: ECEF<f64> = ECEF::from(wgs84);
    Vector3::new(ecef.x(), ecef.y(), ecef.z())
}
/// Rotation matrix from the local NED frame to the ECEF frame
///
/// # Parameters
/// - `latitude` - The WGS84 latitude in radians
/// - `longitude` - The WGS84 longitude in radians
pub fn ned_to_ecef(latitude: f64, longitude: f64) -> Matrix3<f64> {
    let (sin_lat, cos_lat) = latitude.sin_cos();
    let (sin_lon, cos_lon) = longitude.sin_cos();
    Matrix3::new(
        -sin_lat * cos_lon,
        -sin_lon,
        -cos_lat * cos_lon,
        -sin_lat * sin_lon,
        cos_lon,
        -cos_lat * sin_lon,
        cos_lat,
        0.0,
        -sin_lat,
    )
}
/// Local NED displacement (meters) from a reference geodetic position to another
///
/// Small-displacement approximation using the principal radii at the reference latitude. The
/// approximation is well below a millimeter for the kilometer-scale separations that appear
/// between two navigation solutions of the same aircraft.
pub fn ned_offset(
    reference: (f64, f64, f64),
    target: (f64, f64, f64),
) -> Vector3<f64> {
    let (lat_ref, lon_ref, alt_ref) = reference;
    let (lat, lon, alt) = target;
    let (r_n, r_e) = principal_radii(lat_ref);
    Vector3::new(
        (lat - lat_ref) * (r_n + alt_ref),
        crate::wrap_to_pi(lon - lon_ref) * (r_e + alt_ref) * lat_ref.cos(),
        -(alt - alt_ref),
    )
}
/// Move a geodetic position (radians, meters) by a small NED displacement in meters
pub fn displace(position: (f64, f64, f64), offset: &Vector3<f64>) -> (f64, f64, f64) {
    let (lat, lon, alt) = position;
    let (r_n, r_e) = principal_radii(lat);
    let new_lat = lat + offset[0] / (r_n + alt);
    let new_lon = lon + offset[1] / ((r_e + alt) * lat.cos());
    (new_lat, crate::wrap_to_pi(new_lon), alt - offset[2])
}
