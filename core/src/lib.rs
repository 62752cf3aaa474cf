//! State estimation and execution core for a small-aircraft autopilot
//!
//! This crate fuses inertial, magnetic, barometric, and GPS measurements into a best estimate of
//! attitude, position, and velocity, and drives that estimation at a fixed rate (50 Hz by default)
//! alongside externally supplied guidance, control, and fault-detection stages.
//!
//! Three cooperating filters produce two independent navigation solutions:
//!
//! - an attitude and heading reference system ([ahrs]) that integrates the gyros and corrects
//!   roll and pitch with the gravity vector and yaw with the magnetometer;
//! - a dead-reckoning filter ([dead_reckoning]) that propagates position from AHRS attitude and
//!   airspeed, estimating wind and the barometric altitude offset whenever GPS is available;
//! - a GPS-aided inertial navigation system ([kalman]), a 15-state error-state extended Kalman
//!   filter with accelerometer and gyro bias states.
//!
//! A blending filter ([blend]) weighs the AHRS/DR solution against the INS solution according to
//! their status and uncertainty and produces the [`messages::NavEstimate`] consumed by guidance
//! and control. The [scheduler] owns all filter state, sequences initialization and update calls,
//! measures per-stage execution time, and publishes a snapshot of every cycle to lower-priority
//! readers without ever blocking.
//!
//! The crate is primarily built on:
//! - [`nalgebra`](https://crates.io/crates/nalgebra): linear algebra and quaternions.
//! - [`nav-types`](https://crates.io/crates/nav-types): geodetic and ECEF coordinate types.
//! - [`crossbeam`](https://crates.io/crates/crossbeam): channels for the snapshot readers.
//! - [`serde`](https://crates.io/crates/serde): configuration files and recorded results.
//!
//! ## Crate overview
//!
//! - [ahrs]: attitude and heading reference filter.
//! - [blend]: confidence-weighted fusion of the two navigation solutions.
//! - [config]: configuration structures and file I/O.
//! - [dead_reckoning]: airspeed dead reckoning with wind and baro-offset estimation.
//! - [earth]: WGS84 constants and geodetic helpers.
//! - [error]: error types.
//! - [kalman]: GPS-aided inertial navigation filter.
//! - [linalg]: checked dense matrix operations.
//! - [linearize]: error-state transition, process noise, and measurement matrices.
//! - [messages]: sensor, control, and navigation state structures.
//! - [scheduler]: the fixed-rate execution loop.
//! - [sim]: synthetic sensor streams and a simulation runner.
//! - [snapshot]: cycle snapshots for logging and telemetry tasks.
//! - [status]: status codes.
//!
//! ## Frames and conventions
//!
//! The navigation frame is North-East-Down (NED) and the body frame is forward-right-down.
//! Attitude is expressed as 3-2-1 (yaw, pitch, roll) Euler angles or as the body-to-NED
//! quaternion. Filter states carry latitude and longitude in radians; the GPS receiver reports
//! degrees. The accelerometers measure specific force, so a level aircraft at rest reads
//! approximately $(0, 0, -g)$.
pub mod ahrs;
pub mod blend;
pub mod config;
pub mod dead_reckoning;
pub mod earth;
pub mod error;
pub mod kalman;
pub mod linalg;
pub mod linearize;
pub mod messages;
pub mod scheduler;
pub mod sim;
pub mod snapshot;
pub mod status;

use nalgebra::UnitQuaternion;
use std::f64::consts::{FRAC_PI_2, PI, TAU};

pub use config::NavConfig;
pub use error::{MatrixError, NavError};
pub use messages::{
    AhrsDrState, AirData, ControlMode, ControlState, GpsFix, ImuSample, InsState, NavEstimate,
    SensorData, SurfacePositions,
};
pub use scheduler::{AutopilotStages, NullAutopilot, Scheduler, SchedulerState};
pub use status::{FilterStatus, SensorStatus, StatusCode};

/// Wrap an angle to the range $(-\pi, \pi]$ radians
///
/// # Example
/// ```rust
/// use uasnav::wrap_to_pi;
/// use std::f64::consts::PI;
/// let wrapped = wrap_to_pi(3.0 * PI / 2.0);
/// assert!((wrapped + PI / 2.0).abs() < 1e-12);
/// ```
pub fn wrap_to_pi(angle: f64) -> f64 {
    if angle > -PI && angle <= PI {
        return angle;
    }
    let wrapped = wrap_to_2pi(angle);
    if wrapped > PI {
        wrapped - TAU
    } else {
        wrapped
    }
}
/// Wrap an angle to the range $[0, 2\pi)$ radians
///
/// Non-finite input yields NaN.
///
/// # Example
/// ```rust
/// use uasnav::wrap_to_2pi;
/// use std::f64::consts::PI;
/// assert!((wrap_to_2pi(5.0 * PI) - PI).abs() < 1e-12);
/// assert_eq!(wrap_to_2pi(2.0 * PI), 0.0);
/// ```
pub fn wrap_to_2pi(angle: f64) -> f64 {
    if (0.0..TAU).contains(&angle) {
        return angle;
    }
    let wrapped = angle.rem_euclid(TAU);
    // a tiny negative input rounds up to exactly TAU
    if wrapped >= TAU {
        0.0
    } else {
        wrapped
    }
}
/// Roll, pitch, and yaw of a body-to-NED quaternion, wrapped to the navigation output ranges
///
/// Roll is in $(-\pi, \pi]$, pitch in $[-\pi/2, \pi/2]$, and yaw in $[0, 2\pi)$.
pub fn euler_from_quaternion(q: &UnitQuaternion<f64>) -> (f64, f64, f64) {
    let (roll, pitch, yaw) = q.euler_angles();
    (
        wrap_to_pi(roll),
        pitch.clamp(-FRAC_PI_2, FRAC_PI_2),
        wrap_to_2pi(yaw),
    )
}
/// Body-to-NED quaternion from 3-2-1 Euler angles
pub fn quaternion_from_euler(roll: f64, pitch: f64, yaw: f64) -> UnitQuaternion<f64> {
    UnitQuaternion::from_euler_angles(roll, pitch, yaw)
}

// Note: nalgebra does not yet have a well developed testing framework for directly comparing
// nalgebra data structures. Rather than directly comparing, check the individual items.
#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_wrap_to_pi() {
        assert_approx_eq!(wrap_to_pi(3.0 * PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_pi(-3.0 * PI), PI, 1e-12);
        assert_eq!(wrap_to_pi(0.0), 0.0);
        assert_eq!(wrap_to_pi(PI), PI);
        assert_eq!(wrap_to_pi(-PI), PI);
        assert_approx_eq!(wrap_to_pi(1.5 * PI), -0.5 * PI, 1e-12);
    }
    #[test]
    fn test_wrap_to_2pi() {
        assert_approx_eq!(wrap_to_2pi(7.0 * PI), PI, 1e-12);
        assert_approx_eq!(wrap_to_2pi(-5.0 * PI), PI, 1e-12);
        assert_eq!(wrap_to_2pi(0.0), 0.0);
        assert_approx_eq!(wrap_to_2pi(-0.1), 2.0 * PI - 0.1, 1e-12);
        assert_eq!(wrap_to_2pi(-1e-20), 0.0);
    }
    #[test]
    fn test_wrap_non_finite_terminates() {
        for angle in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            assert!(wrap_to_pi(angle).is_nan());
            assert!(wrap_to_2pi(angle).is_nan());
        }
        assert_approx_eq!(wrap_to_pi(1e12), 1e12f64.rem_euclid(2.0 * PI) - 2.0 * PI, 1e-3);
    }
    #[test]
    fn test_euler_round_trip() {
        let q = quaternion_from_euler(0.2, -0.3, 3.5);
        let (roll, pitch, yaw) = euler_from_quaternion(&q);
        assert_approx_eq!(roll, 0.2, 1e-12);
        assert_approx_eq!(pitch, -0.3, 1e-12);
        assert_approx_eq!(yaw, 3.5, 1e-12);
    }
}
