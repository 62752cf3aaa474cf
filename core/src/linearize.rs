//! Linearization of the GPS-aided INS error dynamics
//!
//! # Error-state ordering
//!
//! ```text
//! δx = [δp_n, δp_e, δp_d, δv_n, δv_e, δv_d, δθ_n, δθ_e, δθ_d, δb_a (3), δb_g (3)]
//! ```
//! where:
//! - `δp`: position error in meters, NED
//! - `δv`: velocity error in m/s, NED
//! - `δθ`: attitude error as a small rotation expressed in the navigation frame, so that
//!   $C^n_b = \text{Exp}(\delta\theta)\,\hat{C}^n_b$
//! - `δb_a`, `δb_g`: accelerometer and gyro bias errors, modeled as first-order Gauss-Markov
//!   processes
//!
//! # Continuous-time error model
//!
//! $$
//! \begin{aligned}
//! \delta\dot{p} &= \delta v \\\\
//! \delta\dot{v} &= -[\hat{f}^n]_\times \delta\theta - \hat{C}^n_b \delta b_a \\\\
//! \delta\dot{\theta} &= -\hat{C}^n_b \delta b_g \\\\
//! \delta\dot{b} &= -\tfrac{1}{\tau} \delta b
//! \end{aligned}
//! $$
//!
//! Earth rate, transport rate, and the gravity gradient are neglected; over the short horizons
//! between GPS fixes they are far below the noise of the MEMS sensors this filter is tuned for.
//! The discrete transition is the first-order $\Phi = I + F\,\Delta t$.
use nalgebra::{DMatrix, Matrix3, Vector3};

use crate::config::InsConfig;
use crate::linalg::skew;
use crate::messages::GpsFix;

/// Number of error states
pub const ERROR_STATES: usize = 15;
/// Number of GPS measurement components (position NED + velocity NED)
pub const GPS_MEASUREMENTS: usize = 6;
/// Offsets of each block in the error state
pub const POSITION: usize = 0;
pub const VELOCITY: usize = 3;
pub const ATTITUDE: usize = 6;
pub const ACCEL_BIAS: usize = 9;
pub const GYRO_BIAS: usize = 12;

fn set_block(m: &mut DMatrix<f64>, row: usize, col: usize, block: &Matrix3<f64>) {
    for i in 0..3 {
        for j in 0..3 {
            m[(row + i, col + j)] = block[(i, j)];
        }
    }
}

/// 15×15 discrete error-state transition matrix Φ = I + F·dt
///
/// # Arguments
/// - `c_nb` - body-to-NED rotation matrix of the current estimate
/// - `specific_force_n` - bias-corrected specific force rotated into NED
/// - `config` - bias correlation times
/// - `dt` - propagation interval in seconds
pub fn error_state_transition(
    c_nb: &Matrix3<f64>,
    specific_force_n: &Vector3<f64>,
    config: &InsConfig,
    dt: f64,
) -> DMatrix<f64> {
    let mut phi = DMatrix::<f64>::identity(ERROR_STATES, ERROR_STATES);

    set_block(&mut phi, POSITION, VELOCITY, &(Matrix3::identity() * dt));
    set_block(&mut phi, VELOCITY, ATTITUDE, &(-skew(specific_force_n) * dt));
    set_block(&mut phi, VELOCITY, ACCEL_BIAS, &(-c_nb * dt));
    set_block(&mut phi, ATTITUDE, GYRO_BIAS, &(-c_nb * dt));
    for i in 0..3 {
        phi[(ACCEL_BIAS + i, ACCEL_BIAS + i)] = 1.0 - dt / config.accel_bias_tau;
        phi[(GYRO_BIAS + i, GYRO_BIAS + i)] = 1.0 - dt / config.gyro_bias_tau;
    }
    phi
}
/// Discrete process noise Q_d ≈ G Q Gᵀ dt
///
/// Sensor white noise enters velocity and attitude isotropically, so the rotation in G drops
/// out and Q_d is diagonal. The Gauss-Markov driving noise is $2\sigma^2/\tau$.
pub fn process_noise(config: &InsConfig, dt: f64) -> DMatrix<f64> {
    let mut q = DMatrix::<f64>::zeros(ERROR_STATES, ERROR_STATES);
    let accel_bias_drive = 2.0 * config.accel_bias_sigma.powi(2) / config.accel_bias_tau;
    let gyro_bias_drive = 2.0 * config.gyro_bias_sigma.powi(2) / config.gyro_bias_tau;
    for i in 0..3 {
        q[(VELOCITY + i, VELOCITY + i)] = config.accel_noise.powi(2) * dt;
        q[(ATTITUDE + i, ATTITUDE + i)] = config.gyro_noise.powi(2) * dt;
        q[(ACCEL_BIAS + i, ACCEL_BIAS + i)] = accel_bias_drive * dt;
        q[(GYRO_BIAS + i, GYRO_BIAS + i)] = gyro_bias_drive * dt;
    }
    q
}
/// 6×15 measurement matrix for a GPS position/velocity fix expressed as NED residuals
pub fn gps_measurement_matrix() -> DMatrix<f64> {
    let mut h = DMatrix::<f64>::zeros(GPS_MEASUREMENTS, ERROR_STATES);
    for i in 0..3 {
        h[(i, POSITION + i)] = 1.0;
        h[(3 + i, VELOCITY + i)] = 1.0;
    }
    h
}
/// 6×6 measurement noise for a GPS fix
///
/// Uses the accuracy reported by the receiver, the configured fallback when the receiver reports
/// nothing, and never less than the configured floor.
pub fn gps_measurement_noise(fix: &GpsFix, config: &InsConfig) -> DMatrix<f64> {
    let pick = |reported: f64, fallback: f64, floor: f64| -> f64 {
        let sigma = if reported.is_finite() && reported > 0.0 {
            reported
        } else {
            fallback
        };
        sigma.max(floor).powi(2)
    };
    let pos = |s: f64| pick(s, config.gps_position_sigma, config.gps_position_sigma_floor);
    let vel = |s: f64| pick(s, config.gps_velocity_sigma, config.gps_velocity_sigma_floor);
    DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![
        pos(fix.sig_n),
        pos(fix.sig_e),
        pos(fix.sig_d),
        vel(fix.sig_vn),
        vel(fix.sig_ve),
        vel(fix.sig_vd),
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn transition_blocks() {
        let config = InsConfig::default();
        let c_nb = Matrix3::identity();
        let f_n = Vector3::new(0.0, 0.0, -9.8);
        let dt = 0.02;
        let phi = error_state_transition(&c_nb, &f_n, &config, dt);
        assert_eq!(phi.shape(), (ERROR_STATES, ERROR_STATES));
        assert_eq!(phi[(POSITION, VELOCITY)], dt);
        // tilt about north couples gravity into east velocity error
        assert_approx_eq!(phi[(VELOCITY + 1, ATTITUDE)], 9.8 * dt, 1e-12);
        assert_approx_eq!(phi[(VELOCITY, ATTITUDE + 1)], -9.8 * dt, 1e-12);
        assert_approx_eq!(phi[(VELOCITY, ACCEL_BIAS)], -dt, 1e-15);
        assert_approx_eq!(phi[(ATTITUDE + 2, GYRO_BIAS + 2)], -dt, 1e-15);
        assert_approx_eq!(phi[(GYRO_BIAS, GYRO_BIAS)], 1.0 - dt / config.gyro_bias_tau, 1e-15);
        assert_eq!(phi[(ATTITUDE, VELOCITY)], 0.0);
    }

    #[test]
    fn process_noise_is_diagonal_and_non_negative() {
        let config = InsConfig::default();
        let q = process_noise(&config, 0.02);
        for i in 0..ERROR_STATES {
            for j in 0..ERROR_STATES {
                if i == j {
                    assert!(q[(i, j)] >= 0.0);
                } else {
                    assert_eq!(q[(i, j)], 0.0);
                }
            }
        }
        assert_eq!(q[(POSITION, POSITION)], 0.0);
        assert_approx_eq!(q[(VELOCITY, VELOCITY)], 0.05 * 0.05 * 0.02, 1e-15);
    }

    #[test]
    fn measurement_noise_uses_fallback_and_floor() {
        let config = InsConfig::default();
        let mut fix = GpsFix::default();
        let r = gps_measurement_noise(&fix, &config);
        assert_approx_eq!(r[(0, 0)], config.gps_position_sigma.powi(2), 1e-12);
        assert_approx_eq!(r[(5, 5)], config.gps_velocity_sigma.powi(2), 1e-12);
        fix.sig_n = 0.01;
        fix.sig_vn = 2.0;
        let r = gps_measurement_noise(&fix, &config);
        assert_approx_eq!(r[(0, 0)], config.gps_position_sigma_floor.powi(2), 1e-12);
        assert_approx_eq!(r[(3, 3)], 4.0, 1e-12);
        let h = gps_measurement_matrix();
        assert_eq!(h.shape(), (GPS_MEASUREMENTS, ERROR_STATES));
        assert_eq!(h[(4, VELOCITY + 1)], 1.0);
    }
}
