//! Attitude and heading reference filter
//!
//! The AHRS integrates the bias-corrected gyro rates into a body-to-NED quaternion and corrects
//! the result with two absolute references:
//!
//! - the gravity vector seen by the accelerometers, which observes roll and pitch whenever the
//!   measured specific force is close to $g$ (unaccelerated flight);
//! - the tilt-compensated magnetometer, which observes yaw against the configured NED field.
//!
//! Each Euler angle has its own scalar variance, so the corrections use scalar Kalman gains
//! $k = P_a / (P_a + R)$. The gyro bias follows the angle innovation through a small integral
//! gain, which gives it a low-pass character and keeps transients in the accelerometers from
//! leaking into the bias estimate.
//!
//! After initialization the filter spends a settling window (configurable, 100 cycles by
//! default) averaging the raw gyro rates into the bias while the aircraft sits still.
use log::{debug, info};
use nalgebra::{UnitQuaternion, Vector3};

use crate::config::AhrsConfig;
use crate::earth::STANDARD_GRAVITY;
use crate::messages::{AhrsDrState, ImuSample, SensorData};
use crate::status::FilterStatus;
use crate::{euler_from_quaternion, quaternion_from_euler, wrap_to_pi};

/// Smallest specific force magnitude from which a tilt can be computed
const MIN_SPECIFIC_FORCE: f64 = 1e-6;

/// Roll and pitch implied by a gravity-dominated specific force measurement
///
/// At rest the accelerometers read $f^b = C^b_n (0, 0, -g)^T$, so
/// $\phi = \operatorname{atan2}(-f_y, -f_z)$ and $\theta = \arcsin(f_x / \lVert f \rVert)$.
pub fn tilt_from_specific_force(f: &Vector3<f64>) -> (f64, f64) {
    let norm = f.norm();
    let roll = (-f[1]).atan2(-f[2]);
    let pitch = (f[0] / norm).clamp(-1.0, 1.0).asin();
    (roll, pitch)
}
/// Magnetic heading of the body field after removing roll and pitch, relative to magnetic north
pub fn tilt_compensated_heading(h: &Vector3<f64>, roll: f64, pitch: f64) -> f64 {
    let (sp, cp) = roll.sin_cos();
    let (st, ct) = pitch.sin_cos();
    let xh = h[0] * ct + h[1] * sp * st + h[2] * cp * st;
    let yh = h[1] * cp - h[2] * sp;
    (-yh).atan2(xh)
}

/// Attitude and heading reference filter
#[derive(Clone, Debug)]
pub struct Ahrs {
    config: AhrsConfig,
    /// [s] step period
    dt: f64,
    /// Body-to-NED attitude
    attitude: UnitQuaternion<f64>,
    /// Cycles spent in the settling window
    settle_count: u32,
    bias_sum: Vector3<f64>,
    bias_samples: u32,
    /// [rad] angle of the reference field east of true north
    declination: f64,
}

impl Ahrs {
    pub fn new(config: AhrsConfig, dt: f64) -> Self {
        let field = config.magnetic_reference;
        let declination = field[1].atan2(field[0]);
        Ahrs {
            config,
            dt,
            attitude: UnitQuaternion::identity(),
            settle_count: 0,
            bias_sum: Vector3::zeros(),
            bias_samples: 0,
            declination,
        }
    }
    pub fn attitude(&self) -> &UnitQuaternion<f64> {
        &self.attitude
    }
    /// True while the gyro bias is still being averaged
    pub fn is_settling(&self) -> bool {
        self.settle_count < self.config.settling_cycles
    }
    /// Seed attitude and gyro bias from a single IMU sample
    ///
    /// Leaves `state` untouched (and therefore still uninitialized) when the sample is not
    /// usable, so the scheduler simply retries on the next cycle.
    pub fn initialize(&mut self, sensors: &SensorData, state: &mut AhrsDrState) {
        let imu = sensors.imu;
        let f = specific_force(imu);
        if !imu.status.is_usable() || f.norm() < MIN_SPECIFIC_FORCE {
            debug!("AHRS initialization deferred, IMU status {:?}", imu.status);
            return;
        }
        let (phi, the) = tilt_from_specific_force(&f);
        let psi = tilt_compensated_heading(&magnetic_field(imu), phi, the) + self.declination;
        self.attitude = quaternion_from_euler(phi, the, psi);

        let rates = rates(imu);
        self.bias_sum = rates;
        self.bias_samples = 1;
        self.settle_count = 0;

        let (phi, the, psi) = euler_from_quaternion(&self.attitude);
        state.phi = phi;
        state.the = the;
        state.psi = psi;
        state.gb = rates.into();
        state.ab = [0.0; 3];
        state.pa = [self.config.initial_attitude_sigma.powi(2); 3];
        state.pgb = [self.config.initial_gyro_bias_sigma.powi(2); 3];
        state.ahrs_status = FilterStatus::TimeUpdateOnly;
        info!(
            "AHRS initialized: roll {:.4}, pitch {:.4}, yaw {:.4} rad, gyro bias [{:.5}, {:.5}, {:.5}]",
            phi, the, psi, rates[0], rates[1], rates[2]
        );
    }
    /// One propagation and correction cycle
    pub fn step(&mut self, sensors: &SensorData, state: &mut AhrsDrState) {
        let imu = sensors.imu;
        if !imu.status.is_usable() {
            debug!("AHRS holding state, IMU status {:?}", imu.status);
            return;
        }
        let dt = self.dt;
        let rates = rates(imu);
        let settling = self.is_settling();
        if settling {
            self.bias_sum += rates;
            self.bias_samples += 1;
            self.settle_count += 1;
            let gb = self.bias_sum / self.bias_samples as f64;
            state.gb = gb.into();
            let shrink = 1.0 / self.bias_samples as f64;
            state.pgb = [self.config.initial_gyro_bias_sigma.powi(2) * shrink; 3];
        }

        // Time update
        let gb = Vector3::from(state.gb);
        self.attitude *= UnitQuaternion::from_scaled_axis((rates - gb) * dt);
        let q_att = self.config.gyro_noise.powi(2) * dt;
        let q_bias = self.config.gyro_bias_noise.powi(2) * dt;
        for i in 0..3 {
            state.pa[i] += q_att;
            if !settling {
                state.pgb[i] += q_bias;
            }
        }

        // Measurement update
        let (roll, pitch, yaw) = self.attitude.euler_angles();
        let mut euler = [roll, pitch, yaw];
        let mut innovation = [0.0; 3];
        let mut observed = [false; 3];

        let f = specific_force(imu);
        let gravity_error = (f.norm() - STANDARD_GRAVITY).abs();
        if gravity_error <= self.config.gravity_tolerance {
            let (phi_m, the_m) = tilt_from_specific_force(&f);
            innovation[0] = wrap_to_pi(phi_m - euler[0]);
            innovation[1] = the_m - euler[1];
            observed[0] = true;
            observed[1] = true;
        } else {
            debug!("AHRS gravity observation rejected, |f| - g = {:.3}", gravity_error);
        }
        let h = magnetic_field(imu);
        if h.norm() > 0.0 {
            let psi_m = tilt_compensated_heading(&h, euler[0], euler[1]) + self.declination;
            innovation[2] = wrap_to_pi(psi_m - euler[2]);
            observed[2] = true;
        }

        let r = [
            self.config.accel_observation_sigma.powi(2),
            self.config.accel_observation_sigma.powi(2),
            self.config.mag_observation_sigma.powi(2),
        ];
        for i in 0..3 {
            if !observed[i] {
                continue;
            }
            let k = state.pa[i] / (state.pa[i] + r[i]);
            euler[i] += k * innovation[i];
            state.pa[i] *= 1.0 - k;
        }
        let corrected = observed.iter().any(|&o| o);
        if corrected {
            self.attitude = quaternion_from_euler(euler[0], euler[1], euler[2]);
        }

        if !settling && corrected {
            let body = euler_rates_to_body(euler[0], euler[1], &Vector3::from(innovation));
            let gain = self.config.bias_gain * dt;
            for i in 0..3 {
                state.gb[i] -= gain * body[i];
            }
            for i in 0..3 {
                if observed[i] {
                    state.pgb[i] *= 1.0 - gain;
                }
            }
        }

        let (phi, the, psi) = euler_from_quaternion(&self.attitude);
        state.phi = phi;
        state.the = the;
        state.psi = psi;
        state.ahrs_status = if settling {
            FilterStatus::Refining
        } else if corrected {
            FilterStatus::AhrsMeasurementUpdate
        } else {
            FilterStatus::TimeUpdateOnly
        };
    }
    pub fn close(&mut self) {
        info!(
            "AHRS closed after {} settling cycles, {} bias samples",
            self.settle_count, self.bias_samples
        );
    }
}

/// Map Euler angle rates to body rates for the 3-2-1 sequence
fn euler_rates_to_body(roll: f64, pitch: f64, euler_rates: &Vector3<f64>) -> Vector3<f64> {
    let (sp, cp) = roll.sin_cos();
    let (st, ct) = pitch.sin_cos();
    Vector3::new(
        euler_rates[0] - st * euler_rates[2],
        cp * euler_rates[1] + sp * ct * euler_rates[2],
        -sp * euler_rates[1] + cp * ct * euler_rates[2],
    )
}
fn rates(imu: &ImuSample) -> Vector3<f64> {
    Vector3::from(imu.rates())
}
fn specific_force(imu: &ImuSample) -> Vector3<f64> {
    Vector3::from(imu.specific_force())
}
fn magnetic_field(imu: &ImuSample) -> Vector3<f64> {
    Vector3::from(imu.magnetic_field())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linalg::dcm_321;
    use crate::messages::{AirData, GpsFix, SurfacePositions};
    use crate::status::SensorStatus;
    use assert_approx_eq::assert_approx_eq;

    const DT: f64 = 0.02;

    fn imu_at(roll: f64, pitch: f64, yaw: f64, gyro: [f64; 3]) -> ImuSample {
        let c_bn = dcm_321(roll, pitch, yaw);
        let f = c_bn * Vector3::new(0.0, 0.0, -STANDARD_GRAVITY);
        let h = c_bn * Vector3::from(AhrsConfig::default().magnetic_reference);
        ImuSample {
            p: gyro[0],
            q: gyro[1],
            r: gyro[2],
            ax: f[0],
            ay: f[1],
            az: f[2],
            hx: h[0],
            hy: h[1],
            hz: h[2],
            status: SensorStatus::DataValid,
            ..ImuSample::default()
        }
    }

    fn run(ahrs: &mut Ahrs, state: &mut AhrsDrState, imu: &ImuSample, init: bool) {
        let mut gps = GpsFix::default();
        let air = AirData::default();
        let surface = SurfacePositions::default();
        let sensors = SensorData {
            imu,
            gps: &mut gps,
            air: &air,
            surface: &surface,
        };
        if init {
            ahrs.initialize(&sensors, state);
        } else {
            ahrs.step(&sensors, state);
        }
    }

    #[test]
    fn tilt_and_heading_helpers() {
        let imu = imu_at(0.1, -0.2, 0.0, [0.0; 3]);
        let (roll, pitch) = tilt_from_specific_force(&specific_force(&imu));
        assert_approx_eq!(roll, 0.1, 1e-12);
        assert_approx_eq!(pitch, -0.2, 1e-12);
        let north = Vector3::new(0.2, 0.0, 0.5);
        let c_bn = dcm_321(0.3, 0.1, 1.2);
        assert_approx_eq!(tilt_compensated_heading(&(c_bn * north), 0.3, 0.1), 1.2, 1e-12);
    }

    #[test]
    fn initializes_level_and_stationary() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), DT);
        let mut state = AhrsDrState::default();
        let imu = imu_at(0.0, 0.0, 1.0, [0.001, -0.002, 0.003]);
        run(&mut ahrs, &mut state, &imu, true);
        assert_eq!(state.ahrs_status, FilterStatus::TimeUpdateOnly);
        assert_approx_eq!(state.phi, 0.0, 1e-12);
        assert_approx_eq!(state.the, 0.0, 1e-12);
        assert_approx_eq!(state.psi, 1.0, 1e-9);
        assert_eq!(state.gb, [0.001, -0.002, 0.003]);
        assert!(ahrs.is_settling());
    }

    #[test]
    fn initialization_waits_for_valid_imu() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), DT);
        let mut state = AhrsDrState::default();
        let mut imu = imu_at(0.0, 0.0, 0.0, [0.0; 3]);
        imu.status = SensorStatus::ChecksumError;
        run(&mut ahrs, &mut state, &imu, true);
        assert!(state.ahrs_status.is_sentinel());
    }

    #[test]
    fn checksum_error_holds_state_and_status() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), DT);
        let mut state = AhrsDrState::default();
        let imu = imu_at(0.05, 0.02, 2.0, [0.0; 3]);
        run(&mut ahrs, &mut state, &imu, true);
        for _ in 0..5 {
            run(&mut ahrs, &mut state, &imu, false);
        }
        let before = state;
        let mut bad = imu_at(1.0, 0.5, 0.0, [0.3, 0.3, 0.3]);
        bad.status = SensorStatus::ChecksumError;
        run(&mut ahrs, &mut state, &bad, false);
        assert_eq!(state, before);
    }

    #[test]
    fn status_moves_from_refining_to_measurement_update() {
        let config = AhrsConfig {
            settling_cycles: 10,
            ..AhrsConfig::default()
        };
        let mut ahrs = Ahrs::new(config, DT);
        let mut state = AhrsDrState::default();
        let imu = imu_at(0.0, 0.0, 0.5, [0.0; 3]);
        run(&mut ahrs, &mut state, &imu, true);
        for _ in 0..10 {
            run(&mut ahrs, &mut state, &imu, false);
            assert_eq!(state.ahrs_status, FilterStatus::Refining);
        }
        run(&mut ahrs, &mut state, &imu, false);
        assert_eq!(state.ahrs_status, FilterStatus::AhrsMeasurementUpdate);

        // 2 g pull-up: gravity rejected, magnetometer still corrects yaw
        let mut pulling = imu;
        pulling.az *= 2.0;
        run(&mut ahrs, &mut state, &pulling, false);
        assert_eq!(state.ahrs_status, FilterStatus::AhrsMeasurementUpdate);

        let mut blind = pulling;
        blind.hx = 0.0;
        blind.hy = 0.0;
        blind.hz = 0.0;
        run(&mut ahrs, &mut state, &blind, false);
        assert_eq!(state.ahrs_status, FilterStatus::TimeUpdateOnly);
    }

    #[test]
    fn converges_to_gyro_bias() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), DT);
        let mut state = AhrsDrState::default();
        let clean = imu_at(0.0, 0.0, 0.3, [0.0; 3]);
        run(&mut ahrs, &mut state, &clean, true);
        for _ in 0..AhrsConfig::default().settling_cycles {
            run(&mut ahrs, &mut state, &clean, false);
        }
        let biased = imu_at(0.0, 0.0, 0.3, [0.005, 0.0, 0.0]);
        for _ in 0..3000 {
            run(&mut ahrs, &mut state, &biased, false);
            assert!(state.phi.abs() < 0.02);
        }
        assert_approx_eq!(state.gb[0], 0.005, 1e-3);
        assert_approx_eq!(state.gb[1], 0.0, 1e-3);
        assert!(state.pa.iter().all(|&p| p >= 0.0));
    }

    #[test]
    fn output_ranges() {
        let mut ahrs = Ahrs::new(AhrsConfig::default(), DT);
        let mut state = AhrsDrState::default();
        let imu = imu_at(-0.2, 0.1, 6.0, [0.0; 3]);
        run(&mut ahrs, &mut state, &imu, true);
        run(&mut ahrs, &mut state, &imu, false);
        assert!(state.psi >= 0.0 && state.psi < 2.0 * std::f64::consts::PI);
        assert_approx_eq!(state.psi, 6.0, 1e-6);
        assert_approx_eq!(state.phi, -0.2, 1e-6);
    }
}
