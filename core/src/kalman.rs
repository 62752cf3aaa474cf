//! GPS-aided inertial navigation filter
//!
//! [`GpsIns`] is a 15-state error-state extended Kalman filter. The nominal state (geodetic
//! position, NED velocity, body-to-NED quaternion, accelerometer and gyro biases) is integrated
//! from the IMU every cycle, while the covariance tracks the error state defined in
//! [`crate::linearize`]. When a new locked GPS fix is present, the filter forms the NED position
//! and velocity residual, estimates the error state, injects it into the nominal state, and
//! resets the error to zero.
//!
//! The update follows the usual extended Kalman filter form:
//!
//! $$
//! \begin{aligned}
//! S &= H P H^T + R \\\\
//! K &= P H^T S^{-1} \\\\
//! \delta\hat{x} &= K \nu \\\\
//! P &= (I - K H) P (I - K H)^T + K R K^T
//! \end{aligned}
//! $$
//!
//! Fixes whose normalized innovation squared $\nu^T S^{-1} \nu$ exceeds the configured gate are
//! rejected. After a run of consecutive rejections, or after a long lock gap, the position and
//! velocity covariance is inflated before the next update so that the filter can re-acquire a
//! receiver that has legitimately moved away from the prediction.
//!
//! A step is transactional: the filter copies its state into a preallocated checkpoint first,
//! and any [`MatrixError`] restores that checkpoint and reports [`FilterStatus::UpdateFailed`].
use log::{debug, info, warn};
use nalgebra::{DMatrix, DVector, UnitQuaternion, Vector3};
use std::fmt::{self, Display};

use crate::config::InsConfig;
use crate::earth::{self, displace, ned_offset};
use crate::error::MatrixError;
use crate::linalg::{
    checked_add, checked_mul, clamp_diagonal, joseph_update, robust_spd_solve, symmetrize, transpose,
};
use crate::linearize::{
    ACCEL_BIAS, ATTITUDE, ERROR_STATES, GPS_MEASUREMENTS, GYRO_BIAS, POSITION, VELOCITY,
    error_state_transition, gps_measurement_matrix, gps_measurement_noise, process_noise,
};
use crate::messages::{AhrsDrState, GpsFix, ImuSample, InsState, SensorData};
use crate::status::FilterStatus;
use crate::{euler_from_quaternion, quaternion_from_euler};

/// Outcome of offering a fix to the filter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FixOutcome {
    Accepted,
    AcceptedInflated,
    Rejected,
}

/// Everything a step can change, preallocated so that saving it does not allocate
#[derive(Clone, Debug)]
struct Checkpoint {
    position: (f64, f64, f64),
    velocity: Vector3<f64>,
    attitude: UnitQuaternion<f64>,
    accel_bias: Vector3<f64>,
    gyro_bias: Vector3<f64>,
    covariance: DMatrix<f64>,
    consecutive_rejections: u32,
    elapsed: f64,
    last_fix_time: f64,
    innovation: [f64; GPS_MEASUREMENTS],
    innovation_covariance: [f64; GPS_MEASUREMENTS],
}

impl Checkpoint {
    fn new() -> Self {
        Checkpoint {
            position: (0.0, 0.0, 0.0),
            velocity: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            accel_bias: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            covariance: DMatrix::zeros(ERROR_STATES, ERROR_STATES),
            consecutive_rejections: 0,
            elapsed: 0.0,
            last_fix_time: 0.0,
            innovation: [0.0; GPS_MEASUREMENTS],
            innovation_covariance: [0.0; GPS_MEASUREMENTS],
        }
    }
}

/// GPS-aided strapdown INS
#[derive(Clone, Debug)]
pub struct GpsIns {
    config: InsConfig,
    /// [s] step period
    dt: f64,
    /// Latitude [rad], longitude [rad], altitude [m]
    position: (f64, f64, f64),
    /// [m/s] NED
    velocity: Vector3<f64>,
    /// Body-to-NED
    attitude: UnitQuaternion<f64>,
    accel_bias: Vector3<f64>,
    gyro_bias: Vector3<f64>,
    /// Error-state covariance (15x15)
    covariance: DMatrix<f64>,
    consecutive_rejections: u32,
    /// [s] filter time since initialization
    elapsed: f64,
    /// [s] filter time of the last locked fix offered to the filter
    last_fix_time: f64,
    innovation: [f64; GPS_MEASUREMENTS],
    innovation_covariance: [f64; GPS_MEASUREMENTS],
    /// State at the start of the current step
    checkpoint: Checkpoint,
}

impl Display for GpsIns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (roll, pitch, yaw) = euler_from_quaternion(&self.attitude);
        f.debug_struct("GpsIns")
            .field("latitude", &self.position.0.to_degrees())
            .field("longitude", &self.position.1.to_degrees())
            .field("altitude", &self.position.2)
            .field("velocity", &[self.velocity[0], self.velocity[1], self.velocity[2]])
            .field("attitude", &[roll, pitch, yaw])
            .field("elapsed", &self.elapsed)
            .finish()
    }
}

impl GpsIns {
    pub fn new(config: InsConfig, dt: f64) -> Self {
        GpsIns {
            config,
            dt,
            position: (0.0, 0.0, 0.0),
            velocity: Vector3::zeros(),
            attitude: UnitQuaternion::identity(),
            accel_bias: Vector3::zeros(),
            gyro_bias: Vector3::zeros(),
            covariance: DMatrix::identity(ERROR_STATES, ERROR_STATES),
            consecutive_rejections: 0,
            elapsed: 0.0,
            last_fix_time: 0.0,
            innovation: [0.0; GPS_MEASUREMENTS],
            innovation_covariance: [0.0; GPS_MEASUREMENTS],
            checkpoint: Checkpoint::new(),
        }
    }
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }
    pub fn position(&self) -> (f64, f64, f64) {
        self.position
    }
    pub fn velocity(&self) -> &Vector3<f64> {
        &self.velocity
    }
    pub fn attitude(&self) -> &UnitQuaternion<f64> {
        &self.attitude
    }
    /// Seed the filter from a locked fix and the AHRS attitude
    ///
    /// # Panics
    ///
    /// When the receiver is not locked. The scheduler only initializes the INS with a lock, so
    /// reaching this without one is a sequencing bug.
    pub fn initialize(&mut self, sensors: &SensorData, ahrs_dr: &AhrsDrState, state: &mut InsState) {
        let fix = &*sensors.gps;
        assert!(
            fix.is_locked(),
            "GPS-aided INS initialized without a GPS lock (nav_valid = {})",
            fix.nav_valid
        );
        let c = &self.config;
        self.position = fix.position_rad();
        self.velocity = Vector3::from(fix.velocity_ned());
        self.attitude = quaternion_from_euler(ahrs_dr.phi, ahrs_dr.the, ahrs_dr.psi);
        self.accel_bias = Vector3::zeros();
        self.gyro_bias = Vector3::from(ahrs_dr.gb);

        let seed = |reported: f64, initial: f64| -> f64 {
            if reported.is_finite() && reported > 0.0 {
                reported.max(initial)
            } else {
                initial
            }
        };
        let mut diagonal = DVector::<f64>::zeros(ERROR_STATES);
        let pos = [fix.sig_n, fix.sig_e, fix.sig_d];
        let vel = [fix.sig_vn, fix.sig_ve, fix.sig_vd];
        for i in 0..3 {
            diagonal[POSITION + i] = seed(pos[i], c.initial_position_sigma).powi(2);
            diagonal[VELOCITY + i] = seed(vel[i], c.initial_velocity_sigma).powi(2);
            diagonal[ATTITUDE + i] = c.initial_attitude_sigma[i].powi(2);
            diagonal[ACCEL_BIAS + i] = c.initial_accel_bias_sigma.powi(2);
            diagonal[GYRO_BIAS + i] = c.initial_gyro_bias_sigma.powi(2);
        }
        self.covariance = DMatrix::from_diagonal(&diagonal);
        self.consecutive_rejections = 0;
        self.elapsed = 0.0;
        self.last_fix_time = 0.0;
        self.innovation = [0.0; GPS_MEASUREMENTS];
        self.innovation_covariance = [0.0; GPS_MEASUREMENTS];
        self.write_state(state, FilterStatus::TimeUpdateOnly);
        info!(
            "INS initialized: lat {:.7}, lon {:.7} deg, alt {:.1} m, yaw {:.3} rad",
            fix.lat, fix.lon, fix.alt, state.psi
        );
    }
    /// One time update, plus a measurement update when a new locked fix arrived intact
    pub fn step(&mut self, sensors: &SensorData, state: &mut InsState) {
        self.save_checkpoint();
        match self.try_step(sensors) {
            Ok(status) => self.write_state(state, status),
            Err(e) => {
                self.restore_checkpoint();
                warn!("INS step failed, state restored: {}", e);
                state.status = FilterStatus::UpdateFailed;
            }
        }
    }
    pub fn close(&mut self) {
        info!("INS closed: {}", self);
    }
    fn save_checkpoint(&mut self) {
        let c = &mut self.checkpoint;
        c.position = self.position;
        c.velocity = self.velocity;
        c.attitude = self.attitude;
        c.accel_bias = self.accel_bias;
        c.gyro_bias = self.gyro_bias;
        c.covariance.copy_from(&self.covariance);
        c.consecutive_rejections = self.consecutive_rejections;
        c.elapsed = self.elapsed;
        c.last_fix_time = self.last_fix_time;
        c.innovation = self.innovation;
        c.innovation_covariance = self.innovation_covariance;
    }
    fn restore_checkpoint(&mut self) {
        let c = &self.checkpoint;
        self.position = c.position;
        self.velocity = c.velocity;
        self.attitude = c.attitude;
        self.accel_bias = c.accel_bias;
        self.gyro_bias = c.gyro_bias;
        self.covariance.copy_from(&c.covariance);
        self.consecutive_rejections = c.consecutive_rejections;
        self.elapsed = c.elapsed;
        self.last_fix_time = c.last_fix_time;
        self.innovation = c.innovation;
        self.innovation_covariance = c.innovation_covariance;
    }
    fn try_step(&mut self, sensors: &SensorData) -> Result<FilterStatus, MatrixError> {
        if sensors.imu.status.is_usable() {
            self.time_update(sensors.imu)?;
        } else {
            debug!("INS time update skipped, IMU status {:?}", sensors.imu.status);
        }
        self.elapsed += self.dt;

        let fix = &*sensors.gps;
        if !fix.has_new_fix() {
            return Ok(FilterStatus::TimeUpdateOnly);
        }
        Ok(match self.measurement_update(fix)? {
            FixOutcome::Accepted => FilterStatus::GpsAided,
            FixOutcome::AcceptedInflated => FilterStatus::InflatedGpsAided,
            FixOutcome::Rejected => FilterStatus::TimeUpdateOnly,
        })
    }
    /// Strapdown mechanization and covariance propagation
    fn time_update(&mut self, imu: &ImuSample) -> Result<(), MatrixError> {
        let dt = self.dt;
        let omega = Vector3::from(imu.rates()) - self.gyro_bias;
        let f_b = Vector3::from(imu.specific_force()) - self.accel_bias;
        let c_nb = self.attitude.to_rotation_matrix().into_inner();
        let f_n = c_nb * f_b;

        let (lat, _, alt) = self.position;
        let gravity = Vector3::new(0.0, 0.0, earth::gravity(lat, alt));
        let velocity = self.velocity + (f_n + gravity) * dt;
        self.position = displace(self.position, &((self.velocity + velocity) * 0.5 * dt));
        self.velocity = velocity;
        self.attitude *= UnitQuaternion::from_scaled_axis(omega * dt);

        let phi = error_state_transition(&c_nb, &f_n, &self.config, dt);
        let propagated = checked_mul(&checked_mul(&phi, &self.covariance)?, &transpose(&phi))?;
        let mut p = symmetrize(&checked_add(&propagated, &process_noise(&self.config, dt))?);
        ensure_finite("ins_time_update", &p)?;
        self.regularize(&mut p);
        self.covariance = p;
        Ok(())
    }
    fn measurement_update(&mut self, fix: &GpsFix) -> Result<FixOutcome, MatrixError> {
        let gap = self.elapsed - self.last_fix_time;
        self.last_fix_time = self.elapsed;
        let inflated = self.consecutive_rejections >= self.config.max_consecutive_rejections
            || gap > self.config.lock_gap_inflation;
        if inflated {
            info!(
                "INS covariance inflated by {} (rejections {}, lock gap {:.1} s)",
                self.config.inflation_factor, self.consecutive_rejections, gap
            );
            self.inflate();
        }

        let residual_p = ned_offset(self.position, fix.position_rad());
        let residual_v = Vector3::from(fix.velocity_ned()) - self.velocity;
        let z = DMatrix::from_column_slice(
            GPS_MEASUREMENTS,
            1,
            &[
                residual_p[0],
                residual_p[1],
                residual_p[2],
                residual_v[0],
                residual_v[1],
                residual_v[2],
            ],
        );
        if z.iter().any(|v| !v.is_finite()) {
            return Err(MatrixError::NonFinite { op: "gps_innovation" });
        }

        let h = gps_measurement_matrix();
        let r = gps_measurement_noise(fix, &self.config);
        let ph_t = checked_mul(&self.covariance, &transpose(&h))?;
        let s = symmetrize(&checked_add(&checked_mul(&h, &ph_t)?, &r)?);
        let s_inv_z = robust_spd_solve(&s, &z)?;
        let nis = z.dot(&s_inv_z);
        for i in 0..GPS_MEASUREMENTS {
            self.innovation[i] = z[(i, 0)];
            self.innovation_covariance[i] = s[(i, i)];
        }
        if !nis.is_finite() {
            return Err(MatrixError::NonFinite { op: "gps_nis" });
        }
        if nis > self.config.innovation_gate {
            self.consecutive_rejections += 1;
            warn!(
                "INS rejected GPS fix: NIS {:.1} > {:.1} ({} consecutive)",
                nis, self.config.innovation_gate, self.consecutive_rejections
            );
            return Ok(FixOutcome::Rejected);
        }

        // K = P Hᵀ S⁻¹ = (S⁻¹ H P)ᵀ with S and P symmetric
        let k = transpose(&robust_spd_solve(&s, &transpose(&ph_t))?);
        let dx = checked_mul(&k, &z)?;
        let mut p = joseph_update(&self.covariance, &k, &h, &r)?;
        ensure_finite("ins_measurement_update", &p)?;
        self.regularize(&mut p);
        self.covariance = p;
        self.inject(&dx);
        self.consecutive_rejections = 0;
        debug!("INS GPS update: NIS {:.3}, innovation {:?}", nis, self.innovation);
        Ok(if inflated {
            FixOutcome::AcceptedInflated
        } else {
            FixOutcome::Accepted
        })
    }
    /// Fold an estimated error state into the nominal state
    fn inject(&mut self, dx: &DMatrix<f64>) {
        let block = |offset: usize| Vector3::new(dx[offset], dx[offset + 1], dx[offset + 2]);
        self.position = displace(self.position, &block(POSITION));
        self.velocity += block(VELOCITY);
        self.attitude = UnitQuaternion::from_scaled_axis(block(ATTITUDE)) * self.attitude;
        self.accel_bias += block(ACCEL_BIAS);
        self.gyro_bias += block(GYRO_BIAS);
    }
    fn inflate(&mut self) {
        let factor = self.config.inflation_factor;
        for i in POSITION..ATTITUDE {
            for j in 0..ERROR_STATES {
                self.covariance[(i, j)] *= factor.sqrt();
                self.covariance[(j, i)] *= factor.sqrt();
            }
        }
    }
    fn regularize(&self, p: &mut DMatrix<f64>) {
        clamp_diagonal(p, self.config.covariance_regularization);
    }
    fn write_state(&self, state: &mut InsState, status: FilterStatus) {
        let (lat, lon, alt) = self.position;
        let (phi, the, psi) = euler_from_quaternion(&self.attitude);
        let q = self.attitude.quaternion();
        let diag = |offset: usize| {
            [
                self.covariance[(offset, offset)],
                self.covariance[(offset + 1, offset + 1)],
                self.covariance[(offset + 2, offset + 2)],
            ]
        };
        state.lat = lat;
        state.lon = lon;
        state.alt = alt;
        state.vn = self.velocity[0];
        state.ve = self.velocity[1];
        state.vd = self.velocity[2];
        state.phi = phi;
        state.the = the;
        state.psi = psi;
        state.quat = [q.w, q.i, q.j, q.k];
        state.ab = self.accel_bias.into();
        state.gb = self.gyro_bias.into();
        state.pp = diag(POSITION);
        state.pv = diag(VELOCITY);
        state.pa = diag(ATTITUDE);
        state.pab = diag(ACCEL_BIAS);
        state.pgb = diag(GYRO_BIAS);
        state.status = status;
        state.gps_innov = self.innovation;
        state.gps_innov_covar = self.innovation_covariance;
    }
}

fn ensure_finite(op: &'static str, m: &DMatrix<f64>) -> Result<(), MatrixError> {
    if m.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(MatrixError::NonFinite { op })
    }
}
