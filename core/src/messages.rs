//! Sensor, control, and navigation-state structures exchanged once per cycle.
//!
//! The acquisition layer fills the sensor structures, the navigation filters write the state
//! structures, and guidance/control read the blended [`NavEstimate`] and write the
//! [`ControlState`]. Vectors are stored as plain `[f64; 3]` arrays so every structure is `Copy`,
//! serializable, and cheap to snapshot for the lower-priority logging and telemetry tasks.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::config::{SurfaceLimits, TrimConfig};
use crate::status::{FilterStatus, SensorStatus};

/// Seconds between the Unix epoch and the GPS epoch (1980-01-06T00:00:00Z)
const GPS_EPOCH_UNIX: i64 = 315_964_800;
/// GPS-UTC leap second offset
const GPS_LEAP_SECONDS: i64 = 18;
const SECONDS_PER_WEEK: i64 = 604_800;

/// One inertial measurement unit sample
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// [rad/s] body X axis angular rate (roll)
    pub p: f64,
    /// [rad/s] body Y axis angular rate (pitch)
    pub q: f64,
    /// [rad/s] body Z axis angular rate (yaw)
    pub r: f64,
    /// [m/s^2] body X axis specific force
    pub ax: f64,
    /// [m/s^2] body Y axis specific force
    pub ay: f64,
    /// [m/s^2] body Z axis specific force
    pub az: f64,
    /// [Gauss] body X axis magnetic field
    pub hx: f64,
    /// [Gauss] body Y axis magnetic field
    pub hy: f64,
    /// [Gauss] body Z axis magnetic field
    pub hz: f64,
    /// [rad] Euler angles, only populated when the sensor reports its own attitude
    pub attitude: Option<[f64; 3]>,
    /// [degC] sensor temperature
    pub temperature: f32,
    /// [V] supply voltage
    pub supply_voltage: f32,
    pub status: SensorStatus,
    /// [s] timestamp
    pub time: f64,
}

impl ImuSample {
    pub fn rates(&self) -> [f64; 3] {
        [self.p, self.q, self.r]
    }
    pub fn specific_force(&self) -> [f64; 3] {
        [self.ax, self.ay, self.az]
    }
    pub fn magnetic_field(&self) -> [f64; 3] {
        [self.hx, self.hy, self.hz]
    }
}

impl Display for ImuSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ImuSample(t: {:.3}, gyro: [{:.5}, {:.5}, {:.5}], accel: [{:.4}, {:.4}, {:.4}], status: {:?})",
            self.time, self.p, self.q, self.r, self.ax, self.ay, self.az, self.status
        )
    }
}

/// GPS receiver solution
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    /// [deg] geodetic latitude
    pub lat: f64,
    /// [deg] geodetic longitude
    pub lon: f64,
    /// [m] altitude relative to WGS84
    pub alt: f64,
    /// [m/s] NED velocity
    pub vn: f64,
    pub ve: f64,
    pub vd: f64,
    /// [m] ECEF position
    pub ecef_position: [f64; 3],
    /// [m/s] ECEF velocity
    pub ecef_velocity: [f64; 3],
    /// [m] position standard deviations, north/east/down
    pub sig_n: f64,
    pub sig_e: f64,
    pub sig_d: f64,
    /// [m/s] velocity standard deviations, north/east/down
    pub sig_vn: f64,
    pub sig_ve: f64,
    pub sig_vd: f64,
    /// [s] GPS time of week
    pub time_of_week: f64,
    pub week: u16,
    /// [rad] course over ground, relative to true north
    pub course_over_ground: f64,
    /// [m/s] speed over ground
    pub speed_over_ground: f64,
    /// Receiver solution flag, `0` means the receiver has a valid lock
    pub nav_valid: u16,
    pub satellites: u16,
    /// Set by the acquisition layer when this structure holds a fix not yet consumed
    pub new_data: bool,
    pub status: SensorStatus,
    /// [s] timestamp
    pub time: f64,
}

impl Default for GpsFix {
    fn default() -> Self {
        GpsFix {
            lat: 0.0,
            lon: 0.0,
            alt: 0.0,
            vn: 0.0,
            ve: 0.0,
            vd: 0.0,
            ecef_position: [0.0; 3],
            ecef_velocity: [0.0; 3],
            sig_n: 0.0,
            sig_e: 0.0,
            sig_d: 0.0,
            sig_vn: 0.0,
            sig_ve: 0.0,
            sig_vd: 0.0,
            time_of_week: 0.0,
            week: 0,
            course_over_ground: 0.0,
            speed_over_ground: 0.0,
            nav_valid: 1,
            satellites: 0,
            new_data: false,
            status: SensorStatus::NoData,
            time: 0.0,
        }
    }
}

impl GpsFix {
    /// The receiver reports a valid solution in an intact packet
    pub fn is_locked(&self) -> bool {
        self.nav_valid == 0 && self.status.is_usable()
    }
    /// A locked solution that has not been consumed yet
    pub fn has_new_fix(&self) -> bool {
        self.new_data && self.is_locked()
    }
    /// Geodetic position with latitude and longitude in radians
    pub fn position_rad(&self) -> (f64, f64, f64) {
        (self.lat.to_radians(), self.lon.to_radians(), self.alt)
    }
    pub fn velocity_ned(&self) -> [f64; 3] {
        [self.vn, self.ve, self.vd]
    }
    /// UTC time of the solution, derived from GPS week and time of week
    pub fn utc_time(&self) -> Option<DateTime<Utc>> {
        if !self.time_of_week.is_finite() || self.time_of_week < 0.0 {
            return None;
        }
        let whole = self.time_of_week.floor();
        let nanos = ((self.time_of_week - whole) * 1e9).round() as u32;
        let seconds = GPS_EPOCH_UNIX + self.week as i64 * SECONDS_PER_WEEK + whole as i64
            - GPS_LEAP_SECONDS;
        DateTime::from_timestamp(seconds, nanos.min(999_999_999))
    }
}

impl Display for GpsFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GpsFix(lat: {:.7}, lon: {:.7}, alt: {:.2}, vel: [{:.2}, {:.2}, {:.2}], locked: {}, new: {}, sats: {})",
            self.lat,
            self.lon,
            self.alt,
            self.vn,
            self.ve,
            self.vd,
            self.is_locked(),
            self.new_data,
            self.satellites
        )
    }
}

/// Air data sample
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AirData {
    /// [m] barometric altitude above ground level
    pub h: f64,
    /// [m] barometric altitude above mean sea level
    pub h_msl: f64,
    /// [m/s] indicated airspeed
    pub ias: f64,
    /// [m] filtered altitude (MSL)
    pub h_filt: f64,
    /// [m/s] filtered airspeed
    pub ias_filt: f64,
    /// [kPa] static pressure
    pub ps: f64,
    /// [kPa] dynamic pressure
    pub pd: f64,
    /// [rad] angle of attack and sideslip from the 5-hole probe
    pub aoa: f64,
    pub aos: f64,
    /// [rad] vane angles
    pub l_alpha: f64,
    pub r_alpha: f64,
    pub l_beta: f64,
    pub r_beta: f64,
    /// [kPa] probe differential pressures for aoa/aos
    pub pd_aoa: f64,
    pub pd_aos: f64,
    pub bias: [f64; 10],
    /// Sensor status bitfield
    pub status: u16,
}

impl AirData {
    /// Status bit set when the pitot airspeed channel is faulted
    pub const AIRSPEED_FAULT: u16 = 1 << 0;
    /// Status bit set when the static pressure (barometric altitude) channel is faulted
    pub const ALTITUDE_FAULT: u16 = 1 << 1;

    pub fn airspeed_valid(&self) -> bool {
        self.status & Self::AIRSPEED_FAULT == 0
    }
    pub fn altitude_valid(&self) -> bool {
        self.status & Self::ALTITUDE_FAULT == 0
    }
}

/// Measured control surface positions
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SurfacePositions {
    pub dthr_pos: f64,
    pub de_pos: f64,
    pub de_l_pos: f64,
    pub de_r_pos: f64,
    pub dr_pos: f64,
    pub dr_t_pos: f64,
    pub dr_b_pos: f64,
    pub da_l_pos: f64,
    pub da_r_pos: f64,
    pub df_l_pos: f64,
    pub df_r_pos: f64,
}

/// Pilot-selected operating mode, carried as a raw value on [`ControlState::mode`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMode {
    /// Stop the loop and flush logs
    Shutdown,
    Manual,
    Autopilot,
}

impl ControlMode {
    pub fn from_raw(mode: u16) -> Self {
        match mode {
            0 => ControlMode::Shutdown,
            2 => ControlMode::Autopilot,
            _ => ControlMode::Manual,
        }
    }
    pub fn as_raw(self) -> u16 {
        match self {
            ControlMode::Shutdown => 0,
            ControlMode::Manual => 1,
            ControlMode::Autopilot => 2,
        }
    }
}

/// Pilot inputs, autopilot references, and actuator commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    // R/C inputs
    pub dthr_in: f64,
    pub de_in: f64,
    pub dr_in: f64,
    pub da_l_in: f64,
    pub da_r_in: f64,
    pub df_l_in: f64,
    pub df_r_in: f64,
    pub dg_in: f64,
    // Actuator commands: throttle [0-1], surfaces [rad]
    pub dthr: f64,
    pub de: f64,
    pub dr: f64,
    pub da_l: f64,
    pub da_r: f64,
    pub df_l: f64,
    pub df_r: f64,
    // References
    pub phi_cmd: f64,
    pub theta_cmd: f64,
    pub psi_cmd: f64,
    pub p_cmd: f64,
    pub q_cmd: f64,
    pub r_cmd: f64,
    pub ias_cmd: f64,
    pub h_cmd: f64,
    pub gndtrk_cmd: f64,
    pub aoa_cmd: f64,
    pub aos_cmd: f64,
    pub gamma_cmd: f64,
    /// User-defined research signals
    pub signals: [f64; 10],
    /// 0 = shutdown / dump data, 1 = manual, 2 = autopilot
    pub mode: u16,
    /// Number of autopilot engagements so far
    pub run_num: u16,
}

impl ControlState {
    pub fn control_mode(&self) -> ControlMode {
        ControlMode::from_raw(self.mode)
    }
    /// Zero every command and reference. Pilot inputs, mode and run number are kept.
    pub fn reset(&mut self) {
        *self = ControlState {
            dthr_in: self.dthr_in,
            de_in: self.de_in,
            dr_in: self.dr_in,
            da_l_in: self.da_l_in,
            da_r_in: self.da_r_in,
            df_l_in: self.df_l_in,
            df_r_in: self.df_r_in,
            dg_in: self.dg_in,
            mode: self.mode,
            run_num: self.run_num,
            ..ControlState::default()
        };
    }
    /// Add trim values to the commands and saturate them to the actuator limits
    pub fn add_trim_bias(&mut self, trim: &TrimConfig, limits: &SurfaceLimits) {
        self.dthr = (self.dthr + trim.throttle).clamp(limits.throttle_min, limits.throttle_max);
        self.de = limits.saturate(self.de + trim.elevator);
        self.dr = limits.saturate(self.dr + trim.rudder);
        self.da_l = limits.saturate(self.da_l + trim.aileron);
        self.da_r = limits.saturate(self.da_r + trim.aileron);
        self.df_l = limits.saturate(self.df_l + trim.left_flap);
        self.df_r = limits.saturate(self.df_r + trim.right_flap);
    }
}

/// Borrowed view of one cycle's sensor structures
///
/// The structures belong to the top-level loop. The bundle only lives for the duration of a
/// single [`crate::scheduler::Scheduler::run_cycle`] call.
#[derive(Debug)]
pub struct SensorData<'a> {
    pub imu: &'a ImuSample,
    pub gps: &'a mut GpsFix,
    pub air: &'a AirData,
    pub surface: &'a SurfacePositions,
}

/// Attitude/heading reference and dead-reckoning solution
///
/// Written by the AHRS (attitude, gyro bias, angle covariance, `ahrs_status`) and by the DR
/// filter (everything positional, `dr_status`). Covariances are diagonal approximations stored
/// per component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AhrsDrState {
    /// [rad] geodetic latitude
    pub lat: f64,
    /// [rad] geodetic longitude
    pub lon: f64,
    /// [m] altitude relative to WGS84
    pub alt: f64,
    pub vn: f64,
    pub ve: f64,
    pub vd: f64,
    /// [rad] Euler angles
    pub phi: f64,
    pub the: f64,
    pub psi: f64,
    /// [m/s^2] accelerometer bias
    pub ab: [f64; 3],
    /// [rad/s] gyro bias
    pub gb: [f64; 3],
    /// [m^2] position variance, NED
    pub pp: [f64; 3],
    /// [(m/s)^2] velocity variance, NED
    pub pv: [f64; 3],
    /// [rad^2] attitude variance
    pub pa: [f64; 3],
    /// [(rad/s)^2] gyro bias variance
    pub pgb: [f64; 3],
    /// [m/s] wind, NED
    pub wind: [f64; 3],
    pub pwind: [f64; 3],
    /// [m] GPS altitude minus barometric altitude
    pub hoffset: f64,
    pub phoffset: f64,
    /// [m] position correction not yet applied to the solution, NED
    pub position_bias: [f64; 3],
    pub ahrs_status: FilterStatus,
    pub dr_status: FilterStatus,
    /// Innovation of the last GPS update (position NED [m], velocity NED [m/s])
    pub gps_innov: [f64; 6],
    /// Diagonal of the innovation covariance of the last GPS update
    pub gps_innov_covar: [f64; 6],
}

/// GPS-aided inertial solution
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InsState {
    /// [rad] geodetic latitude
    pub lat: f64,
    /// [rad] geodetic longitude
    pub lon: f64,
    /// [m] altitude relative to WGS84
    pub alt: f64,
    pub vn: f64,
    pub ve: f64,
    pub vd: f64,
    pub phi: f64,
    pub the: f64,
    pub psi: f64,
    /// Body-to-NED attitude quaternion [w, x, y, z]
    pub quat: [f64; 4],
    pub ab: [f64; 3],
    pub gb: [f64; 3],
    /// Diagonal blocks of the error-state covariance
    pub pp: [f64; 3],
    pub pv: [f64; 3],
    pub pa: [f64; 3],
    pub pab: [f64; 3],
    pub pgb: [f64; 3],
    pub status: FilterStatus,
    pub gps_innov: [f64; 6],
    pub gps_innov_covar: [f64; 6],
}

/// Blended navigation solution consumed by guidance and control
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NavEstimate {
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    pub vn: f64,
    pub ve: f64,
    pub vd: f64,
    pub phi: f64,
    pub the: f64,
    pub psi: f64,
    pub gb: [f64; 3],
    pub ab: [f64; 3],
    pub ahrsdr_att_weight: f64,
    pub insgps_att_weight: f64,
    pub ahrsdr_pos_weight: f64,
    pub insgps_pos_weight: f64,
    pub status: FilterStatus,
    /// [s] time of the cycle that produced the estimate
    pub time: f64,
}

impl Display for NavEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NavEstimate(t: {:.2}, lat: {:.7}, lon: {:.7}, alt: {:.2}, att: [{:.4}, {:.4}, {:.4}], w_att: {:.3}, w_pos: {:.3}, status: {})",
            self.time,
            self.lat.to_degrees(),
            self.lon.to_degrees(),
            self.alt,
            self.phi,
            self.the,
            self.psi,
            self.insgps_att_weight,
            self.insgps_pos_weight,
            self.status
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn gps_lock_semantics() {
        let mut fix = GpsFix::default();
        assert!(!fix.is_locked());
        fix.new_data = true;
        assert!(!fix.has_new_fix());
        fix.nav_valid = 0;
        assert!(!fix.has_new_fix());
        fix.status = SensorStatus::DataValid;
        assert!(fix.has_new_fix());
        for corrupt in [
            SensorStatus::ChecksumError,
            SensorStatus::IncompletePacket,
            SensorStatus::NoPacketHeader,
        ] {
            fix.status = corrupt;
            assert!(!fix.is_locked());
            assert!(!fix.has_new_fix());
        }
        fix.lat = 45.0;
        let (lat, _, _) = fix.position_rad();
        assert_approx_eq!(lat, std::f64::consts::FRAC_PI_4, 1e-15);
    }

    #[test]
    fn gps_week_to_utc() {
        let fix = GpsFix {
            week: 0,
            time_of_week: 18.0,
            ..GpsFix::default()
        };
        let utc = fix.utc_time().unwrap();
        assert_eq!(utc.to_rfc3339(), "1980-01-06T00:00:00+00:00");
        let later = GpsFix {
            week: 2000,
            time_of_week: 86_400.5,
            ..GpsFix::default()
        };
        let utc = later.utc_time().unwrap();
        assert_eq!(utc.timestamp(), GPS_EPOCH_UNIX + 2000 * SECONDS_PER_WEEK + 86_400 - 18);
        assert_eq!(utc.timestamp_subsec_millis(), 500);
    }

    #[test]
    fn control_mode_from_raw() {
        assert_eq!(ControlMode::from_raw(0), ControlMode::Shutdown);
        assert_eq!(ControlMode::from_raw(1), ControlMode::Manual);
        assert_eq!(ControlMode::from_raw(2), ControlMode::Autopilot);
        assert_eq!(ControlMode::from_raw(7), ControlMode::Manual);
        assert_eq!(ControlMode::Autopilot.as_raw(), 2);
    }

    #[test]
    fn reset_keeps_inputs_and_mode() {
        let mut control = ControlState {
            de_in: 0.1,
            de: 0.3,
            phi_cmd: 0.5,
            mode: 2,
            run_num: 3,
            signals: [1.0; 10],
            ..ControlState::default()
        };
        control.reset();
        assert_eq!(control.de, 0.0);
        assert_eq!(control.phi_cmd, 0.0);
        assert_eq!(control.signals, [0.0; 10]);
        assert_eq!(control.de_in, 0.1);
        assert_eq!(control.mode, 2);
        assert_eq!(control.run_num, 3);
    }

    #[test]
    fn trim_bias_is_saturated() {
        let trim = TrimConfig::default();
        let limits = SurfaceLimits::default();
        let mut control = ControlState::default();
        control.add_trim_bias(&trim, &limits);
        assert_approx_eq!(control.dthr, trim.throttle, 1e-15);
        assert_approx_eq!(control.de, trim.elevator, 1e-15);
        assert_approx_eq!(control.da_r, trim.aileron, 1e-15);

        control.de = 1.0;
        control.dthr = 0.9;
        control.add_trim_bias(&trim, &limits);
        assert_approx_eq!(control.de, limits.surface_max, 1e-15);
        assert_approx_eq!(control.dthr, limits.throttle_max, 1e-15);
    }
}
