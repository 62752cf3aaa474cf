//! Run-time configuration for the navigation core.
//!
//! Every section has defaults matching the flight code, so a configuration file only needs the
//! values it changes. Files are read and written as JSON, YAML, or TOML depending on the
//! extension.
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::error::NavError;

/// Attitude/heading reference filter tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AhrsConfig {
    /// [Gauss] local magnetic field in NED used for the heading observation
    pub magnetic_reference: [f64; 3],
    /// Cycles after initialization during which the gyro bias is a running average
    pub settling_cycles: u32,
    /// [rad] initial attitude standard deviation
    pub initial_attitude_sigma: f64,
    /// [rad/s] initial gyro bias standard deviation
    pub initial_gyro_bias_sigma: f64,
    /// [rad/s/sqrt(Hz)] gyro angle random walk
    pub gyro_noise: f64,
    /// [rad/s/sqrt(s)] gyro bias random walk
    pub gyro_bias_noise: f64,
    /// [rad] roll/pitch observation noise from the accelerometers
    pub accel_observation_sigma: f64,
    /// [rad] heading observation noise from the magnetometer
    pub mag_observation_sigma: f64,
    /// [m/s^2] reject the gravity observation when |‖f‖ - g| exceeds this
    pub gravity_tolerance: f64,
    /// [1/s^2] integral gain from the attitude innovation into the gyro bias
    pub bias_gain: f64,
}

impl Default for AhrsConfig {
    fn default() -> Self {
        AhrsConfig {
            magnetic_reference: [0.174935, 0.001217, 0.526664],
            settling_cycles: 100,
            initial_attitude_sigma: 0.05,
            initial_gyro_bias_sigma: 0.01,
            gyro_noise: 0.003,
            gyro_bias_noise: 1e-4,
            accel_observation_sigma: 0.05,
            mag_observation_sigma: 0.1,
            gravity_tolerance: 0.5,
            bias_gain: 0.04,
        }
    }
}

/// Dead-reckoning filter tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadReckoningConfig {
    /// [deg, deg, m] position used when no fix has ever been received
    pub default_position: [f64; 3],
    pub initial_position_sigma: f64,
    pub initial_velocity_sigma: f64,
    pub initial_wind_sigma: f64,
    pub initial_hoffset_sigma: f64,
    /// [m/s] airspeed measurement noise, drives the velocity variance
    pub airspeed_sigma: f64,
    /// [(m/s)^2 / s] wind random walk
    pub wind_process_noise: f64,
    /// [m^2 / s] baro offset random walk
    pub hoffset_process_noise: f64,
    /// Fallbacks when the receiver does not report accuracy
    pub gps_position_sigma: f64,
    pub gps_velocity_sigma: f64,
    pub gps_altitude_sigma: f64,
    /// [m] largest position correction applied in a single cycle
    pub max_position_slew: f64,
    /// [m] largest baro offset correction applied in a single cycle
    pub max_hoffset_slew: f64,
}

impl Default for DeadReckoningConfig {
    fn default() -> Self {
        DeadReckoningConfig {
            default_position: [44.7258, -93.0758, 278.0],
            initial_position_sigma: 10.0,
            initial_velocity_sigma: 2.0,
            initial_wind_sigma: 5.0,
            initial_hoffset_sigma: 10.0,
            airspeed_sigma: 1.0,
            wind_process_noise: 0.01,
            hoffset_process_noise: 0.01,
            gps_position_sigma: 3.0,
            gps_velocity_sigma: 0.2,
            gps_altitude_sigma: 5.0,
            max_position_slew: 0.25,
            max_hoffset_slew: 0.05,
        }
    }
}

/// GPS-aided INS tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InsConfig {
    pub initial_position_sigma: f64,
    pub initial_velocity_sigma: f64,
    /// [rad] roll, pitch, yaw
    pub initial_attitude_sigma: [f64; 3],
    pub initial_accel_bias_sigma: f64,
    pub initial_gyro_bias_sigma: f64,
    /// [m/s^2/sqrt(Hz)] accelerometer velocity random walk
    pub accel_noise: f64,
    /// [rad/s/sqrt(Hz)] gyro angle random walk
    pub gyro_noise: f64,
    /// Gauss-Markov bias models: steady-state sigma and correlation time
    pub accel_bias_sigma: f64,
    pub accel_bias_tau: f64,
    pub gyro_bias_sigma: f64,
    pub gyro_bias_tau: f64,
    /// Fallbacks when the receiver does not report accuracy
    pub gps_position_sigma: f64,
    pub gps_velocity_sigma: f64,
    /// Lower bounds on the measurement noise regardless of what the receiver claims
    pub gps_position_sigma_floor: f64,
    pub gps_velocity_sigma_floor: f64,
    /// Normalized innovation squared above which a fix is rejected
    pub innovation_gate: f64,
    /// Consecutive rejections that trigger covariance inflation
    pub max_consecutive_rejections: u32,
    /// [s] lock gap after which covariance is inflated before the next fix
    pub lock_gap_inflation: f64,
    /// Multiplier applied to the position/velocity covariance on inflation
    pub inflation_factor: f64,
    /// Floor on the covariance diagonal after every covariance update
    pub covariance_regularization: f64,
}

impl Default for InsConfig {
    fn default() -> Self {
        InsConfig {
            initial_position_sigma: 5.0,
            initial_velocity_sigma: 0.5,
            initial_attitude_sigma: [0.05, 0.05, 0.1],
            initial_accel_bias_sigma: 0.1,
            initial_gyro_bias_sigma: 0.005,
            accel_noise: 0.05,
            gyro_noise: 0.003,
            accel_bias_sigma: 0.05,
            accel_bias_tau: 300.0,
            gyro_bias_sigma: 5e-4,
            gyro_bias_tau: 300.0,
            gps_position_sigma: 3.0,
            gps_velocity_sigma: 0.2,
            gps_position_sigma_floor: 0.5,
            gps_velocity_sigma_floor: 0.05,
            innovation_gate: 50.0,
            max_consecutive_rejections: 5,
            lock_gap_inflation: 10.0,
            inflation_factor: 10.0,
            covariance_regularization: 1e-12,
        }
    }
}

/// Blending filter tuning
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    /// INS weight right after initialization
    pub initial_ins_weight: f64,
    /// Largest INS weight while the INS is GPS aided
    pub aided_ceiling: f64,
    /// Largest INS weight right after a covariance inflation
    pub inflated_ceiling: f64,
    /// [s] time without an accepted fix after which the INS counts as coasting
    pub coast_grace: f64,
    /// [s] time constant of the INS weight decay while it coasts without GPS
    pub coast_time_constant: f64,
    /// [1/s] largest rate at which the INS weight may increase
    pub recovery_rate: f64,
    /// Scale the weights by the relative uncertainty of the two solutions
    pub use_uncertainty: bool,
}

impl Default for BlendConfig {
    fn default() -> Self {
        BlendConfig {
            initial_ins_weight: 0.5,
            aided_ceiling: 0.95,
            inflated_ceiling: 0.7,
            coast_grace: 3.0,
            coast_time_constant: 20.0,
            recovery_rate: 0.5,
            use_uncertainty: true,
        }
    }
}

/// Loop timing
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// [s] base period of the navigation/control loop
    pub period: f64,
    /// [Hz] rate at which telemetry snapshots are published
    pub telemetry_hz: f64,
    /// Snapshots buffered per reader before new ones are dropped
    pub snapshot_capacity: usize,
}

impl SchedulerConfig {
    pub fn base_hz(&self) -> f64 {
        1.0 / self.period
    }
    /// Number of base cycles between telemetry snapshots
    pub fn telemetry_divider(&self) -> u64 {
        ((self.base_hz() / self.telemetry_hz).round() as u64).max(1)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            period: 0.02,
            telemetry_hz: 10.0,
            snapshot_capacity: 64,
        }
    }
}

/// Trim values added to every actuator command
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// [0-1]
    pub throttle: f64,
    /// [rad]
    pub elevator: f64,
    pub rudder: f64,
    pub aileron: f64,
    pub left_flap: f64,
    pub right_flap: f64,
}

impl Default for TrimConfig {
    fn default() -> Self {
        TrimConfig {
            throttle: 0.65,
            elevator: -0.09,
            rudder: 0.0,
            aileron: -0.06,
            left_flap: -0.09,
            right_flap: 0.0,
        }
    }
}

/// Actuator saturation limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurfaceLimits {
    /// [rad]
    pub surface_min: f64,
    pub surface_max: f64,
    /// [0-1]
    pub throttle_min: f64,
    pub throttle_max: f64,
}

impl SurfaceLimits {
    pub fn saturate(&self, command: f64) -> f64 {
        command.clamp(self.surface_min, self.surface_max)
    }
}

impl Default for SurfaceLimits {
    fn default() -> Self {
        SurfaceLimits {
            surface_min: -0.4363,
            surface_max: 0.4363,
            throttle_min: 0.0,
            throttle_max: 1.0,
        }
    }
}

/// Complete configuration of the navigation core
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NavConfig {
    pub ahrs: AhrsConfig,
    pub dead_reckoning: DeadReckoningConfig,
    pub ins: InsConfig,
    pub blend: BlendConfig,
    pub scheduler: SchedulerConfig,
    pub trim: TrimConfig,
    pub limits: SurfaceLimits,
}

fn positive(name: &str, value: f64) -> Result<(), NavError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(NavError::Config(format!("{name} must be positive, got {value}")))
    }
}
fn unit_interval(name: &str, value: f64) -> Result<(), NavError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(NavError::Config(format!("{name} must lie in [0, 1], got {value}")))
    }
}

impl NavConfig {
    /// Reject configurations the filters cannot run with
    pub fn validate(&self) -> Result<(), NavError> {
        positive("scheduler.period", self.scheduler.period)?;
        positive("scheduler.telemetry_hz", self.scheduler.telemetry_hz)?;
        if self.scheduler.snapshot_capacity == 0 {
            return Err(NavError::Config("scheduler.snapshot_capacity must be at least 1".into()));
        }
        let field = &self.ahrs.magnetic_reference;
        if (field[0] * field[0] + field[1] * field[1]).sqrt() <= 0.0 {
            return Err(NavError::Config(
                "ahrs.magnetic_reference needs a horizontal component".into(),
            ));
        }
        positive("ahrs.accel_observation_sigma", self.ahrs.accel_observation_sigma)?;
        positive("ahrs.mag_observation_sigma", self.ahrs.mag_observation_sigma)?;
        unit_interval("ahrs.bias_gain", self.ahrs.bias_gain)?;
        positive("dead_reckoning.gps_position_sigma", self.dead_reckoning.gps_position_sigma)?;
        positive("dead_reckoning.gps_velocity_sigma", self.dead_reckoning.gps_velocity_sigma)?;
        positive("dead_reckoning.gps_altitude_sigma", self.dead_reckoning.gps_altitude_sigma)?;
        positive("dead_reckoning.max_position_slew", self.dead_reckoning.max_position_slew)?;
        positive("dead_reckoning.max_hoffset_slew", self.dead_reckoning.max_hoffset_slew)?;
        positive("ins.accel_bias_tau", self.ins.accel_bias_tau)?;
        positive("ins.gyro_bias_tau", self.ins.gyro_bias_tau)?;
        positive("ins.gps_position_sigma_floor", self.ins.gps_position_sigma_floor)?;
        positive("ins.gps_velocity_sigma_floor", self.ins.gps_velocity_sigma_floor)?;
        positive("ins.innovation_gate", self.ins.innovation_gate)?;
        if self.ins.inflation_factor < 1.0 {
            return Err(NavError::Config("ins.inflation_factor must be >= 1".into()));
        }
        unit_interval("blend.initial_ins_weight", self.blend.initial_ins_weight)?;
        unit_interval("blend.aided_ceiling", self.blend.aided_ceiling)?;
        unit_interval("blend.inflated_ceiling", self.blend.inflated_ceiling)?;
        positive("blend.coast_grace", self.blend.coast_grace)?;
        positive("blend.coast_time_constant", self.blend.coast_time_constant)?;
        positive("blend.recovery_rate", self.blend.recovery_rate)?;
        if self.limits.surface_min > self.limits.surface_max
            || self.limits.throttle_min > self.limits.throttle_max
        {
            return Err(NavError::Config("actuator limits are inverted".into()));
        }
        Ok(())
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(io::Error::other)
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(io::Error::other)
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(io::Error::other)?;
        file.write_all(s.as_bytes())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(io::Error::other)
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported file extension",
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}
