//! Synthetic flight scenarios and a simulation runner
//!
//! This module provides:
//! - [`ScenarioConfig`]: steady level flight over a fixed origin, with optional wind, wind gusts
//!   and GPS outage windows
//! - [`SensorSimulator`]: the truth state of that flight and the IMU, GPS and air data samples
//!   an ideal (or noisy, see [`SensorNoise`]) sensor suite would report each cycle
//! - [`Simulation`]: the sensor simulator, a [`Scheduler`] and the loop-owned sensor and control
//!   structures, stepped one base period at a time
//! - [`NavigationRecord`]: one row of results per cycle with CSV import/export
//!
//! The synthetic IMU is consistent with the strapdown mechanization of [`crate::kalman`]: with
//! constant velocity and level attitude the accelerometers read $C^b_n (0, 0, -g)$ and the gyros
//! read only their bias.
use clap::ValueEnum;
use log::{debug, info};
use nalgebra::Vector3;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;

use crate::config::NavConfig;
use crate::earth::{self, displace, ned_offset};
use crate::error::NavError;
use crate::linalg::dcm_321;
use crate::messages::{AirData, ControlState, GpsFix, ImuSample, SensorData, SurfacePositions};
use crate::scheduler::{AutopilotStages, CycleReport, Scheduler, SchedulerState};
use crate::status::{FilterStatus, SensorStatus};
use crate::wrap_to_pi;

/// GPS week used for the synthetic time stamps
const SIM_GPS_WEEK: u16 = 2330;
/// [s] time of week at the start of every simulation
const SIM_START_TOW: f64 = 302_400.0;

/// Predefined flight profiles
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ScenarioKind {
    /// Aircraft at rest on the ground with a continuous GPS lock
    Static,
    /// Level flight at constant airspeed and heading in a steady wind
    #[default]
    StraightAndLevel,
    /// Straight and level with GPS outages
    GpsOutage,
    /// Straight and level with a wind gust during a GPS outage
    WindGust,
}

impl Display for ScenarioKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScenarioKind::Static => "static",
            ScenarioKind::StraightAndLevel => "straight-and-level",
            ScenarioKind::GpsOutage => "gps-outage",
            ScenarioKind::WindGust => "wind-gust",
        };
        write!(f, "{}", name)
    }
}

/// Closed-open interval of simulation time
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// [s]
    pub start: f64,
    /// [s]
    pub end: f64,
}

impl TimeWindow {
    pub fn new(start: f64, end: f64) -> Self {
        TimeWindow { start, end }
    }
    pub fn contains(&self, time: f64) -> bool {
        time >= self.start && time < self.end
    }
}

/// Wind added on top of the steady wind during a window
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Gust {
    pub window: TimeWindow,
    /// [m/s] north, east
    pub wind: [f64; 2],
}

/// One-sigma sensor errors
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorNoise {
    /// [rad/s]
    pub gyro: f64,
    /// [rad/s] constant gyro bias
    pub gyro_bias: [f64; 3],
    /// [m/s^2]
    pub accel: f64,
    /// [Gauss]
    pub mag: f64,
    /// [m]
    pub gps_position: f64,
    /// [m/s]
    pub gps_velocity: f64,
    /// [m/s]
    pub airspeed: f64,
    /// [m]
    pub baro: f64,
}

impl Default for SensorNoise {
    fn default() -> Self {
        SensorNoise {
            gyro: 1e-3,
            gyro_bias: [2e-3, -1e-3, 5e-4],
            accel: 0.02,
            mag: 2e-3,
            gps_position: 2.0,
            gps_velocity: 0.1,
            airspeed: 0.3,
            baro: 0.5,
        }
    }
}

/// Flight profile and sensor suite of a simulation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScenarioConfig {
    pub kind: ScenarioKind,
    /// [deg, deg, m] starting position
    pub origin: [f64; 3],
    /// [m/s]
    pub airspeed: f64,
    /// [rad] true heading
    pub heading: f64,
    /// [m/s] steady north and east wind
    pub wind: [f64; 2],
    pub gust: Option<Gust>,
    /// Windows during which the receiver reports no lock
    pub outages: Vec<TimeWindow>,
    /// Base cycles between GPS solutions
    pub gps_divider: u64,
    /// Noise-free sensors when absent
    pub noise: Option<SensorNoise>,
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        ScenarioConfig::new(ScenarioKind::default())
    }
}

impl ScenarioConfig {
    /// Noise-free profile of the given kind
    pub fn new(kind: ScenarioKind) -> Self {
        let mut scenario = ScenarioConfig {
            kind,
            origin: [44.7258, -93.0758, 350.0],
            airspeed: 20.0,
            heading: 0.6,
            wind: [2.0, -3.0],
            gust: None,
            outages: Vec::new(),
            gps_divider: 10,
            noise: None,
            seed: 42,
        };
        match kind {
            ScenarioKind::Static => {
                scenario.origin[2] = 278.0;
                scenario.airspeed = 0.0;
                scenario.wind = [0.0, 0.0];
            }
            ScenarioKind::StraightAndLevel => {}
            ScenarioKind::GpsOutage => {
                scenario.outages = vec![TimeWindow::new(40.0, 70.0), TimeWindow::new(100.0, 110.0)];
            }
            ScenarioKind::WindGust => {
                let window = TimeWindow::new(40.0, 70.0);
                scenario.outages = vec![window];
                scenario.gust = Some(Gust {
                    window,
                    wind: [3.0, 2.0],
                });
            }
        }
        scenario
    }
    pub fn with_noise(mut self, noise: SensorNoise) -> Self {
        self.noise = Some(noise);
        self
    }
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
    /// [m/s] north and east wind at `time`
    pub fn wind_at(&self, time: f64) -> [f64; 2] {
        match self.gust {
            Some(gust) if gust.window.contains(time) => {
                [self.wind[0] + gust.wind[0], self.wind[1] + gust.wind[1]]
            }
            _ => self.wind,
        }
    }
    pub fn gps_available(&self, time: f64) -> bool {
        !self.outages.iter().any(|w| w.contains(time))
    }
}

/// Aircraft state at one cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TruthState {
    /// [s]
    pub time: f64,
    /// [rad, rad, m]
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    /// [m/s] ground velocity
    pub vn: f64,
    pub ve: f64,
    pub vd: f64,
    /// [rad]
    pub phi: f64,
    pub the: f64,
    pub psi: f64,
    /// [m/s] north, east
    pub wind: [f64; 2],
}

impl TruthState {
    pub fn position(&self) -> (f64, f64, f64) {
        (self.lat, self.lon, self.alt)
    }
}

/// Generator of the truth trajectory and the matching sensor samples
#[derive(Debug)]
pub struct SensorSimulator {
    scenario: ScenarioConfig,
    /// [s]
    period: f64,
    /// [Gauss] NED reference field
    magnetic_reference: Vector3<f64>,
    /// [rad, rad, m]
    position: (f64, f64, f64),
    cycle: u64,
    rng: StdRng,
}

impl SensorSimulator {
    pub fn new(scenario: ScenarioConfig, period: f64, magnetic_reference: [f64; 3]) -> Self {
        let [lat, lon, alt] = scenario.origin;
        let rng = StdRng::seed_from_u64(scenario.seed);
        SensorSimulator {
            position: (lat.to_radians(), lon.to_radians(), alt),
            scenario,
            period,
            magnetic_reference: Vector3::from(magnetic_reference),
            cycle: 0,
            rng,
        }
    }
    pub fn scenario(&self) -> &ScenarioConfig {
        &self.scenario
    }
    /// Write this cycle's samples into the loop-owned sensor structures and advance the truth
    ///
    /// `gps` keeps its previous contents between receiver solutions, like the structure the
    /// acquisition layer fills on the aircraft.
    pub fn fill(&mut self, imu: &mut ImuSample, gps: &mut GpsFix, air: &mut AirData) -> TruthState {
        let time = self.cycle as f64 * self.period;
        let s = &self.scenario;
        let wind = s.wind_at(time);
        let (sy, cy) = s.heading.sin_cos();
        let ground = Vector3::new(
            s.airspeed * cy + wind[0],
            s.airspeed * sy + wind[1],
            0.0,
        );
        let (lat, lon, alt) = self.position;
        let truth = TruthState {
            time,
            lat,
            lon,
            alt,
            vn: ground[0],
            ve: ground[1],
            vd: ground[2],
            phi: 0.0,
            the: 0.0,
            psi: s.heading,
            wind,
        };
        let airspeed = s.airspeed;
        let gps_due = self.cycle % s.gps_divider.max(1) == 0;
        let locked = s.gps_available(time);
        let noise = s.noise.clone();

        self.fill_imu(imu, &truth, noise.as_ref());
        if gps_due {
            self.fill_gps(gps, &truth, locked, noise.as_ref());
        }
        self.fill_air(air, &truth, airspeed, noise.as_ref());

        self.position = displace(self.position, &(ground * self.period));
        self.cycle += 1;
        truth
    }
    fn fill_imu(&mut self, imu: &mut ImuSample, truth: &TruthState, noise: Option<&SensorNoise>) {
        let c_bn = dcm_321(truth.phi, truth.the, truth.psi);
        let gravity = Vector3::new(0.0, 0.0, -earth::gravity(truth.lat, truth.alt));
        let f = c_bn * gravity;
        let h = c_bn * self.magnetic_reference;
        let (gyro, bias, accel, mag) = match noise {
            Some(n) => (n.gyro, n.gyro_bias, n.accel, n.mag),
            None => (0.0, [0.0; 3], 0.0, 0.0),
        };
        imu.p = bias[0] + gaussian(&mut self.rng, gyro);
        imu.q = bias[1] + gaussian(&mut self.rng, gyro);
        imu.r = bias[2] + gaussian(&mut self.rng, gyro);
        imu.ax = f[0] + gaussian(&mut self.rng, accel);
        imu.ay = f[1] + gaussian(&mut self.rng, accel);
        imu.az = f[2] + gaussian(&mut self.rng, accel);
        imu.hx = h[0] + gaussian(&mut self.rng, mag);
        imu.hy = h[1] + gaussian(&mut self.rng, mag);
        imu.hz = h[2] + gaussian(&mut self.rng, mag);
        imu.temperature = 25.0;
        imu.supply_voltage = 5.0;
        imu.status = SensorStatus::DataValid;
        imu.time = truth.time;
    }
    fn fill_gps(
        &mut self,
        gps: &mut GpsFix,
        truth: &TruthState,
        locked: bool,
        noise: Option<&SensorNoise>,
    ) {
        gps.new_data = true;
        gps.time = truth.time;
        gps.week = SIM_GPS_WEEK;
        gps.time_of_week = SIM_START_TOW + truth.time;
        if !locked {
            gps.nav_valid = 1;
            gps.satellites = 2;
            gps.status = SensorStatus::GpsNoLock;
            return;
        }
        let (sig_p, sig_v) = noise.map_or((0.0, 0.0), |n| (n.gps_position, n.gps_velocity));
        let error = Vector3::new(
            gaussian(&mut self.rng, sig_p),
            gaussian(&mut self.rng, sig_p),
            gaussian(&mut self.rng, sig_p),
        );
        let (lat, lon, alt) = displace(truth.position(), &error);
        gps.lat = lat.to_degrees();
        gps.lon = lon.to_degrees();
        gps.alt = alt;
        gps.vn = truth.vn + gaussian(&mut self.rng, sig_v);
        gps.ve = truth.ve + gaussian(&mut self.rng, sig_v);
        gps.vd = truth.vd + gaussian(&mut self.rng, sig_v);
        gps.ecef_position = earth::geodetic_to_ecef(gps.lat, gps.lon, gps.alt).into();
        gps.ecef_velocity = (earth::ned_to_ecef(lat, lon) * Vector3::new(gps.vn, gps.ve, gps.vd)).into();
        gps.sig_n = sig_p;
        gps.sig_e = sig_p;
        gps.sig_d = sig_p;
        gps.sig_vn = sig_v;
        gps.sig_ve = sig_v;
        gps.sig_vd = sig_v;
        gps.course_over_ground = wrap_to_pi(truth.ve.atan2(truth.vn));
        gps.speed_over_ground = truth.vn.hypot(truth.ve);
        gps.nav_valid = 0;
        gps.satellites = 9;
        gps.status = SensorStatus::DataValid;
    }
    fn fill_air(&mut self, air: &mut AirData, truth: &TruthState, airspeed: f64, noise: Option<&SensorNoise>) {
        let (sig_ias, sig_h) = noise.map_or((0.0, 0.0), |n| (n.airspeed, n.baro));
        let h = truth.alt + gaussian(&mut self.rng, sig_h);
        let ias = airspeed + gaussian(&mut self.rng, sig_ias);
        air.h = h;
        air.h_msl = h;
        air.h_filt = h;
        air.ias = ias;
        air.ias_filt = ias;
        air.status = 0;
    }
}

/// Zero-mean Gaussian sample, or zero for a non-positive sigma
fn gaussian(rng: &mut StdRng, sigma: f64) -> f64 {
    if sigma > 0.0 {
        Normal::new(0.0, sigma).map_or(0.0, |n| n.sample(rng))
    } else {
        0.0
    }
}

/// One row of simulation results
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NavigationRecord {
    pub cycle: u64,
    /// [s]
    pub time: f64,
    pub state: SchedulerState,
    pub lat_deg: f64,
    pub lon_deg: f64,
    /// [m]
    pub alt: f64,
    /// [m/s]
    pub vn: f64,
    pub ve: f64,
    pub vd: f64,
    /// [rad]
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
    pub nav_status: FilterStatus,
    pub ahrs_status: FilterStatus,
    pub dr_status: FilterStatus,
    pub ins_status: FilterStatus,
    pub insgps_att_weight: f64,
    pub insgps_pos_weight: f64,
    /// [m/s] estimated north and east wind
    pub wind_n: f64,
    pub wind_e: f64,
    pub gps_locked: bool,
    pub true_lat_deg: f64,
    pub true_lon_deg: f64,
    pub true_alt: f64,
    pub true_yaw: f64,
    /// [m] distance between the blended solution and the truth
    pub position_error: f64,
    /// [m] horizontal distance between each solution and the truth
    pub dr_horizontal_error: f64,
    pub ins_horizontal_error: f64,
    /// [rad]
    pub yaw_error: f64,
    /// [ms]
    pub cycle_time_ms: f64,
    pub overrun: bool,
}

impl NavigationRecord {
    pub fn new(report: &CycleReport, scheduler: &Scheduler, gps: &GpsFix, truth: &TruthState) -> Self {
        let nav = &report.nav;
        let ahrs_dr = scheduler.ahrs_dr();
        let ins = scheduler.ins();
        let horizontal = |lat: f64, lon: f64| {
            let offset = ned_offset(truth.position(), (lat, lon, truth.alt));
            offset[0].hypot(offset[1])
        };
        let ins_error = if ins.status.is_sentinel() {
            f64::NAN
        } else {
            horizontal(ins.lat, ins.lon)
        };
        NavigationRecord {
            cycle: report.cycle,
            time: report.time,
            state: report.state,
            lat_deg: nav.lat.to_degrees(),
            lon_deg: nav.lon.to_degrees(),
            alt: nav.alt,
            vn: nav.vn,
            ve: nav.ve,
            vd: nav.vd,
            roll: nav.phi,
            pitch: nav.the,
            yaw: nav.psi,
            nav_status: nav.status,
            ahrs_status: ahrs_dr.ahrs_status,
            dr_status: ahrs_dr.dr_status,
            ins_status: ins.status,
            insgps_att_weight: nav.insgps_att_weight,
            insgps_pos_weight: nav.insgps_pos_weight,
            wind_n: ahrs_dr.wind[0],
            wind_e: ahrs_dr.wind[1],
            gps_locked: gps.is_locked(),
            true_lat_deg: truth.lat.to_degrees(),
            true_lon_deg: truth.lon.to_degrees(),
            true_alt: truth.alt,
            true_yaw: truth.psi,
            position_error: ned_offset(truth.position(), (nav.lat, nav.lon, nav.alt)).norm(),
            dr_horizontal_error: horizontal(ahrs_dr.lat, ahrs_dr.lon),
            ins_horizontal_error: ins_error,
            yaw_error: wrap_to_pi(nav.psi - truth.psi),
            cycle_time_ms: report.times.total * 1e3,
            overrun: report.overrun,
        }
    }
    /// Write records to a CSV file with a header row
    pub fn to_csv<P: AsRef<Path>>(records: &[Self], path: P) -> Result<(), NavError> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            writer.serialize(record)?;
        }
        writer.flush()?;
        Ok(())
    }
    /// Read records previously written by [`NavigationRecord::to_csv`]
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Self>, NavError> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for result in reader.deserialize() {
            records.push(result?);
        }
        Ok(records)
    }
}

/// Error statistics of a run
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub cycles: usize,
    /// [m]
    pub final_position_error: f64,
    pub max_position_error: f64,
    pub rms_position_error: f64,
    /// [rad]
    pub max_yaw_error: f64,
    pub overruns: usize,
}

impl RunSummary {
    /// Statistics over every cycle in which the blended solution was available
    pub fn from_records(records: &[NavigationRecord]) -> Self {
        let valid: Vec<&NavigationRecord> = records
            .iter()
            .filter(|r| !r.nav_status.is_sentinel())
            .collect();
        let mut summary = RunSummary {
            cycles: records.len(),
            overruns: records.iter().filter(|r| r.overrun).count(),
            ..RunSummary::default()
        };
        if valid.is_empty() {
            return summary;
        }
        let mut sum_sq = 0.0;
        for r in &valid {
            summary.max_position_error = summary.max_position_error.max(r.position_error);
            summary.max_yaw_error = summary.max_yaw_error.max(r.yaw_error.abs());
            sum_sq += r.position_error.powi(2);
        }
        summary.rms_position_error = (sum_sq / valid.len() as f64).sqrt();
        summary.final_position_error = valid[valid.len() - 1].position_error;
        summary
    }
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cycles, position error final {:.3} m / rms {:.3} m / max {:.3} m, max yaw error {:.4} rad, {} overruns",
            self.cycles,
            self.final_position_error,
            self.rms_position_error,
            self.max_position_error,
            self.max_yaw_error,
            self.overruns
        )
    }
}

/// A scheduler driven by a [`SensorSimulator`]
///
/// Owns the sensor and control structures the way the top-level flight loop does and lends
/// them to the scheduler once per cycle.
#[derive(Debug)]
pub struct Simulation {
    scheduler: Scheduler,
    sensors: SensorSimulator,
    imu: ImuSample,
    gps: GpsFix,
    air: AirData,
    surface: SurfacePositions,
    control: ControlState,
}

impl Simulation {
    pub fn new(config: NavConfig, scenario: ScenarioConfig) -> Result<Self, NavError> {
        let sensors = SensorSimulator::new(
            scenario,
            config.scheduler.period,
            config.ahrs.magnetic_reference,
        );
        let scheduler = Scheduler::new(config)?;
        info!(
            "Simulation of scenario '{}' with {} noise",
            sensors.scenario().kind,
            if sensors.scenario().noise.is_some() { "sensor" } else { "no" }
        );
        Ok(Simulation {
            scheduler,
            sensors,
            imu: ImuSample::default(),
            gps: GpsFix::default(),
            air: AirData::default(),
            surface: SurfacePositions::default(),
            control: ControlState {
                mode: 1,
                ..ControlState::default()
            },
        })
    }
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }
    pub fn control(&self) -> &ControlState {
        &self.control
    }
    /// Pilot inputs and mode switch
    pub fn control_mut(&mut self) -> &mut ControlState {
        &mut self.control
    }
    pub fn gps(&self) -> &GpsFix {
        &self.gps
    }
    /// Generate this cycle's samples and run one scheduler cycle
    pub fn step(&mut self, autopilot: &mut dyn AutopilotStages) -> NavigationRecord {
        let truth = self.sensors.fill(&mut self.imu, &mut self.gps, &mut self.air);
        let mut sensors = SensorData {
            imu: &self.imu,
            gps: &mut self.gps,
            air: &self.air,
            surface: &self.surface,
        };
        let report = self.scheduler.run_cycle(&mut sensors, &mut self.control, autopilot);
        NavigationRecord::new(&report, &self.scheduler, &self.gps, &truth)
    }
    /// Run `cycles` cycles and collect one record per cycle
    pub fn run(&mut self, cycles: u64, autopilot: &mut dyn AutopilotStages) -> Vec<NavigationRecord> {
        let mut records = Vec::with_capacity(cycles as usize);
        for _ in 0..cycles {
            let record = self.step(autopilot);
            if record.cycle % 500 == 0 {
                debug!(
                    "t = {:.1} s: position error {:.3} m, INS weight {:.3}",
                    record.time, record.position_error, record.insgps_pos_weight
                );
            }
            records.push(record);
        }
        records
    }
}
