//! Fixed-rate execution loop
//!
//! The [`Scheduler`] owns every navigation filter and its state for the lifetime of the program.
//! The top-level loop owns the sensor and control structures and lends them to
//! [`Scheduler::run_cycle`] once per base period (0.02 s by default). A cycle runs, in order:
//!
//! 1. the AHRS (initialized while its status is the sentinel, stepped otherwise);
//! 2. once the AHRS runs, the DR filter and the GPS-aided INS, the latter only initialized
//!    while the receiver is locked;
//! 3. the blend, after the GPS `new_data` flag has been cleared;
//! 4. in autopilot mode, the guidance, sensor-fault, control, system-id and surface-fault
//!    stages of an [`AutopilotStages`] implementation; otherwise a control reset;
//! 5. trim and saturation of the actuator commands;
//! 6. publication of a [`CycleSnapshot`] to the datalog and telemetry readers.
//!
//! Execution time of every stage is measured with a monotonic clock and accumulated in
//! [`StageTimings`].
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::time::Instant;

use crossbeam::channel::Receiver;

use crate::ahrs::Ahrs;
use crate::blend::Blender;
use crate::config::NavConfig;
use crate::dead_reckoning::DeadReckoning;
use crate::error::NavError;
use crate::kalman::GpsIns;
use crate::messages::{
    AhrsDrState, ControlMode, ControlState, GpsFix, InsState, NavEstimate, SensorData,
};
use crate::snapshot::{CycleSnapshot, DeliveryStats, SnapshotPublisher};
use crate::status::FilterStatus;

/// Guidance, control, fault detection and system identification, run in autopilot mode
///
/// Every stage receives the time since the autopilot was engaged. The default implementations do
/// nothing, so an implementation only overrides the stages it provides.
pub trait AutopilotStages {
    fn guidance(
        &mut self,
        _time: f64,
        _sensors: &SensorData,
        _nav: &NavEstimate,
        _control: &mut ControlState,
    ) {
    }
    fn sensor_fault(
        &mut self,
        _time: f64,
        _sensors: &SensorData,
        _nav: &NavEstimate,
        _control: &mut ControlState,
    ) {
    }
    fn control(
        &mut self,
        _time: f64,
        _sensors: &SensorData,
        _nav: &NavEstimate,
        _control: &mut ControlState,
    ) {
    }
    fn system_id(
        &mut self,
        _time: f64,
        _sensors: &SensorData,
        _nav: &NavEstimate,
        _control: &mut ControlState,
    ) {
    }
    fn surface_fault(
        &mut self,
        _time: f64,
        _sensors: &SensorData,
        _nav: &NavEstimate,
        _control: &mut ControlState,
    ) {
    }
    /// Clear internal controller states when the autopilot is not engaged
    fn reset(&mut self) {}
}

/// Autopilot that leaves every command untouched
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAutopilot;

impl AutopilotStages for NullAutopilot {}

/// Lifecycle of the execution loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerState {
    /// Waiting for a usable IMU sample to initialize the AHRS
    #[default]
    Idle,
    Navigating,
    Autopilot,
    /// Mode 0 was commanded; filters are closed until [`Scheduler::restart`]
    Shutdown,
}

impl Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulerState::Idle => "idle",
            SchedulerState::Navigating => "navigating",
            SchedulerState::Autopilot => "autopilot",
            SchedulerState::Shutdown => "shutdown",
        };
        write!(f, "{}", name)
    }
}

/// [s] execution time of each stage in one cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleTimes {
    pub navigation: f64,
    pub guidance: f64,
    pub sensor_fault: f64,
    pub control: f64,
    pub system_id: f64,
    pub surface_fault: f64,
    /// Whole cycle, publication included
    pub total: f64,
}

/// Running statistics of one stage
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStats {
    pub last: f64,
    pub max: f64,
    pub total: f64,
}

impl StageStats {
    fn record(&mut self, seconds: f64) {
        self.last = seconds;
        self.max = self.max.max(seconds);
        self.total += seconds;
    }
    /// [s] mean over `cycles`
    pub fn mean(&self, cycles: u64) -> f64 {
        if cycles == 0 {
            0.0
        } else {
            self.total / cycles as f64
        }
    }
}

/// Cumulative timing statistics for a supervisor
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageTimings {
    pub navigation: StageStats,
    pub guidance: StageStats,
    pub sensor_fault: StageStats,
    pub control: StageStats,
    pub system_id: StageStats,
    pub surface_fault: StageStats,
    pub cycle: StageStats,
    pub cycles: u64,
    /// Cycles whose execution took longer than the base period
    pub overruns: u64,
}

impl StageTimings {
    fn record(&mut self, times: &CycleTimes, period: f64) -> bool {
        self.navigation.record(times.navigation);
        self.guidance.record(times.guidance);
        self.sensor_fault.record(times.sensor_fault);
        self.control.record(times.control);
        self.system_id.record(times.system_id);
        self.surface_fault.record(times.surface_fault);
        self.cycle.record(times.total);
        self.cycles += 1;
        let overrun = times.total > period;
        if overrun {
            self.overruns += 1;
        }
        overrun
    }
}

impl Display for StageTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |s: &StageStats| (s.mean(self.cycles) * 1e3, s.max * 1e3);
        let (nav_mean, nav_max) = ms(&self.navigation);
        let (cycle_mean, cycle_max) = ms(&self.cycle);
        write!(
            f,
            "{} cycles, navigation {:.3}/{:.3} ms, cycle {:.3}/{:.3} ms (mean/max), {} overruns",
            self.cycles, nav_mean, nav_max, cycle_mean, cycle_max, self.overruns
        )
    }
}

/// Summary of one cycle returned to the caller
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub time: f64,
    pub state: SchedulerState,
    pub nav: NavEstimate,
    pub times: CycleTimes,
    pub overrun: bool,
}

/// Owner of all navigation state and sequencer of one cycle
#[derive(Debug)]
pub struct Scheduler {
    config: NavConfig,
    ahrs: Ahrs,
    dr: DeadReckoning,
    ins: GpsIns,
    blender: Blender,
    ahrs_dr: AhrsDrState,
    ins_state: InsState,
    nav: NavEstimate,
    state: SchedulerState,
    cycle: u64,
    /// [s] cycle time at which the autopilot was engaged
    engaged_at: Option<f64>,
    last_fix: Option<GpsFix>,
    timings: StageTimings,
    publisher: SnapshotPublisher,
}

impl Scheduler {
    /// Validate the configuration and allocate every filter
    pub fn new(config: NavConfig) -> Result<Self, NavError> {
        config.validate()?;
        let dt = config.scheduler.period;
        Ok(Scheduler {
            ahrs: Ahrs::new(config.ahrs.clone(), dt),
            dr: DeadReckoning::new(config.dead_reckoning.clone(), dt),
            ins: GpsIns::new(config.ins.clone(), dt),
            blender: Blender::new(config.blend.clone(), dt),
            config,
            ahrs_dr: AhrsDrState::default(),
            ins_state: InsState::default(),
            nav: NavEstimate::default(),
            state: SchedulerState::Idle,
            cycle: 0,
            engaged_at: None,
            last_fix: None,
            timings: StageTimings::default(),
            publisher: SnapshotPublisher::new(),
        })
    }
    pub fn config(&self) -> &NavConfig {
        &self.config
    }
    pub fn state(&self) -> SchedulerState {
        self.state
    }
    pub fn nav(&self) -> &NavEstimate {
        &self.nav
    }
    pub fn ahrs_dr(&self) -> &AhrsDrState {
        &self.ahrs_dr
    }
    pub fn ins(&self) -> &InsState {
        &self.ins_state
    }
    pub fn ins_filter(&self) -> &GpsIns {
        &self.ins
    }
    pub fn timings(&self) -> &StageTimings {
        &self.timings
    }
    /// Number of cycles run so far
    pub fn cycle(&self) -> u64 {
        self.cycle
    }
    pub fn last_fix(&self) -> Option<&GpsFix> {
        self.last_fix.as_ref()
    }
    /// Receive every snapshot
    pub fn subscribe_datalog(&mut self) -> Receiver<CycleSnapshot> {
        let capacity = self.config.scheduler.snapshot_capacity;
        self.publisher.subscribe("datalog", capacity, 1)
    }
    /// Receive one snapshot every `base_hz / telemetry_hz` cycles
    pub fn subscribe_telemetry(&mut self) -> Receiver<CycleSnapshot> {
        let capacity = self.config.scheduler.snapshot_capacity;
        let divider = self.config.scheduler.telemetry_divider();
        self.publisher.subscribe("telemetry", capacity, divider)
    }
    pub fn delivery_stats(&self) -> Vec<DeliveryStats> {
        self.publisher.stats()
    }
    /// Close every snapshot channel so the readers can finish
    pub fn disconnect_readers(&mut self) {
        self.publisher.disconnect_all();
    }
    /// Put every filter back to the uninitialized sentinel
    ///
    /// The next cycles initialize the AHRS, DR, INS and blend again from the sensors.
    pub fn request_reinitialization(&mut self) {
        self.ahrs_dr.ahrs_status = FilterStatus::NoData;
        self.ahrs_dr.dr_status = FilterStatus::NoData;
        self.ins_state.status = FilterStatus::NoData;
        self.nav.status = FilterStatus::NoData;
        info!("Navigation re-initialization requested");
    }
    /// Leave [`SchedulerState::Shutdown`]: re-initialize the filters and return to manual mode
    /// with the run counter cleared. Returns false when the loop was not shut down.
    pub fn restart(&mut self, control: &mut ControlState) -> bool {
        if self.state != SchedulerState::Shutdown {
            return false;
        }
        self.request_reinitialization();
        self.engaged_at = None;
        self.state = SchedulerState::Idle;
        control.mode = ControlMode::Manual.as_raw();
        control.run_num = 0;
        info!("Scheduler restarted");
        true
    }
    /// Run one base period
    pub fn run_cycle(
        &mut self,
        sensors: &mut SensorData,
        control: &mut ControlState,
        autopilot: &mut dyn AutopilotStages,
    ) -> CycleReport {
        let start = Instant::now();
        let time = self.cycle as f64 * self.config.scheduler.period;
        let mut times = CycleTimes::default();

        if control.control_mode() == ControlMode::Shutdown || self.state == SchedulerState::Shutdown
        {
            if self.state != SchedulerState::Shutdown {
                self.shutdown();
            }
            times.total = start.elapsed().as_secs_f64();
            return self.finish(time, times, sensors, control);
        }

        self.navigate(sensors, time);
        let mut accounted = start.elapsed().as_secs_f64();
        times.navigation = accounted;
        let mut lap = |start: &Instant| {
            let elapsed = start.elapsed().as_secs_f64();
            let stage = elapsed - accounted;
            accounted = elapsed;
            stage
        };

        if control.control_mode() == ControlMode::Autopilot {
            let engaged_at = match self.engaged_at {
                Some(t0) => t0,
                None => {
                    control.run_num = control.run_num.wrapping_add(1);
                    info!("Autopilot engaged at {:.2} s, run {}", time, control.run_num);
                    self.engaged_at = Some(time);
                    time
                }
            };
            let ap_time = time - engaged_at;
            let sensors: &SensorData = sensors;
            let nav = &self.nav;
            autopilot.guidance(ap_time, sensors, nav, control);
            times.guidance = lap(&start);
            autopilot.sensor_fault(ap_time, sensors, nav, control);
            times.sensor_fault = lap(&start);
            autopilot.control(ap_time, sensors, nav, control);
            times.control = lap(&start);
            autopilot.system_id(ap_time, sensors, nav, control);
            times.system_id = lap(&start);
            autopilot.surface_fault(ap_time, sensors, nav, control);
            times.surface_fault = lap(&start);
            self.state = SchedulerState::Autopilot;
        } else {
            if let Some(t0) = self.engaged_at.take() {
                info!("Autopilot disengaged after {:.2} s", time - t0);
            }
            control.reset();
            autopilot.reset();
            self.state = if self.ahrs_dr.ahrs_status.is_sentinel() {
                SchedulerState::Idle
            } else {
                SchedulerState::Navigating
            };
        }
        control.add_trim_bias(&self.config.trim, &self.config.limits);

        times.total = start.elapsed().as_secs_f64();
        self.finish(time, times, sensors, control)
    }
    fn navigate(&mut self, sensors: &mut SensorData, time: f64) {
        {
            let view: &SensorData = sensors;
            if self.ahrs_dr.ahrs_status.is_sentinel() {
                self.ahrs.initialize(view, &mut self.ahrs_dr);
            } else {
                self.ahrs.step(view, &mut self.ahrs_dr);
            }

            if !self.ahrs_dr.ahrs_status.is_sentinel() {
                if self.ahrs_dr.dr_status.is_sentinel() {
                    self.dr.initialize(view, &mut self.ahrs_dr, self.last_fix.as_ref());
                } else {
                    self.dr.step(view, &mut self.ahrs_dr);
                }
                if self.ins_state.status.is_sentinel() {
                    if view.gps.is_locked() {
                        self.ins.initialize(view, &self.ahrs_dr, &mut self.ins_state);
                    }
                } else {
                    self.ins.step(view, &mut self.ins_state);
                }
            }
        }

        if sensors.gps.is_locked() {
            self.last_fix = Some(*sensors.gps);
        }
        sensors.gps.new_data = false;

        if self.nav.status.is_sentinel() {
            self.blender.initialize(&self.ahrs_dr, &self.ins_state, &mut self.nav);
        } else {
            self.blender.step(&self.ahrs_dr, &self.ins_state, &mut self.nav);
        }
        self.nav.time = time;
    }
    fn shutdown(&mut self) {
        self.ahrs.close();
        self.dr.close();
        self.ins.close();
        self.engaged_at = None;
        self.state = SchedulerState::Shutdown;
        info!("Shutdown commanded at cycle {}: {}", self.cycle, self.timings);
    }
    fn finish(
        &mut self,
        time: f64,
        times: CycleTimes,
        sensors: &SensorData,
        control: &ControlState,
    ) -> CycleReport {
        let overrun = self.timings.record(&times, self.config.scheduler.period);
        if overrun {
            debug!(
                "Cycle {} overran: {:.3} ms > {:.3} ms",
                self.cycle,
                times.total * 1e3,
                self.config.scheduler.period * 1e3
            );
        }
        let snapshot = CycleSnapshot {
            cycle: self.cycle,
            time,
            state: self.state,
            nav: self.nav,
            ahrs_dr: self.ahrs_dr,
            ins: self.ins_state,
            control: *control,
            imu: *sensors.imu,
            gps: *sensors.gps,
            air: *sensors.air,
            surface: *sensors.surface,
            times,
        };
        self.publisher.publish(&snapshot);
        let report = CycleReport {
            cycle: self.cycle,
            time,
            state: self.state,
            nav: self.nav,
            times,
            overrun,
        };
        self.cycle += 1;
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AirData, ImuSample, SurfacePositions};
    use crate::status::SensorStatus;

    struct Counting {
        calls: Vec<&'static str>,
        resets: usize,
    }

    impl AutopilotStages for Counting {
        fn guidance(&mut self, _: f64, _: &SensorData, _: &NavEstimate, c: &mut ControlState) {
            self.calls.push("guidance");
            c.phi_cmd = 0.2;
        }
        fn control(&mut self, _: f64, _: &SensorData, _: &NavEstimate, c: &mut ControlState) {
            self.calls.push("control");
            c.de = 0.05;
        }
        fn surface_fault(&mut self, _: f64, _: &SensorData, _: &NavEstimate, _: &mut ControlState) {
            self.calls.push("surface_fault");
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    struct Bench {
        imu: ImuSample,
        gps: GpsFix,
        air: AirData,
        surface: SurfacePositions,
        control: ControlState,
    }

    impl Bench {
        fn new() -> Self {
            Bench {
                imu: ImuSample {
                    az: -9.80,
                    hx: 0.2,
                    hz: 0.5,
                    status: SensorStatus::DataValid,
                    ..ImuSample::default()
                },
                gps: GpsFix::default(),
                air: AirData::default(),
                surface: SurfacePositions::default(),
                control: ControlState {
                    mode: 1,
                    ..ControlState::default()
                },
            }
        }
        fn cycle(&mut self, scheduler: &mut Scheduler, ap: &mut dyn AutopilotStages) -> CycleReport {
            let mut sensors = SensorData {
                imu: &self.imu,
                gps: &mut self.gps,
                air: &self.air,
                surface: &self.surface,
            };
            scheduler.run_cycle(&mut sensors, &mut self.control, ap)
        }
    }

    #[test]
    fn rejects_invalid_configuration() {
        let mut config = NavConfig::default();
        config.scheduler.period = -1.0;
        assert!(Scheduler::new(config).is_err());
    }

    #[test]
    fn waits_for_imu_then_navigates() {
        let mut scheduler = Scheduler::new(NavConfig::default()).unwrap();
        let mut bench = Bench::new();
        bench.imu.status = SensorStatus::NoData;
        let report = bench.cycle(&mut scheduler, &mut NullAutopilot);
        assert_eq!(report.state, SchedulerState::Idle);
        assert!(scheduler.ahrs_dr().ahrs_status.is_sentinel());
        assert!(scheduler.nav().status.is_sentinel());

        bench.imu.status = SensorStatus::DataValid;
        let report = bench.cycle(&mut scheduler, &mut NullAutopilot);
        assert_eq!(report.state, SchedulerState::Navigating);
        assert_eq!(scheduler.ahrs_dr().dr_status, FilterStatus::TimeUpdateOnly);
        // no lock yet
        assert!(scheduler.ins().status.is_sentinel());
        assert!(!scheduler.nav().status.is_sentinel());
        assert_eq!(report.time, 0.02);
    }

    #[test]
    fn clears_new_data_and_initializes_ins_on_lock() {
        let mut scheduler = Scheduler::new(NavConfig::default()).unwrap();
        let mut bench = Bench::new();
        bench.cycle(&mut scheduler, &mut NullAutopilot);
        bench.gps = GpsFix {
            lat: 44.9,
            lon: -93.2,
            alt: 280.0,
            nav_valid: 0,
            new_data: true,
            status: SensorStatus::DataValid,
            ..GpsFix::default()
        };
        bench.cycle(&mut scheduler, &mut NullAutopilot);
        assert!(!bench.gps.new_data);
        assert_eq!(scheduler.ins().status, FilterStatus::TimeUpdateOnly);
        assert!(scheduler.last_fix().is_some());
    }

    #[test]
    fn autopilot_engagement_sequence() {
        let mut scheduler = Scheduler::new(NavConfig::default()).unwrap();
        let mut bench = Bench::new();
        let mut ap = Counting {
            calls: Vec::new(),
            resets: 0,
        };
        bench.cycle(&mut scheduler, &mut ap);
        assert_eq!(ap.resets, 1);

        bench.control.mode = 2;
        let report = bench.cycle(&mut scheduler, &mut ap);
        assert_eq!(report.state, SchedulerState::Autopilot);
        assert_eq!(ap.calls, vec!["guidance", "control", "surface_fault"]);
        assert_eq!(bench.control.run_num, 1);
        assert_eq!(bench.control.phi_cmd, 0.2);
        let trim = scheduler.config().trim.clone();
        assert!((bench.control.de - (0.05 + trim.elevator)).abs() < 1e-12);

        bench.cycle(&mut scheduler, &mut ap);
        assert_eq!(bench.control.run_num, 1);

        bench.control.mode = 1;
        bench.cycle(&mut scheduler, &mut ap);
        assert_eq!(bench.control.phi_cmd, 0.0);
        assert_eq!(bench.control.de, trim.elevator);
        bench.control.mode = 2;
        bench.cycle(&mut scheduler, &mut ap);
        assert_eq!(bench.control.run_num, 2);
        assert!(scheduler.timings().guidance.max >= 0.0);
        assert_eq!(scheduler.timings().cycles, 5);
    }

    #[test]
    fn shutdown_and_restart() {
        let mut scheduler = Scheduler::new(NavConfig::default()).unwrap();
        let mut bench = Bench::new();
        let datalog = scheduler.subscribe_datalog();
        bench.cycle(&mut scheduler, &mut NullAutopilot);
        assert!(!scheduler.restart(&mut bench.control));

        bench.control.mode = 0;
        let report = bench.cycle(&mut scheduler, &mut NullAutopilot);
        assert_eq!(report.state, SchedulerState::Shutdown);
        let status = scheduler.ahrs_dr().ahrs_status;
        bench.control.mode = 1;
        bench.cycle(&mut scheduler, &mut NullAutopilot);
        assert_eq!(scheduler.state(), SchedulerState::Shutdown);
        assert_eq!(scheduler.ahrs_dr().ahrs_status, status);

        assert!(scheduler.restart(&mut bench.control));
        assert!(scheduler.ahrs_dr().ahrs_status.is_sentinel());
        assert_eq!(bench.control.run_num, 0);
        bench.cycle(&mut scheduler, &mut NullAutopilot);
        assert_eq!(scheduler.state(), SchedulerState::Navigating);
        assert_eq!(datalog.try_iter().count(), 4);
    }

    #[test]
    fn telemetry_is_decimated() {
        let mut scheduler = Scheduler::new(NavConfig::default()).unwrap();
        let mut bench = Bench::new();
        let telemetry = scheduler.subscribe_telemetry();
        for _ in 0..25 {
            bench.cycle(&mut scheduler, &mut NullAutopilot);
        }
        assert_eq!(telemetry.try_iter().count(), 5);
    }
}
