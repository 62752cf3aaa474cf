//! Airspeed dead reckoning with wind and barometric-offset estimation
//!
//! The filter propagates position from the AHRS attitude and the filtered indicated airspeed:
//!
//! $$
//! v^n_{air} = V_{ias} \begin{bmatrix} \cos\theta\cos\psi \\\\ \cos\theta\sin\psi \\\\ -\sin\theta \end{bmatrix},
//! \qquad v^n = v^n_{air} + w^n
//! $$
//!
//! and altitude from the filtered barometric altitude plus an estimated offset to the GPS datum.
//! Whenever a new locked fix arrives, the wind $w^n$ and the baro offset are updated with scalar
//! Kalman gains from their diagonal variances.
//!
//! Horizontal position corrections are never applied in one step. The gain-weighted residual is
//! accumulated in [`AhrsDrState::position_bias`] and drained into the solution at a bounded rate
//! per cycle. The applied baro offset [`AhrsDrState::hoffset`] likewise slews towards the
//! filter's estimate at a bounded rate, so the DR output moves continuously through lock
//! transitions. The down component of the position bias stays zero because the vertical channel
//! is corrected through the baro offset.
//!
//! Only fixes from an intact, locked packet are used. When the air data flags the airspeed or the
//! altitude channel as faulted, the filter keeps propagating on the last good value of that
//! channel, and a faulted altitude also suspends the baro offset update.
use log::{debug, info};
use nalgebra::Vector3;

use crate::config::DeadReckoningConfig;
use crate::earth::{displace, ned_offset};
use crate::messages::{AhrsDrState, GpsFix, SensorData};
use crate::status::FilterStatus;

/// Airspeed dead-reckoning filter
#[derive(Clone, Debug)]
pub struct DeadReckoning {
    config: DeadReckoningConfig,
    /// [s] step period
    dt: f64,
    /// [m] estimated baro offset, which the applied offset slews towards
    hoffset_estimate: f64,
    /// Fixes incorporated since initialization
    fixes_used: u64,
    /// [m/s] last airspeed from an unfaulted channel
    airspeed: f64,
    /// [m] last filtered baro altitude from an unfaulted channel
    baro_altitude: f64,
}

impl DeadReckoning {
    pub fn new(config: DeadReckoningConfig, dt: f64) -> Self {
        DeadReckoning {
            config,
            dt,
            hoffset_estimate: 0.0,
            fixes_used: 0,
            airspeed: 0.0,
            baro_altitude: 0.0,
        }
    }
    pub fn fixes_used(&self) -> u64 {
        self.fixes_used
    }
    /// Seed the position solution
    ///
    /// Uses the current fix when the receiver is locked, otherwise `last_fix`, otherwise the
    /// configured default position. Wind, baro offset and position bias start at zero.
    pub fn initialize(
        &mut self,
        sensors: &SensorData,
        state: &mut AhrsDrState,
        last_fix: Option<&GpsFix>,
    ) {
        let (lat, lon, source) = if sensors.gps.is_locked() {
            let (lat, lon, _) = sensors.gps.position_rad();
            (lat, lon, "current fix")
        } else if let Some(fix) = last_fix {
            let (lat, lon, _) = fix.position_rad();
            (lat, lon, "last known fix")
        } else {
            let [lat, lon, _] = self.config.default_position;
            (lat.to_radians(), lon.to_radians(), "default position")
        };
        let c = &self.config;
        state.lat = lat;
        state.lon = lon;
        state.hoffset = 0.0;
        self.hoffset_estimate = 0.0;
        self.airspeed = sensors.air.ias_filt;
        self.baro_altitude = sensors.air.h_filt;
        state.alt = self.baro_altitude;
        state.wind = [0.0; 3];
        state.position_bias = [0.0; 3];
        state.pp = [c.initial_position_sigma.powi(2); 3];
        state.pv = [c.initial_velocity_sigma.powi(2); 3];
        state.pwind = [c.initial_wind_sigma.powi(2); 3];
        state.phoffset = c.initial_hoffset_sigma.powi(2);
        state.gps_innov = [0.0; 6];
        state.gps_innov_covar = [0.0; 6];
        let air = air_velocity(self.airspeed, state.the, state.psi);
        state.vn = air[0];
        state.ve = air[1];
        state.vd = air[2];
        state.dr_status = FilterStatus::TimeUpdateOnly;
        self.fixes_used = 0;
        info!(
            "DR initialized from {}: lat {:.7}, lon {:.7} deg, alt {:.1} m",
            source,
            lat.to_degrees(),
            lon.to_degrees(),
            state.alt
        );
    }
    /// One propagation cycle, plus a GPS update when a new locked fix is present
    pub fn step(&mut self, sensors: &SensorData, state: &mut AhrsDrState) {
        let dt = self.dt;
        let air_data = sensors.air;
        if air_data.airspeed_valid() {
            self.airspeed = air_data.ias_filt;
        } else {
            debug!("DR holding airspeed {:.2} m/s, air data status {:#06x}", self.airspeed, air_data.status);
        }
        let baro_valid = air_data.altitude_valid();
        if baro_valid {
            self.baro_altitude = air_data.h_filt;
        }
        let c = &self.config;
        let air = air_velocity(self.airspeed, state.the, state.psi);
        let wind = Vector3::from(state.wind);

        // Drain the outstanding horizontal correction
        let mut drain = Vector3::zeros();
        for i in 0..2 {
            drain[i] = state.position_bias[i].clamp(-c.max_position_slew, c.max_position_slew);
            state.position_bias[i] -= drain[i];
        }
        let ground = air + wind;
        let mut motion = ground * dt + drain;
        motion[2] = 0.0;
        let (lat, lon, _) = displace((state.lat, state.lon, state.alt), &motion);
        state.lat = lat;
        state.lon = lon;
        state.vn = ground[0];
        state.ve = ground[1];
        state.vd = ground[2];

        // Covariance growth. Velocity error is dominated by the slowly varying wind error, so
        // position sigma grows linearly with velocity sigma.
        for i in 0..3 {
            state.pwind[i] += c.wind_process_noise * dt;
            state.pv[i] = c.airspeed_sigma.powi(2) + state.pwind[i];
            state.pp[i] = (state.pp[i].sqrt() + state.pv[i].sqrt() * dt).powi(2);
        }
        state.phoffset += c.hoffset_process_noise * dt;

        let gps = &*sensors.gps;
        if gps.has_new_fix() {
            self.gps_update(gps, baro_valid, &air, state);
            state.dr_status = FilterStatus::GpsAided;
        } else {
            state.dr_status = FilterStatus::TimeUpdateOnly;
        }
        let pending = self.hoffset_estimate - state.hoffset;
        let slew = self.config.max_hoffset_slew;
        state.hoffset += pending.clamp(-slew, slew);
        state.alt = self.baro_altitude + state.hoffset;
    }
    fn gps_update(&mut self, gps: &GpsFix, baro_valid: bool, air: &Vector3<f64>, state: &mut AhrsDrState) {
        let c = &self.config;
        let pick = |reported: f64, fallback: f64| -> f64 {
            if reported.is_finite() && reported > 0.0 {
                reported.powi(2)
            } else {
                fallback.powi(2)
            }
        };

        // Wind from ground velocity minus air velocity
        let r_vel = [
            pick(gps.sig_vn, c.gps_velocity_sigma),
            pick(gps.sig_ve, c.gps_velocity_sigma),
            pick(gps.sig_vd, c.gps_velocity_sigma),
        ];
        let v_gps = gps.velocity_ned();
        for i in 0..3 {
            let innov = v_gps[i] - air[i] - state.wind[i];
            let s = state.pwind[i] + r_vel[i];
            let k = state.pwind[i] / s;
            state.wind[i] += k * innov;
            state.pwind[i] *= 1.0 - k;
            state.gps_innov[3 + i] = innov;
            state.gps_innov_covar[3 + i] = s;
        }

        // Baro offset
        if baro_valid {
            let r_alt = pick(gps.sig_d, c.gps_altitude_sigma);
            let innov = gps.alt - self.baro_altitude - self.hoffset_estimate;
            let s = state.phoffset + r_alt;
            let k = state.phoffset / s;
            self.hoffset_estimate += k * innov;
            state.phoffset *= 1.0 - k;
            state.gps_innov[2] = -innov;
            state.gps_innov_covar[2] = s;
        }

        // Horizontal position, relative to where the solution ends up once the bias drains
        let (lat, lon, _) = gps.position_rad();
        let residual = ned_offset((state.lat, state.lon, state.alt), (lat, lon, state.alt));
        let r_pos = [
            pick(gps.sig_n, c.gps_position_sigma),
            pick(gps.sig_e, c.gps_position_sigma),
        ];
        for i in 0..2 {
            let innov = residual[i] - state.position_bias[i];
            let s = state.pp[i] + r_pos[i];
            let k = state.pp[i] / s;
            state.position_bias[i] += k * innov;
            state.pp[i] *= 1.0 - k;
            state.gps_innov[i] = innov;
            state.gps_innov_covar[i] = s;
        }
        state.pp[2] = state.phoffset;
        self.fixes_used += 1;
        debug!(
            "DR GPS update: pos innov [{:.2}, {:.2}], wind [{:.2}, {:.2}, {:.2}], hoffset {:.2}",
            state.gps_innov[0],
            state.gps_innov[1],
            state.wind[0],
            state.wind[1],
            state.wind[2],
            state.hoffset
        );
    }
    pub fn close(&mut self) {
        info!("DR closed after {} GPS updates", self.fixes_used);
    }
}

/// Air-relative NED velocity from airspeed, pitch and heading
pub fn air_velocity(airspeed: f64, pitch: f64, yaw: f64) -> Vector3<f64> {
    let (st, ct) = pitch.sin_cos();
    let (sy, cy) = yaw.sin_cos();
    Vector3::new(airspeed * ct * cy, airspeed * ct * sy, -airspeed * st)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{AirData, ImuSample, SurfacePositions};
    use crate::status::SensorStatus;
    use assert_approx_eq::assert_approx_eq;
    use std::f64::consts::FRAC_PI_2;

    const DT: f64 = 0.02;

    struct Rig {
        imu: ImuSample,
        gps: GpsFix,
        air: AirData,
        surface: SurfacePositions,
    }

    impl Rig {
        fn new() -> Self {
            Rig {
                imu: ImuSample::default(),
                gps: GpsFix::default(),
                air: AirData {
                    h_filt: 300.0,
                    ..AirData::default()
                },
                surface: SurfacePositions::default(),
            }
        }
        fn locked_at(&mut self, lat: f64, lon: f64, alt: f64) {
            self.gps.lat = lat;
            self.gps.lon = lon;
            self.gps.alt = alt;
            self.gps.nav_valid = 0;
            self.gps.new_data = true;
            self.gps.status = SensorStatus::DataValid;
        }
        fn init(&mut self, dr: &mut DeadReckoning, state: &mut AhrsDrState, last: Option<&GpsFix>) {
            let sensors = SensorData {
                imu: &self.imu,
                gps: &mut self.gps,
                air: &self.air,
                surface: &self.surface,
            };
            dr.initialize(&sensors, state, last);
        }
        fn step(&mut self, dr: &mut DeadReckoning, state: &mut AhrsDrState) {
            let sensors = SensorData {
                imu: &self.imu,
                gps: &mut self.gps,
                air: &self.air,
                surface: &self.surface,
            };
            dr.step(&sensors, state);
        }
    }

    #[test]
    fn air_velocity_components() {
        let v = air_velocity(20.0, 0.0, FRAC_PI_2);
        assert_approx_eq!(v[0], 0.0, 1e-12);
        assert_approx_eq!(v[1], 20.0, 1e-12);
        let v = air_velocity(20.0, 0.1, 0.0);
        assert_approx_eq!(v[2], -20.0 * 0.1f64.sin(), 1e-12);
    }

    #[test]
    fn initialization_sources() {
        let mut dr = DeadReckoning::new(DeadReckoningConfig::default(), DT);
        let mut rig = Rig::new();
        let mut state = AhrsDrState::default();

        rig.init(&mut dr, &mut state, None);
        assert_approx_eq!(state.lat.to_degrees(), 44.7258, 1e-9);
        assert_eq!(state.dr_status, FilterStatus::TimeUpdateOnly);
        assert_eq!(state.alt, 300.0);

        let last = GpsFix {
            lat: 45.0,
            lon: -93.0,
            ..GpsFix::default()
        };
        rig.init(&mut dr, &mut state, Some(&last));
        assert_approx_eq!(state.lat.to_degrees(), 45.0, 1e-9);

        rig.locked_at(46.0, -92.0, 310.0);
        rig.init(&mut dr, &mut state, Some(&last));
        assert_approx_eq!(state.lat.to_degrees(), 46.0, 1e-9);
        assert_approx_eq!(state.lon.to_degrees(), -92.0, 1e-9);
        assert_eq!(state.hoffset, 0.0);
        assert_eq!(state.wind, [0.0; 3]);
    }

    #[test]
    fn free_integration_moves_with_air_velocity() {
        let mut dr = DeadReckoning::new(DeadReckoningConfig::default(), DT);
        let mut rig = Rig::new();
        let mut state = AhrsDrState::default();
        rig.air.ias_filt = 20.0;
        rig.init(&mut dr, &mut state, None);
        let start = (state.lat, state.lon, state.alt);
        let pp0 = state.pp[0];
        for _ in 0..50 {
            rig.step(&mut dr, &mut state);
            assert_eq!(state.dr_status, FilterStatus::TimeUpdateOnly);
        }
        let moved = ned_offset(start, (state.lat, state.lon, state.alt));
        assert_approx_eq!(moved[0], 20.0, 1e-6);
        assert_approx_eq!(moved[1], 0.0, 1e-9);
        assert_approx_eq!(state.vn, 20.0, 1e-12);
        assert!(state.pp[0] > pp0);
    }

    #[test]
    fn gps_update_estimates_wind_and_offset() {
        let mut dr = DeadReckoning::new(DeadReckoningConfig::default(), DT);
        let mut rig = Rig::new();
        let mut state = AhrsDrState::default();
        rig.air.ias_filt = 20.0;
        rig.locked_at(45.0, -93.0, 305.0);
        rig.init(&mut dr, &mut state, None);

        // Aircraft flies north at 20 m/s air speed into a 5 m/s headwind; the receiver keeps
        // reporting the initial position, but only the velocity matters here.
        rig.gps.vn = 15.0;
        for _ in 0..500 {
            rig.gps.new_data = true;
            rig.step(&mut dr, &mut state);
            assert_eq!(state.dr_status, FilterStatus::GpsAided);
        }
        assert_approx_eq!(state.wind[0], -5.0, 1e-3);
        assert_approx_eq!(state.wind[1], 0.0, 1e-9);
        assert_approx_eq!(state.hoffset, 5.0, 1e-2);
        assert_approx_eq!(state.alt, 305.0, 1e-2);
        assert!(state.pwind[0] < DeadReckoningConfig::default().initial_wind_sigma.powi(2));
        assert!(state.gps_innov_covar.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn corrections_are_slew_limited() {
        let config = DeadReckoningConfig::default();
        let max_slew = config.max_position_slew;
        let max_hoffset = config.max_hoffset_slew;
        let mut dr = DeadReckoning::new(config, DT);
        let mut rig = Rig::new();
        let mut state = AhrsDrState::default();
        rig.locked_at(45.0, -93.0, 300.0);
        rig.init(&mut dr, &mut state, None);
        rig.gps.new_data = false;
        rig.step(&mut dr, &mut state);

        // Fix jumps 100 m north and 50 m up
        rig.gps.lat += 100.0 / 111_000.0;
        rig.gps.alt += 50.0;
        let start = (state.lat, state.lon, state.alt);
        let mut prev = start;
        for cycle in 0..200 {
            rig.gps.new_data = cycle % 10 == 0;
            rig.step(&mut dr, &mut state);
            let now = (state.lat, state.lon, state.alt);
            let jump = ned_offset(prev, now);
            assert!(jump[0].abs() <= max_slew + 1e-9);
            assert!(jump[2].abs() <= max_hoffset + 1e-9);
            prev = now;
        }
        let moved = ned_offset(start, prev);
        assert!(moved[0] > 10.0 && moved[0] <= 200.0 * max_slew + 1e-3);
        assert!(moved[2] < -1.0);
        assert_eq!(state.position_bias[2], 0.0);
    }

    #[test]
    fn corrupted_fix_is_ignored() {
        let mut dr = DeadReckoning::new(DeadReckoningConfig::default(), DT);
        let mut rig = Rig::new();
        let mut state = AhrsDrState::default();
        rig.air.ias_filt = 20.0;
        rig.locked_at(45.0, -93.0, 300.0);
        rig.init(&mut dr, &mut state, None);
        for status in [
            SensorStatus::ChecksumError,
            SensorStatus::IncompletePacket,
            SensorStatus::NoPacketHeader,
        ] {
            rig.locked_at(45.001, -93.0, 400.0);
            rig.gps.vn = 3.0;
            rig.gps.status = status;
            rig.step(&mut dr, &mut state);
            assert_eq!(state.dr_status, FilterStatus::TimeUpdateOnly);
            assert_eq!(state.wind, [0.0; 3]);
            assert_eq!(state.position_bias, [0.0; 3]);
            assert_eq!(state.hoffset, 0.0);
        }
        assert_eq!(dr.fixes_used(), 0);
    }

    #[test]
    fn faulted_air_data_channels_hold_last_good_value() {
        let mut dr = DeadReckoning::new(DeadReckoningConfig::default(), DT);
        let mut rig = Rig::new();
        let mut state = AhrsDrState::default();
        rig.air.ias_filt = 20.0;
        rig.init(&mut dr, &mut state, None);
        rig.step(&mut dr, &mut state);

        rig.air.status = AirData::AIRSPEED_FAULT | AirData::ALTITUDE_FAULT;
        rig.air.ias_filt = 0.0;
        rig.air.h_filt = -50.0;
        let start = (state.lat, state.lon, state.alt);
        for _ in 0..50 {
            rig.step(&mut dr, &mut state);
        }
        let moved = ned_offset(start, (state.lat, state.lon, state.alt));
        assert_approx_eq!(moved[0], 20.0, 1e-6);
        assert_approx_eq!(state.vn, 20.0, 1e-12);
        assert_eq!(state.alt, 300.0);

        // A fix during the altitude fault still updates wind but not the baro offset
        rig.locked_at(45.0, -93.0, 350.0);
        rig.gps.vn = 15.0;
        let phoffset = state.phoffset;
        rig.step(&mut dr, &mut state);
        assert_eq!(state.dr_status, FilterStatus::GpsAided);
        assert!(state.wind[0] < 0.0);
        assert_eq!(state.hoffset, 0.0);
        assert!(state.phoffset > phoffset);

        rig.air.status = 0;
        rig.air.ias_filt = 20.0;
        rig.air.h_filt = 305.0;
        rig.gps.new_data = false;
        rig.step(&mut dr, &mut state);
        assert_eq!(state.alt, 305.0);
    }

    #[test]
    fn unlocked_fix_is_ignored() {
        let mut dr = DeadReckoning::new(DeadReckoningConfig::default(), DT);
        let mut rig = Rig::new();
        let mut state = AhrsDrState::default();
        rig.init(&mut dr, &mut state, None);
        rig.gps.new_data = true;
        rig.gps.vn = 30.0;
        rig.step(&mut dr, &mut state);
        assert_eq!(state.dr_status, FilterStatus::TimeUpdateOnly);
        assert_eq!(state.wind, [0.0; 3]);
        assert_eq!(dr.fixes_used(), 0);
    }
}
