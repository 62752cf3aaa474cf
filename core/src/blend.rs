//! Confidence-weighted fusion of the AHRS/DR and INS navigation solutions
//!
//! The blender keeps one INS weight for the attitude channel and one for the position and
//! velocity channel; the AHRS/DR weight is always one minus the INS weight. Each cycle the INS
//! weight moves towards a target
//!
//! $$
//! w^* = \min\left(c(\text{status}),\ \frac{\sigma^2_{dr}}{\sigma^2_{dr} + \sigma^2_{ins}}\right)
//! $$
//!
//! where the ceiling $c$ depends on the INS status: high while GPS aided, lower right after a
//! covariance inflation, and zero while it is not initialized or its last step failed. Between
//! fixes the INS only propagates; as long as the last accepted fix is younger than the configured
//! grace span the ceiling of that fix still holds. Past the grace span the INS is coasting: the
//! ceiling decays exponentially and the weight can only decrease. Increases are rate limited so
//! that the blended output stays continuous when GPS comes back.
use log::{debug, info};

use crate::config::BlendConfig;
use crate::messages::{AhrsDrState, InsState, NavEstimate};
use crate::status::FilterStatus;
use crate::{wrap_to_2pi, wrap_to_pi};

/// Blending filter
#[derive(Clone, Debug)]
pub struct Blender {
    config: BlendConfig,
    /// [s] step period
    dt: f64,
    att_weight: f64,
    pos_weight: f64,
    /// [s] time since the INS last reported an accepted fix
    since_fix: f64,
    /// Ceiling earned by the last accepted fix
    held_ceiling: f64,
}

impl Blender {
    pub fn new(config: BlendConfig, dt: f64) -> Self {
        let weight = config.initial_ins_weight;
        Blender {
            config,
            dt,
            att_weight: weight,
            pos_weight: weight,
            since_fix: f64::INFINITY,
            held_ceiling: 0.0,
        }
    }
    /// Current INS weights (attitude, position/velocity)
    pub fn ins_weights(&self) -> (f64, f64) {
        (self.att_weight, self.pos_weight)
    }
    /// Start from the configured weights and emit an estimate immediately
    ///
    /// Safe to call on every cycle: the result only depends on the inputs.
    pub fn initialize(&mut self, ahrs_dr: &AhrsDrState, ins: &InsState, nav: &mut NavEstimate) {
        let weight = if ins_available(ins.status) {
            self.config.initial_ins_weight
        } else {
            0.0
        };
        self.att_weight = weight;
        self.pos_weight = weight;
        self.since_fix = f64::INFINITY;
        self.held_ceiling = 0.0;
        self.track_fixes(ins.status);
        self.combine(ahrs_dr, ins, nav);
        if !nav.status.is_sentinel() {
            info!(
                "Blend initialized: INS weight {:.2}, INS status {}, DR status {}",
                weight, ins.status, ahrs_dr.dr_status
            );
        }
    }
    /// Update the weights from the current statuses and uncertainties, then blend
    pub fn step(&mut self, ahrs_dr: &AhrsDrState, ins: &InsState, nav: &mut NavEstimate) {
        self.since_fix += self.dt;
        self.track_fixes(ins.status);
        let att_var = (sum(&ahrs_dr.pa), sum(&ins.pa));
        let pos_var = (sum(&ahrs_dr.pp), sum(&ins.pp));
        self.att_weight = self.next_weight(ins.status, self.att_weight, att_var);
        self.pos_weight = self.next_weight(ins.status, self.pos_weight, pos_var);
        self.combine(ahrs_dr, ins, nav);
        debug!(
            "Blend weights: attitude {:.3}, position {:.3}",
            self.att_weight, self.pos_weight
        );
    }
    /// True while the INS propagates with no accepted fix inside the grace span
    pub fn is_coasting(&self) -> bool {
        self.since_fix > self.config.coast_grace
    }
    fn track_fixes(&mut self, status: FilterStatus) {
        match status {
            FilterStatus::GpsAided => {
                self.since_fix = 0.0;
                self.held_ceiling = self.config.aided_ceiling;
            }
            FilterStatus::InflatedGpsAided => {
                self.since_fix = 0.0;
                self.held_ceiling = self.config.inflated_ceiling;
            }
            FilterStatus::NoData | FilterStatus::UpdateFailed => {
                self.since_fix = f64::INFINITY;
                self.held_ceiling = 0.0;
            }
            _ => {}
        }
    }
    fn next_weight(&self, status: FilterStatus, previous: f64, variances: (f64, f64)) -> f64 {
        let c = &self.config;
        let coasting = self.is_coasting()
            && matches!(
                status,
                FilterStatus::TimeUpdateOnly | FilterStatus::Refining | FilterStatus::AhrsMeasurementUpdate
            );
        let ceiling = match status {
            FilterStatus::NoData | FilterStatus::UpdateFailed => 0.0,
            _ if coasting => previous * (-self.dt / c.coast_time_constant).exp(),
            _ => self.held_ceiling,
        };
        let (var_dr, var_ins) = variances;
        let share = if c.use_uncertainty && var_dr + var_ins > 0.0 {
            var_dr / (var_dr + var_ins)
        } else {
            1.0
        };
        let target = ceiling.min(share).clamp(0.0, 1.0);
        if coasting {
            target.min(previous)
        } else if target > previous {
            target.min(previous + c.recovery_rate * self.dt)
        } else {
            target
        }
    }
    fn combine(&self, ahrs_dr: &AhrsDrState, ins: &InsState, nav: &mut NavEstimate) {
        let wa = self.att_weight;
        let wp = self.pos_weight;
        let lerp = |a: f64, b: f64, w: f64| a + w * (b - a);

        nav.lat = lerp(ahrs_dr.lat, ins.lat, wp);
        nav.lon = wrap_to_pi(ahrs_dr.lon + wp * wrap_to_pi(ins.lon - ahrs_dr.lon));
        nav.alt = lerp(ahrs_dr.alt, ins.alt, wp);
        nav.vn = lerp(ahrs_dr.vn, ins.vn, wp);
        nav.ve = lerp(ahrs_dr.ve, ins.ve, wp);
        nav.vd = lerp(ahrs_dr.vd, ins.vd, wp);
        nav.phi = wrap_to_pi(ahrs_dr.phi + wa * wrap_to_pi(ins.phi - ahrs_dr.phi));
        nav.the = lerp(ahrs_dr.the, ins.the, wa);
        nav.psi = wrap_to_2pi(ahrs_dr.psi + wa * wrap_to_pi(ins.psi - ahrs_dr.psi));
        for i in 0..3 {
            nav.gb[i] = lerp(ahrs_dr.gb[i], ins.gb[i], wa);
            nav.ab[i] = lerp(ahrs_dr.ab[i], ins.ab[i], wp);
        }
        nav.insgps_att_weight = wa;
        nav.ahrsdr_att_weight = 1.0 - wa;
        nav.insgps_pos_weight = wp;
        nav.ahrsdr_pos_weight = 1.0 - wp;
        nav.status = if wp >= 0.5 && ins_available(ins.status) {
            ins.status
        } else {
            ahrs_dr.dr_status
        };
    }
}

fn ins_available(status: FilterStatus) -> bool {
    !matches!(status, FilterStatus::NoData | FilterStatus::UpdateFailed)
}
fn sum(v: &[f64; 3]) -> f64 {
    v.iter().sum()
}
