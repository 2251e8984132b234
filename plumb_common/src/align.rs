//! Dual-screw alignment request and status records.
//!
//! The host only converts configured speeds and distances into controller
//! units. Debounce and per-screw edge detection run on the controller.

use crate::config::AlignConfig;
use serde::{Deserialize, Serialize};

/// Direction of an alignment run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlignMotion {
    /// Full alignment toward the screw limit sensors.
    Descend,
    /// Rise-to-safe-height variant.
    Rise,
}

/// Parameters carried by one alignment command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignRequest {
    pub enable: bool,
    /// Controller ticks per step at quick speed.
    pub quick_speed_ticks: u32,
    /// Controller ticks per step at slow speed.
    pub slow_speed_ticks: u32,
    /// Travel budget in steps.
    pub travel_steps: u32,
    /// Consecutive tripped samples required.
    pub filter_count: u8,
}

impl AlignRequest {
    /// Build the request for `motion` from configuration and the
    /// controller clock.
    pub fn from_config(cfg: &AlignConfig, motion: AlignMotion, clock_hz: f64) -> Self {
        let step_distance = cfg.step_distance();
        let distance = match motion {
            AlignMotion::Descend => cfg.rising_dist,
            AlignMotion::Rise => cfg.safe_rising_dist,
        };
        Self {
            enable: true,
            quick_speed_ticks: ticks_per_step(step_distance, cfg.quick_speed, clock_hz),
            slow_speed_ticks: ticks_per_step(step_distance, cfg.slow_speed, clock_hz),
            travel_steps: distance_to_steps(distance, step_distance),
            filter_count: cfg.filter_cnt,
        }
    }
}

/// Step period in controller ticks, truncated.
#[inline]
pub fn ticks_per_step(step_distance: f64, speed: f64, clock_hz: f64) -> u32 {
    (step_distance / speed * clock_hz) as u32
}

/// Whole steps covering `distance`, truncated.
#[inline]
pub fn distance_to_steps(distance: f64, step_distance: f64) -> u32 {
    (distance / step_distance) as u32
}

/// Status record written by the controller and polled by the host.
///
/// `delta_error` is meaningful only once `done` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AlignmentStatus {
    pub done: bool,
    pub delta_error: i32,
}

impl AlignmentStatus {
    /// Residual step difference, if the controller has finished.
    #[inline]
    pub fn result(&self) -> Option<i32> {
        self.done.then_some(self.delta_error)
    }
}
