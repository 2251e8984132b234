//! Machine configuration loading and validation.
//!
//! Configuration is a single TOML file deserialized into [`MachineConfig`]
//! and checked with [`MachineConfig::validate`]. Rail and alignment
//! problems are reported against the section that caused them.
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! log_level = "debug"
//! service_name = "plumb-homing-01"
//!
//! [rails.z]
//! actuators = ["stepper_z", "stepper_z1"]
//! endstop = "z"
//! position_min = -2.0
//! position_max = 360.0
//! position_endstop = 360.0
//! homing_positive_dir = true
//! homing_speed = 10.0
//! second_homing_speed = 5.0
//! homing_retract_dist = 5.0
//! step_distance = 0.0025
//!
//! [z_align]
//! quick_speed = 60.0
//! slow_speed = 20.0
//! rising_dist = 20.0
//! safe_rising_dist = 5.0
//! filter_cnt = 10
//! timeout = 30.0
//! retries = 5
//! retry_tolerance = 10
//! rotation_distance = 8.0
//! microsteps = 16
//! screw_sensors = ["z_left", "z_right"]
//! ```

use crate::axis::Axis;
use crate::consts::{DEFAULT_FULL_STEPS_PER_REV, DEFAULT_TOP_OF_TRAVEL_PATH};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Why a machine configuration was rejected.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("machine config {} not found", path.display())]
    NotFound { path: PathBuf },

    #[error("cannot read machine config {}: {reason}", path.display())]
    Unreadable { path: PathBuf, reason: String },

    /// TOML syntax or a missing/unknown section or field.
    #[error("malformed machine config: {0}")]
    Malformed(String),

    #[error("rail {axis}: {reason}")]
    Rail { axis: Axis, reason: String },

    #[error("[z_align]: {0}")]
    Alignment(String),

    /// Cross-section or policy constraint.
    #[error("machine config rejected: {0}")]
    Invalid(String),
}

/// Log level for the `[shared]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Directive string understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_filter(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// `[shared]`: logging and the instance name used in log lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    #[serde(default)]
    pub log_level: LogLevel,

    /// Machine instance identifier.
    pub service_name: String,
}

// ─── Rails ──────────────────────────────────────────────────────────

fn default_retract_speed() -> f64 {
    5.0
}

/// One homed axis: its actuators, its endstop and its homing motion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RailConfig {
    /// Actuators stopped by this rail's endstop, primary first.
    pub actuators: Vec<String>,
    /// Logical endstop name (e.g. `"x"`, `"z"`).
    pub endstop: String,
    pub position_min: f64,
    pub position_max: f64,
    pub position_endstop: f64,
    /// Home toward `position_max` when true.
    #[serde(default)]
    pub homing_positive_dir: bool,
    /// First-pass speed [mm/s].
    pub homing_speed: f64,
    /// Refine-pass speed [mm/s]; defaults to half the first-pass speed.
    #[serde(default)]
    pub second_homing_speed: Option<f64>,
    /// Retract distance between passes [mm]; 0 disables the second pass.
    #[serde(default)]
    pub homing_retract_dist: f64,
    #[serde(default = "default_retract_speed")]
    pub homing_retract_speed: f64,
    /// Linear travel per microstep [mm].
    pub step_distance: f64,
}

impl RailConfig {
    #[inline]
    pub fn second_speed(&self) -> f64 {
        self.second_homing_speed.unwrap_or(self.homing_speed / 2.0)
    }

    /// Center of the travel range.
    #[inline]
    pub fn center(&self) -> f64 {
        self.position_min + (self.position_max - self.position_min) / 2.0
    }

    pub fn validate(&self, axis: Axis) -> Result<(), ConfigError> {
        let fail = |reason: String| Err(ConfigError::Rail { axis, reason });
        if self.actuators.is_empty() {
            return fail("at least one actuator is required".to_string());
        }
        if self.endstop.is_empty() {
            return fail("endstop name cannot be empty".to_string());
        }
        if !(self.position_min <= self.position_endstop
            && self.position_endstop <= self.position_max)
        {
            return fail(format!(
                "position_endstop {} outside [{}, {}]",
                self.position_endstop, self.position_min, self.position_max
            ));
        }
        if self.homing_speed <= 0.0 || self.second_speed() <= 0.0 || self.homing_retract_speed <= 0.0 {
            return fail("homing speeds must be > 0".to_string());
        }
        if self.homing_retract_dist < 0.0 {
            return fail("homing_retract_dist must be >= 0".to_string());
        }
        if self.step_distance <= 0.0 {
            return fail("step_distance must be > 0".to_string());
        }
        Ok(())
    }
}

// ─── Dual-screw alignment ───────────────────────────────────────────

fn default_full_steps_per_rev() -> u32 {
    DEFAULT_FULL_STEPS_PER_REV
}

fn default_post_align_drop() -> f64 {
    10.0
}

/// Controller-assisted dual-screw alignment parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AlignConfig {
    /// Descent speed until each screw's sensor first trips [mm/s].
    pub quick_speed: f64,
    /// Probing speed after the first trip [mm/s].
    pub slow_speed: f64,
    /// Travel budget of one alignment attempt [mm].
    pub rising_dist: f64,
    /// Travel budget of the rise-to-safe-height variant [mm].
    pub safe_rising_dist: f64,
    /// Consecutive tripped samples required by the controller.
    pub filter_cnt: u8,
    /// Wall-clock limit of one attempt [s].
    pub timeout: f64,
    /// Maximum number of attempts.
    pub retries: u32,
    /// Accepted |deltaError| bound, exclusive [steps].
    pub retry_tolerance: i32,
    /// Screw lead [mm/rev].
    pub rotation_distance: f64,
    pub microsteps: u32,
    #[serde(default = "default_full_steps_per_rev")]
    pub full_steps_per_rev: u32,
    /// Drop after restoring the persisted top-of-travel [mm].
    #[serde(default = "default_post_align_drop")]
    pub post_align_drop: f64,
    /// Logical names of the two screw limit sensors.
    pub screw_sensors: [String; 2],
}

impl AlignConfig {
    /// Linear travel per microstep of one screw [mm].
    #[inline]
    pub fn step_distance(&self) -> f64 {
        self.rotation_distance / (self.full_steps_per_rev as f64 * self.microsteps as f64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Alignment(msg.to_string()));
        if self.quick_speed <= 0.0 || self.slow_speed <= 0.0 {
            return fail("speeds must be > 0");
        }
        if self.rising_dist <= 0.0 || self.safe_rising_dist <= 0.0 {
            return fail("rise distances must be > 0");
        }
        if self.safe_rising_dist > self.rising_dist {
            return fail("safe_rising_dist cannot exceed rising_dist");
        }
        if self.timeout <= 0.0 {
            return fail("timeout must be > 0");
        }
        if self.retries == 0 {
            return fail("retries must be >= 1");
        }
        if self.retry_tolerance <= 0 {
            return fail("retry_tolerance must be > 0");
        }
        if self.rotation_distance <= 0.0 || self.microsteps == 0 || self.full_steps_per_rev == 0 {
            return fail("rotation_distance, microsteps and full_steps_per_rev must be > 0");
        }
        if self.screw_sensors[0] == self.screw_sensors[1] {
            return fail("screw_sensors must name two distinct sensors");
        }
        Ok(())
    }
}

// ─── Policy, IO remap, persistence ──────────────────────────────────

fn default_lift_ratio() -> f64 {
    0.90
}
fn default_center_speed() -> f64 {
    50.0
}
fn default_lift_speed() -> f64 {
    30.0
}
fn default_sensorless_max() -> f64 {
    360.0
}
fn default_sensorless_backoff() -> f64 {
    3.0
}

/// Command-level homing policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HomingPolicyConfig {
    /// Fraction of max travel lowered before the post-alignment Z home.
    #[serde(default = "default_lift_ratio")]
    pub pre_home_lift_ratio: f64,
    #[serde(default = "default_center_speed")]
    pub center_move_speed: f64,
    #[serde(default = "default_lift_speed")]
    pub pre_home_lift_speed: f64,
    /// Upper bound of `CALIBRATE_Z_SENSORLESS DISTANCE` [mm].
    #[serde(default = "default_sensorless_max")]
    pub sensorless_max_distance: f64,
    /// Z reported after sensorless calibration is `DISTANCE - backoff` [mm].
    #[serde(default = "default_sensorless_backoff")]
    pub sensorless_backoff: f64,
}

impl Default for HomingPolicyConfig {
    fn default() -> Self {
        Self {
            pre_home_lift_ratio: default_lift_ratio(),
            center_move_speed: default_center_speed(),
            pre_home_lift_speed: default_lift_speed(),
            sensorless_max_distance: default_sensorless_max(),
            sensorless_backoff: default_sensorless_backoff(),
        }
    }
}

fn default_remap_axis() -> Axis {
    Axis::X
}

/// IO safety remap engaged while homing one horizontal axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IoRemapConfig {
    #[serde(default = "default_remap_axis")]
    pub axis: Axis,
}

fn default_top_of_travel_path() -> PathBuf {
    PathBuf::from(DEFAULT_TOP_OF_TRAVEL_PATH)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistConfig {
    #[serde(default = "default_top_of_travel_path")]
    pub top_of_travel_path: PathBuf,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            top_of_travel_path: default_top_of_travel_path(),
        }
    }
}

// ─── Machine ────────────────────────────────────────────────────────

/// The three homed rails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailsConfig {
    pub x: RailConfig,
    pub y: RailConfig,
    pub z: RailConfig,
}

impl RailsConfig {
    #[inline]
    pub fn get(&self, axis: Axis) -> &RailConfig {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }
}

/// Complete machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub shared: SharedConfig,
    pub rails: RailsConfig,
    #[serde(default)]
    pub z_align: Option<AlignConfig>,
    #[serde(default)]
    pub io_remap: Option<IoRemapConfig>,
    #[serde(default)]
    pub persist: PersistConfig,
    #[serde(default)]
    pub homing: HomingPolicyConfig,
}

impl MachineConfig {
    /// Read and parse a TOML file without validating it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Unreadable {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
        })?;
        Self::parse(&content)
    }

    /// Load and validate in one step.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        debug!(path = %path.display(), service = %config.shared.service_name, "machine configuration loaded");
        Ok(config)
    }

    /// Parse and validate an in-memory TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Malformed(e.to_string()))
    }

    #[inline]
    pub fn rail(&self, axis: Axis) -> &RailConfig {
        self.rails.get(axis)
    }

    /// Check every section and the constraints between them.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shared.service_name.is_empty() {
            return Err(ConfigError::Invalid(
                "[shared] service_name cannot be empty".to_string(),
            ));
        }
        for axis in Axis::ALL {
            self.rail(axis).validate(axis)?;
        }
        if let Some(align) = &self.z_align {
            align.validate()?;
            let z = &self.rails.z;
            if z.actuators.len() != 2 {
                return Err(ConfigError::Rail {
                    axis: Axis::Z,
                    reason: format!(
                        "z_align requires exactly two actuators, found {}",
                        z.actuators.len()
                    ),
                });
            }
        }
        if let Some(remap) = &self.io_remap {
            if remap.axis.is_vertical() {
                return Err(ConfigError::Invalid(
                    "[io_remap] axis must be horizontal".to_string(),
                ));
            }
        }
        let h = &self.homing;
        if !(h.pre_home_lift_ratio > 0.0 && h.pre_home_lift_ratio < 1.0) {
            return Err(ConfigError::Invalid(
                "[homing] pre_home_lift_ratio must be in (0, 1)".to_string(),
            ));
        }
        if h.center_move_speed <= 0.0 || h.pre_home_lift_speed <= 0.0 {
            return Err(ConfigError::Invalid(
                "[homing] move speeds must be > 0".to_string(),
            ));
        }
        if h.sensorless_max_distance <= 0.0 || h.sensorless_backoff < 0.0 {
            return Err(ConfigError::Invalid(
                "[homing] sensorless distance must be > 0 and backoff >= 0".to_string(),
            ));
        }
        Ok(())
    }
}
