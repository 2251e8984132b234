//! Workspace-wide constants.
//!
//! Single source of truth for homing timings, sampling parameters and
//! default paths. Imported by all crates.

use static_assertions::const_assert;

/// Settle delay between arming endstops and issuing the homing move [s].
pub const HOMING_START_DELAY: f64 = 0.001;

/// Endstop sample window used by the controller-side debounce [s].
pub const ENDSTOP_SAMPLE_TIME: f64 = 0.000_015;

/// Consecutive samples the controller requires before reporting a trigger.
pub const ENDSTOP_SAMPLE_COUNT: u32 = 4;

/// Poll interval used when a homing move does not step any actuator [s].
pub const ENDSTOP_IDLE_REST_TIME: f64 = 0.001;

/// Speed multiplier for the first pass of a stall-detection (sensorless) home.
pub const SENSORLESS_SPEED_FACTOR: f64 = 4.0;

/// Forced start lies this many endstop-to-limit spans behind the endstop.
pub const FORCED_START_SPAN: f64 = 1.5;

/// Wait after sending an alignment request before the first status poll [s].
pub const ALIGN_SETTLE_DELAY: f64 = 1.0;

/// Interval between alignment status polls [s].
pub const ALIGN_POLL_INTERVAL: f64 = 0.1;

/// Full steps per motor revolution for the Z screws.
pub const DEFAULT_FULL_STEPS_PER_REV: u32 = 200;

/// Settle time after an emergency stop before querying the drives [s].
pub const EMERGENCY_SETTLE_TIME: f64 = 1.0;

/// Nudge applied to X when abandoning a timed-out alignment [mm].
pub const ABANDON_NUDGE_X: f64 = 0.001;

/// Feed used for the abandon nudge [mm/s] (1000 mm/min).
pub const ABANDON_NUDGE_SPEED: f64 = 1000.0 / 60.0;

/// Provisional Z position asserted before a rise-to-safe-height [mm].
pub const RISE_PROVISIONAL_Z: f64 = 10.0;

/// Initial nudge before the rise-to-safe-height protocol [mm].
pub const RISE_NUDGE_Z: f64 = 0.1;

/// Feed for the rise nudge [mm/s] (600 mm/min).
pub const RISE_NUDGE_SPEED: f64 = 600.0 / 60.0;

/// Feed for the drop after restoring the persisted top-of-travel [mm/s] (600 mm/min).
pub const POST_ALIGN_DROP_SPEED: f64 = 600.0 / 60.0;

/// Margin below max travel used when no persisted top-of-travel exists [mm].
pub const TOP_OF_TRAVEL_FALLBACK_MARGIN: f64 = 10.0;

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/plumb/machine.toml";

/// Default persisted top-of-travel record path.
pub const DEFAULT_TOP_OF_TRAVEL_PATH: &str = "/var/lib/plumb/real_zmax.json";

const_assert!(ALIGN_POLL_INTERVAL < ALIGN_SETTLE_DELAY);
const_assert!(ENDSTOP_SAMPLE_COUNT > 0);
