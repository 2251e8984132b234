//! Prelude module for common re-exports.
//!
//! `use plumb_common::prelude::*;` brings in the types most homing code
//! touches without listing individual paths.

// ─── Logging ────────────────────────────────────────────────────────
pub use crate::config::LogLevel;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    AlignConfig, ConfigError, HomingPolicyConfig, IoRemapConfig, MachineConfig,
    PersistConfig, RailConfig, RailsConfig, SharedConfig,
};

// ─── Axes ───────────────────────────────────────────────────────────
pub use crate::axis::{ActuatorId, Axis, AxisSet, Coord, PartialCoord};

// ─── Alignment ──────────────────────────────────────────────────────
pub use crate::align::{AlignMotion, AlignRequest, AlignmentStatus};

// ─── Faults ─────────────────────────────────────────────────────────
pub use crate::error::{Fault, FaultCode, HomingError, HomingResult};
