//! PLUMB Common Library
//!
//! Shared types for the PLUMB homing workspace: configuration loading,
//! the fault taxonomy, axis identifiers, alignment records and constants.
//!
//! # Module Structure
//!
//! - [`axis`] - Axis identifiers, axis sets and machine coordinates
//! - [`align`] - Dual-screw alignment request/status records
//! - [`config`] - Configuration loading traits and machine sections
//! - [`consts`] - Timing constants and default paths
//! - [`error`] - `HomingError`, `FaultCode` and structured `Fault`
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use plumb_common::prelude::*;
//! ```

pub mod align;
pub mod axis;
pub mod config;
pub mod consts;
pub mod error;
pub mod prelude;
