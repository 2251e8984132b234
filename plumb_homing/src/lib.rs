//! # PLUMB Homing Library
//!
//! Homing and dual-screw Z alignment core for a multi-axis positioning
//! machine.
//!
//! # Module Structure
//!
//! - [`context`] - Collaborator traits and the injected `MachineContext`
//! - [`events`] - Typed observer lists for move and rail notifications
//! - [`homing`] - `HomingMove`, `HomingSession` and the command-level `HomingPolicy`
//! - [`align`] - `DualAxisAligner` retry protocol
//! - [`safety`] - Emergency/abandon stop sequences and the IO remap scope
//! - [`persist`] - Measured top-of-travel store
//! - [`command`] - Text command parsing and dispatch
//! - [`sim`] - Simulated machine implementing every collaborator
//!
//! # Architecture
//!
//! ```text
//! Command ──► HomingPolicy ──► HomingSession ──► HomingMove ──► MachineContext
//!                  │                                               ▲
//!                  └──────────► DualAxisAligner ───────────────────┘
//! ```

pub mod align;
pub mod command;
pub mod context;
pub mod events;
pub mod homing;
pub mod persist;
pub mod safety;
pub mod sim;
