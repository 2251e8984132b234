//! Simulated machine backend.
//!
//! Implements every collaborator contract over one shared physical model
//! so the homing core can run end to end without hardware: endstops trip
//! at their configured coordinates, moves overshoot a few steps past the
//! trigger, and the alignment controller follows a scripted deltaError
//! sequence. Every side effect is recorded as a [`SimEvent`].

pub mod backend;
pub mod world;

pub use backend::SimMachine;
pub use world::{SIM_CLOCK_HZ, SIM_OVERSHOOT_STEPS, SIM_PROBE, SimEvent, SimWorld};
