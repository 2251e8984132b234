//! Homing module root.
//!
//! [`homing_move`] runs one armed move, [`session`] composes passes for an
//! axis group, [`policy`] sequences axes at command level.

pub mod homing_move;
pub mod policy;
pub mod session;
