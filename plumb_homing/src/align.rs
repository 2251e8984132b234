//! Dual-screw vertical alignment.

pub mod aligner;
