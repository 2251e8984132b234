//! Safety module root.
//!
//! Stop sequences for stuck sensors and abandoned alignment, and the IO
//! remap scope used while homing a horizontal axis.

pub mod remap;
pub mod stop;
