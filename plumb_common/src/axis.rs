//! Axis identifiers and machine coordinates.
//!
//! The machine has three cartesian axes. X and Y are horizontal and each
//! driven by one actuator; Z is vertical and driven by two lead screws.
//! Coordinates carry a fourth slot (extruder / auxiliary) that homing
//! never touches but must preserve.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Machine-space position: `[x, y, z, aux]`.
pub type Coord = [f64; 4];

/// Machine-space position where `None` means "keep the current value".
pub type PartialCoord = [Option<f64>; 4];

/// Name of an independently driven motion stage (e.g. `stepper_z1`).
pub type ActuatorId = String;

/// Logical machine axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Axis {
    /// All axes in homing order.
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    /// Index into a [`Coord`].
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::X),
            1 => Some(Self::Y),
            2 => Some(Self::Z),
            _ => None,
        }
    }

    /// Z is the only vertical (dual-screw) axis.
    #[inline]
    pub const fn is_vertical(self) -> bool {
        matches!(self, Self::Z)
    }

    #[inline]
    pub const fn letter(self) -> char {
        match self {
            Self::X => 'X',
            Self::Y => 'Y',
            Self::Z => 'Z',
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Self::X),
            "Y" => Ok(Self::Y),
            "Z" => Ok(Self::Z),
            other => Err(format!("unknown axis '{other}'")),
        }
    }
}

bitflags! {
    /// Set of axes taking part in a homing operation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AxisSet: u8 {
        const X = 0b001;
        const Y = 0b010;
        const Z = 0b100;
    }
}

impl AxisSet {
    /// Every axis the machine can home.
    pub const XYZ: Self = Self::all();

    #[inline]
    pub const fn of(axis: Axis) -> Self {
        match axis {
            Axis::X => Self::X,
            Axis::Y => Self::Y,
            Axis::Z => Self::Z,
        }
    }

    #[inline]
    pub const fn has(&self, axis: Axis) -> bool {
        self.contains(Self::of(axis))
    }

    /// Member axes in X, Y, Z order.
    pub fn axes(&self) -> impl Iterator<Item = Axis> + '_ {
        Axis::ALL.into_iter().filter(|a| self.has(*a))
    }
}

impl FromIterator<Axis> for AxisSet {
    fn from_iter<I: IntoIterator<Item = Axis>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::empty(), |acc, a| acc | Self::of(a))
    }
}

/// Euclidean XYZ distance between two coordinates.
pub fn xyz_distance(a: &Coord, b: &Coord) -> f64 {
    a.iter()
        .zip(b.iter())
        .take(3)
        .map(|(p, q)| (p - q) * (p - q))
        .sum::<f64>()
        .sqrt()
}

/// Overlay the `Some` entries of `partial` on top of `base`.
pub fn fill_coord(base: &Coord, partial: &PartialCoord) -> Coord {
    let mut out = *base;
    for (slot, value) in out.iter_mut().zip(partial.iter()) {
        if let Some(v) = value {
            *slot = *v;
        }
    }
    out
}
