//! Command surface.
//!
//! Text commands (`HOME X Z`, `ALIGN_Z_BYPASS ENABLE=0`, ...) are parsed
//! into a typed [`Command`] and dispatched against a [`HomingPolicy`].

use crate::context::MachineContext;
use crate::homing::policy::{HomeReport, HomingPolicy};
use plumb_common::axis::{Axis, AxisSet, Coord};
use plumb_common::error::{HomingError, HomingResult};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Command keywords, in the order they are documented.
pub const KEYWORDS: [&str; 6] = [
    "HOME",
    "HOME_Z_FREE",
    "ALIGN_Z",
    "ALIGN_Z_BYPASS",
    "RISE_SAFE_Z",
    "CALIBRATE_Z_SENSORLESS",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Home the named axes, or all three when the set is empty.
    Home(AxisSet),
    HomeZFree,
    AlignZ,
    AlignZBypass { enable: bool },
    RiseSafeZ,
    CalibrateZSensorless { distance: f64 },
}

/// Successful command result.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Homed(HomeReport),
    Aligned { delta_error: i32 },
    Risen { delta_error: i32 },
    BypassSet { enabled: bool },
    Calibrated { position: Coord },
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Homed(report) => {
                let axes: String = report.axes.axes().map(Axis::letter).collect();
                write!(f, "homed {axes}")?;
                if let Some(delta) = report.alignment_delta {
                    write!(f, ", alignment deltaError {delta}")?;
                }
                if let Some(top) = report.top_of_travel {
                    write!(f, ", top-of-travel {top:.3} mm")?;
                }
                if report.full_travel_no_trigger {
                    write!(f, ", vertical full travel without trigger")?;
                }
                Ok(())
            }
            Self::Aligned { delta_error } => write!(f, "z aligned, deltaError {delta_error}"),
            Self::Risen { delta_error } => write!(f, "z at safe height, deltaError {delta_error}"),
            Self::BypassSet { enabled } => write!(
                f,
                "z alignment {}",
                if *enabled { "enabled" } else { "bypassed" }
            ),
            Self::Calibrated { position } => write!(
                f,
                "sensorless calibration done, z {:.3} (not homed)",
                position[Axis::Z.index()]
            ),
        }
    }
}

fn invalid(reason: impl Into<String>) -> HomingError {
    HomingError::InvalidCommand {
        reason: reason.into(),
    }
}

/// Split `KEY=VALUE` parameters; keys are case-insensitive.
fn parse_params<'a>(
    keyword: &str,
    tokens: impl Iterator<Item = &'a str>,
) -> HomingResult<BTreeMap<String, String>> {
    tokens
        .map(|t| {
            t.split_once('=')
                .map(|(k, v)| (k.to_ascii_uppercase(), v.to_string()))
                .ok_or_else(|| invalid(format!("{keyword}: malformed parameter '{t}'")))
        })
        .collect()
}

fn take_param<T: FromStr>(
    keyword: &str,
    params: &mut BTreeMap<String, String>,
    key: &str,
) -> HomingResult<T> {
    let raw = params
        .remove(key)
        .ok_or_else(|| invalid(format!("{keyword}: missing {key}")))?;
    raw.parse()
        .map_err(|_| invalid(format!("{keyword}: invalid {key} '{raw}'")))
}

fn reject_extra(keyword: &str, params: &BTreeMap<String, String>) -> HomingResult<()> {
    match params.keys().next() {
        Some(k) => Err(invalid(format!("{keyword}: unknown parameter {k}"))),
        None => Ok(()),
    }
}

impl FromStr for Command {
    type Err = HomingError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut tokens = line.split_whitespace();
        let keyword = tokens
            .next()
            .ok_or_else(|| invalid("empty command"))?
            .to_ascii_uppercase();

        match keyword.as_str() {
            "HOME" => {
                let axes = tokens
                    .map(|t| t.parse::<Axis>().map_err(|e| invalid(format!("HOME: {e}"))))
                    .collect::<HomingResult<AxisSet>>()?;
                Ok(Self::Home(axes))
            }
            "ALIGN_Z_BYPASS" => {
                let mut params = parse_params(&keyword, tokens)?;
                let enable: u8 = take_param(&keyword, &mut params, "ENABLE")?;
                reject_extra(&keyword, &params)?;
                match enable {
                    0 => Ok(Self::AlignZBypass { enable: false }),
                    1 => Ok(Self::AlignZBypass { enable: true }),
                    other => Err(invalid(format!("ALIGN_Z_BYPASS: ENABLE must be 0 or 1, got {other}"))),
                }
            }
            "CALIBRATE_Z_SENSORLESS" => {
                let mut params = parse_params(&keyword, tokens)?;
                let distance: f64 = take_param(&keyword, &mut params, "DISTANCE")?;
                reject_extra(&keyword, &params)?;
                Ok(Self::CalibrateZSensorless { distance })
            }
            "HOME_Z_FREE" | "ALIGN_Z" | "RISE_SAFE_Z" => {
                let params = parse_params(&keyword, tokens)?;
                reject_extra(&keyword, &params)?;
                Ok(match keyword.as_str() {
                    "HOME_Z_FREE" => Self::HomeZFree,
                    "ALIGN_Z" => Self::AlignZ,
                    _ => Self::RiseSafeZ,
                })
            }
            other => Err(invalid(format!("unknown command '{other}'"))),
        }
    }
}

impl Command {
    /// Parse a token stream holding several commands back to back; every
    /// keyword starts a new command.
    pub fn parse_script<S: AsRef<str>>(tokens: &[S]) -> HomingResult<Vec<Self>> {
        let mut lines: Vec<Vec<&str>> = Vec::new();
        for token in tokens.iter().flat_map(|t| t.as_ref().split_whitespace()) {
            let is_keyword = KEYWORDS
                .iter()
                .any(|k| k.eq_ignore_ascii_case(token));
            if is_keyword {
                lines.push(vec![token]);
                continue;
            }
            match lines.last_mut() {
                Some(line) => line.push(token),
                None => return Err(invalid(format!("expected a command, found '{token}'"))),
            }
        }
        lines.iter().map(|l| l.join(" ").parse()).collect()
    }

    pub fn execute(
        &self,
        policy: &mut HomingPolicy,
        ctx: &mut MachineContext,
    ) -> HomingResult<CommandOutput> {
        info!(command = ?self, "executing");
        match self {
            Self::Home(axes) => policy.home(ctx, *axes).map(CommandOutput::Homed),
            Self::HomeZFree => policy.home_z_free(ctx).map(CommandOutput::Homed),
            Self::AlignZ => policy
                .align_z(ctx)
                .map(|delta_error| CommandOutput::Aligned { delta_error }),
            Self::AlignZBypass { enable } => {
                policy.set_alignment_enabled(*enable);
                Ok(CommandOutput::BypassSet { enabled: *enable })
            }
            Self::RiseSafeZ => policy
                .rise_safe_z(ctx)
                .map(|delta_error| CommandOutput::Risen { delta_error }),
            Self::CalibrateZSensorless { distance } => policy
                .calibrate_z_sensorless(ctx, *distance)
                .map(|position| CommandOutput::Calibrated { position }),
        }
    }
}
