//! Fault taxonomy for homing and alignment.
//!
//! Every fault raised by the core is a [`HomingError`]. At the command
//! layer it is rendered into a structured [`Fault`] (`code`, `message`,
//! `context`) so the front end can localize it by code.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Stable fault identifiers reported to the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum FaultCode {
    /// Sensor or controller did not answer within its window.
    CommunicationTimeout = 21,
    /// A required sensor never fired.
    TriggerMissing = 22,
    /// Sensor still triggered after the retract pass.
    SpuriousTriggerAfterRetract = 23,
    /// The motion executor rejected or aborted the homing move.
    MoveFailed = 20,
    /// Dual-screw alignment did not finish before its timeout.
    AlignmentTimeout = 351,
    /// Dual-screw alignment did not converge within the retry budget.
    AlignmentRetriesExhausted = 352,
    /// Both screw sensors read triggered before a rise was commanded.
    AlignmentPrecheckFailed = 357,
    /// The machine was already shut down.
    ShutdownDuringHoming = 4,
    /// Controller command could not be delivered.
    ControllerFault = 350,
    /// Persisted state could not be read or written.
    PersistenceFault = 360,
    /// Command arguments out of range or malformed.
    InvalidCommand = 1,
}

impl FaultCode {
    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Fault raised by any homing or alignment operation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HomingError {
    #[error("communication timeout during homing {sensor}")]
    CommunicationTimeout { sensor: String },

    #[error("no trigger on {sensor} after full movement")]
    TriggerMissing { sensor: String },

    #[error("endstop {sensor} still triggered after retract")]
    SpuriousTriggerAfterRetract { sensor: String },

    #[error("error during homing move: {reason}")]
    MoveFailed { reason: String },

    #[error("z alignment timed out after {timeout_s}s on attempt {attempt}")]
    AlignmentTimeout { timeout_s: f64, attempt: u32 },

    #[error(
        "z alignment did not converge after {attempts} attempts \
         (deltaError {delta_error}, tolerance {tolerance})"
    )]
    AlignmentRetriesExhausted {
        attempts: u32,
        delta_error: i32,
        tolerance: i32,
    },

    #[error("screw limit sensors already triggered (wiring fault or excessive bed tilt)")]
    AlignmentPrecheckFailed,

    #[error("homing failed due to machine shutdown")]
    ShutdownDuringHoming { source: Box<HomingError> },

    #[error("controller error: {reason}")]
    Controller { reason: String },

    #[error("persisted state error: {reason}")]
    Persistence { reason: String },

    #[error("invalid command: {reason}")]
    InvalidCommand { reason: String },
}

impl HomingError {
    pub fn code(&self) -> FaultCode {
        match self {
            Self::CommunicationTimeout { .. } => FaultCode::CommunicationTimeout,
            Self::TriggerMissing { .. } => FaultCode::TriggerMissing,
            Self::SpuriousTriggerAfterRetract { .. } => FaultCode::SpuriousTriggerAfterRetract,
            Self::MoveFailed { .. } => FaultCode::MoveFailed,
            Self::AlignmentTimeout { .. } => FaultCode::AlignmentTimeout,
            Self::AlignmentRetriesExhausted { .. } => FaultCode::AlignmentRetriesExhausted,
            Self::AlignmentPrecheckFailed => FaultCode::AlignmentPrecheckFailed,
            Self::ShutdownDuringHoming { .. } => FaultCode::ShutdownDuringHoming,
            Self::Controller { .. } => FaultCode::ControllerFault,
            Self::Persistence { .. } => FaultCode::PersistenceFault,
            Self::InvalidCommand { .. } => FaultCode::InvalidCommand,
        }
    }

    /// Key/value details attached to the structured fault.
    pub fn context(&self) -> BTreeMap<String, String> {
        let mut ctx = BTreeMap::new();
        match self {
            Self::CommunicationTimeout { sensor }
            | Self::TriggerMissing { sensor }
            | Self::SpuriousTriggerAfterRetract { sensor } => {
                ctx.insert("sensor".to_string(), sensor.clone());
            }
            Self::AlignmentTimeout { timeout_s, attempt } => {
                ctx.insert("timeout_s".to_string(), timeout_s.to_string());
                ctx.insert("attempt".to_string(), attempt.to_string());
            }
            Self::AlignmentRetriesExhausted {
                attempts,
                delta_error,
                tolerance,
            } => {
                ctx.insert("attempts".to_string(), attempts.to_string());
                ctx.insert("delta_error".to_string(), delta_error.to_string());
                ctx.insert("tolerance".to_string(), tolerance.to_string());
            }
            Self::ShutdownDuringHoming { source } => {
                ctx.insert("cause".to_string(), source.to_string());
                ctx.insert("cause_code".to_string(), source.code().as_u16().to_string());
            }
            Self::MoveFailed { reason }
            | Self::Controller { reason }
            | Self::Persistence { reason }
            | Self::InvalidCommand { reason } => {
                ctx.insert("reason".to_string(), reason.clone());
            }
            Self::AlignmentPrecheckFailed => {}
        }
        ctx
    }

    /// Wrap a mechanical fault as shutdown-attributed.
    pub fn during_shutdown(self) -> Self {
        match self {
            already @ Self::ShutdownDuringHoming { .. } => already,
            other => Self::ShutdownDuringHoming {
                source: Box::new(other),
            },
        }
    }

    pub fn to_fault(&self) -> Fault {
        Fault {
            code: self.code(),
            message: self.to_string(),
            context: self.context(),
        }
    }
}

/// Structured fault as reported upward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub code: FaultCode,
    pub message: String,
    pub context: BTreeMap<String, String>,
}

impl Fault {
    /// JSON rendering for the command response channel.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

impl From<&HomingError> for Fault {
    fn from(e: &HomingError) -> Self {
        e.to_fault()
    }
}

/// Result alias used across the homing core.
pub type HomingResult<T> = Result<T, HomingError>;
