//! Collaborator contracts and the injected machine context.
//!
//! The homing core never looks subsystems up by name. Every component
//! receives a [`MachineContext`] holding the typed collaborators it needs:
//! motion executor, kinematics, endstop sensors, the alignment controller,
//! drive control, the reactor clock and a few status probes.
//!
//! The host is single-threaded and cooperative, so shared handles are
//! `Rc` and completion state uses `Cell`.

use plumb_common::align::{AlignMotion, AlignRequest, AlignmentStatus};
use plumb_common::axis::{ActuatorId, AxisSet, Coord};
use plumb_common::error::{HomingError, HomingResult};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Actuator positions in (fractional) step units.
pub type StepMap = BTreeMap<ActuatorId, f64>;

// ─── Trigger completion ─────────────────────────────────────────────

/// Result of waiting on one armed sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TriggerOutcome {
    /// Sensor fired at the given controller time [s].
    Triggered { time: f64 },
    /// Sensor or controller did not answer.
    Timeout,
    /// Move completed with no trigger.
    NotTriggered,
}

impl TriggerOutcome {
    /// Decode the controller's raw wait result: positive is a trigger time,
    /// negative is the timeout sentinel, zero means no trigger.
    #[inline]
    pub fn from_raw(raw: f64) -> Self {
        if raw > 0.0 {
            Self::Triggered { time: raw }
        } else if raw < 0.0 {
            Self::Timeout
        } else {
            Self::NotTriggered
        }
    }

    #[inline]
    pub const fn trigger_time(&self) -> Option<f64> {
        match self {
            Self::Triggered { time } => Some(*time),
            _ => None,
        }
    }
}

/// One-shot completion object resolved by a sensor backend.
#[derive(Debug, Default)]
pub struct TriggerCompletion {
    outcome: Cell<Option<TriggerOutcome>>,
}

impl TriggerCompletion {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Resolve the completion. Later calls are ignored.
    pub fn complete(&self, outcome: TriggerOutcome) {
        if self.outcome.get().is_none() {
            self.outcome.set(Some(outcome));
        }
    }

    #[inline]
    pub fn outcome(&self) -> Option<TriggerOutcome> {
        self.outcome.get()
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.outcome.get().is_some()
    }
}

/// Completion that fires when **any** member fired or errored.
#[derive(Debug, Default, Clone)]
pub struct CompositeTrigger {
    members: Vec<Rc<TriggerCompletion>>,
}

impl CompositeTrigger {
    pub fn new(members: Vec<Rc<TriggerCompletion>>) -> Self {
        Self { members }
    }

    #[inline]
    pub fn members(&self) -> &[Rc<TriggerCompletion>] {
        &self.members
    }

    /// True once one member reported a trigger or a timeout.
    pub fn fired(&self) -> bool {
        self.members.iter().any(|m| {
            matches!(
                m.outcome(),
                Some(TriggerOutcome::Triggered { .. } | TriggerOutcome::Timeout)
            )
        })
    }
}

// ─── Sensors ────────────────────────────────────────────────────────

/// Parameters for arming one endstop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ArmRequest {
    /// Controller time at which sampling starts [s].
    pub start_time: f64,
    /// Sample window [s].
    pub sample_time: f64,
    /// Consecutive samples required.
    pub sample_count: u32,
    /// Rest between sample windows [s].
    pub rest_time: f64,
    /// Level that counts as triggered.
    pub triggered: bool,
}

/// A limit/endstop sensor bound to one or more actuators.
pub trait EndstopSensor {
    /// Actuators stopped by this sensor.
    fn actuators(&self) -> Vec<ActuatorId>;

    /// Start controller-side trigger detection.
    fn arm(&self, request: ArmRequest) -> Rc<TriggerCompletion>;

    /// Collect the result after the move ended at `deadline`.
    fn wait_result(&self, deadline: f64) -> TriggerOutcome;

    /// Current level.
    fn is_triggered(&self) -> bool;
}

// ─── Motion ─────────────────────────────────────────────────────────

/// Trajectory front end: believed position plus queued moves.
///
/// Coordinates are `[x, y, z, aux]` in mm. Errors from a move surface as
/// [`HomingError::MoveFailed`].
pub trait MotionExecutor {
    /// Believed machine position.
    fn position(&self) -> Coord;

    /// Overwrite the believed position; `homing_axes` are marked homed.
    fn set_position(&mut self, pos: Coord, homing_axes: AxisSet);

    /// Clear the homed state of `axes` without moving.
    fn mark_unhomed(&mut self, axes: AxisSet);

    /// Plain move to `pos` at `speed` [mm/s] with no sensor armed.
    fn commanded_move(&mut self, pos: Coord, speed: f64) -> HomingResult<()>;

    /// Move that stops as soon as `stop_on` fires.
    fn interruptible_move(
        &mut self,
        pos: Coord,
        speed: f64,
        stop_on: &CompositeTrigger,
    ) -> HomingResult<()>;

    /// Push every queued step to the controller so step counters are final.
    fn flush_pending_steps(&mut self);

    /// Controller time at which the last queued move ends [s].
    fn last_move_time(&self) -> f64;

    /// Delay the motion queue by `seconds`.
    fn dwell(&mut self, seconds: f64);
}

/// Kinematics solver: actuator steps to machine coordinates and back.
pub trait Kinematics {
    /// Every actuator the solver knows, in a stable order.
    fn list_actuators(&self) -> Vec<ActuatorId>;

    /// Linear travel per step [mm].
    fn step_distance(&self, actuator: &str) -> f64;

    /// Controller step counter now.
    fn mcu_position(&self, actuator: &str) -> i64;

    /// Controller step counter at a past controller time.
    fn mcu_position_at(&self, actuator: &str, time: f64) -> i64;

    /// Step position implied by the believed machine position.
    fn commanded_step_position(&self, actuator: &str) -> f64;

    /// Step position of `actuator` for an arbitrary machine position.
    fn steps_from_position(&self, actuator: &str, pos: &Coord) -> f64;

    /// XYZ from actuator step positions; the aux slot is left at 0.
    fn position_from_steps(&self, steps: &StepMap) -> Coord;
}

// ─── Alignment controller ───────────────────────────────────────────

/// Real-time controller running the dual-screw alignment loop.
pub trait AlignController {
    /// Controller tick frequency [Hz].
    fn clock_frequency(&self) -> f64;

    /// Issue one alignment command. Resets the status `done` flag.
    fn send(&mut self, motion: AlignMotion, request: AlignRequest) -> HomingResult<()>;

    /// Latest status record.
    fn status(&self) -> AlignmentStatus;
}

// ─── Drives and status ──────────────────────────────────────────────

/// Group of drive electronics switched together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriveStage {
    All,
    Horizontal,
    Vertical,
}

impl fmt::Display for DriveStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::All => "all",
            Self::Horizontal => "horizontal",
            Self::Vertical => "vertical",
        };
        f.write_str(s)
    }
}

/// Drive electronics: enable lines, hold, protection status.
pub trait DriveControl {
    /// Energize or de-energize one stage.
    fn set_enabled(&mut self, stage: DriveStage, enabled: bool) -> HomingResult<()>;

    /// Assert hold on all drives and discard queued motion.
    fn hold_and_flush(&mut self) -> HomingResult<()>;

    /// Query drive protection codes after a stop.
    fn query_protection(&mut self) -> HomingResult<()>;

    /// Switch drives to stall/fault reporting output.
    fn set_fault_report_mode(&mut self, actuators: &[ActuatorId]) -> HomingResult<()>;

    /// Reconcile per-actuator drift on the dual-screw axis.
    fn synchronize_actuators(&mut self) -> HomingResult<()>;
}

/// Cooperative scheduler clock.
pub trait Reactor {
    /// Host clock [s].
    fn monotonic(&self) -> f64;

    /// Suspend until absolute time `t`.
    fn pause_until(&mut self, t: f64);
}

/// Global machine state.
pub trait MachineStatus {
    /// True once the machine entered shutdown.
    fn is_shutdown(&self) -> bool;
}

/// Bed-leveling mesh state.
pub trait LevelingState {
    /// A leveling mesh is loaded for this session.
    fn is_active(&self) -> bool;

    /// Drop the loaded mesh.
    fn clear_mesh(&mut self);
}

/// IO safety remap switched around one horizontal axis home.
pub trait IoRemap {
    /// Engage (`true`) or revert (`false`) the remap.
    fn set_remap(&mut self, enabled: bool) -> HomingResult<()>;
}

// ─── Context ────────────────────────────────────────────────────────

/// Typed collaborators injected into every homing component.
pub struct MachineContext {
    /// Position bookkeeping and move queue.
    pub motion: Box<dyn MotionExecutor>,
    /// Step/position conversion and controller step counters.
    pub kinematics: Box<dyn Kinematics>,
    /// Sensors by logical name.
    pub sensors: BTreeMap<String, Rc<dyn EndstopSensor>>,
    /// Present when the machine has a dual-screw alignment controller.
    pub controller: Option<Box<dyn AlignController>>,
    /// Stage enables, hold and fault reporting.
    pub drives: Box<dyn DriveControl>,
    /// Clock used for alignment polling and settle waits.
    pub reactor: Box<dyn Reactor>,
    /// Shutdown probe used for fault attribution.
    pub status: Box<dyn MachineStatus>,
    pub leveling: Box<dyn LevelingState>,
    /// Present when the machine has an IO safety remap.
    pub io_remap: Option<Box<dyn IoRemap>>,
}

impl MachineContext {
    /// Sensor by logical name; unknown names are a controller fault.
    pub fn sensor(&self, name: &str) -> HomingResult<Rc<dyn EndstopSensor>> {
        self.sensors
            .get(name)
            .cloned()
            .ok_or_else(|| HomingError::Controller {
                reason: format!("unknown sensor '{name}'"),
            })
    }

    /// The alignment controller, or a controller fault when absent.
    pub fn controller(&mut self) -> HomingResult<&mut dyn AlignController> {
        match self.controller.as_deref_mut() {
            Some(c) => Ok(c),
            None => Err(HomingError::Controller {
                reason: "no alignment controller configured".to_string(),
            }),
        }
    }

    /// Machine position with XYZ replaced by the kinematic solution of
    /// `steps`; the aux slot keeps its current value.
    pub fn position_from_steps(&self, steps: &StepMap) -> Coord {
        let mut pos = self.kinematics.position_from_steps(steps);
        pos[3] = self.motion.position()[3];
        pos
    }
}
