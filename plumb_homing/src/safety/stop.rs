//! Stop sequences run when homing or alignment cannot continue safely.
//!
//! Emergency: hold + flush → settle → query protection → fault-report mode.
//! Alignment abandon: mark XYZ known → nudge X → de-energize all stages.
//!
//! Every action is attempted even if an earlier one failed; the first
//! failure is reported once the sequence is complete.

use crate::context::{DriveStage, MachineContext};
use plumb_common::axis::{ActuatorId, Axis, AxisSet};
use plumb_common::consts::{ABANDON_NUDGE_SPEED, ABANDON_NUDGE_X, EMERGENCY_SETTLE_TIME};
use plumb_common::error::HomingResult;
use tracing::{info, warn};

/// Which stop protocol to run.
#[derive(Debug, Clone, PartialEq)]
pub enum StopProfile {
    /// Stuck sensor on a horizontal axis after retract.
    Emergency { actuators: Vec<ActuatorId> },
    /// Alignment timed out or did not converge.
    AlignmentAbandon,
}

/// Execution phase of a stop sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPhase {
    /// Not started.
    Idle,
    /// Actions are being applied.
    Running,
    /// All actions applied.
    Complete,
}

/// One step of a stop sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum StopAction {
    /// Assert hold on the drives and discard queued motion.
    HoldAndFlush,
    /// Suspend for the given time [s].
    Settle(f64),
    QueryProtection,
    FaultReportMode(Vec<ActuatorId>),
    /// Accept the current position as known for these axes.
    MarkKnown(AxisSet),
    /// Small relative move on one axis [mm, mm/s].
    Nudge { axis: Axis, delta: f64, speed: f64 },
    Deenergize(DriveStage),
}

#[derive(Debug, Clone)]
pub struct SafeStopSequence {
    actions: Vec<StopAction>,
    next: usize,
    phase: StopPhase,
}

impl SafeStopSequence {
    pub fn new(profile: StopProfile) -> Self {
        let actions = match profile {
            StopProfile::Emergency { actuators } => vec![
                StopAction::HoldAndFlush,
                StopAction::Settle(EMERGENCY_SETTLE_TIME),
                StopAction::QueryProtection,
                StopAction::FaultReportMode(actuators),
            ],
            StopProfile::AlignmentAbandon => vec![
                StopAction::MarkKnown(AxisSet::XYZ),
                StopAction::Nudge {
                    axis: Axis::X,
                    delta: ABANDON_NUDGE_X,
                    speed: ABANDON_NUDGE_SPEED,
                },
                StopAction::Deenergize(DriveStage::All),
            ],
        };
        Self {
            actions,
            next: 0,
            phase: StopPhase::Idle,
        }
    }

    #[inline]
    pub const fn phase(&self) -> StopPhase {
        self.phase
    }

    #[inline]
    pub fn actions(&self) -> &[StopAction] {
        &self.actions
    }

    /// Next action to apply, advancing the sequence.
    pub fn next_action(&mut self) -> Option<StopAction> {
        if self.phase == StopPhase::Complete {
            return None;
        }
        self.phase = StopPhase::Running;
        match self.actions.get(self.next).cloned() {
            Some(action) => {
                self.next += 1;
                Some(action)
            }
            None => {
                self.phase = StopPhase::Complete;
                None
            }
        }
    }

    /// Apply every remaining action against `ctx`.
    pub fn execute(mut self, ctx: &mut MachineContext) -> HomingResult<()> {
        let mut first = Ok(());
        while let Some(action) = self.next_action() {
            let result = apply(ctx, &action);
            if let Err(e) = &result {
                warn!("stop action {:?} failed: {e}", action);
            }
            if first.is_ok() {
                first = result;
            }
        }
        info!("stop sequence complete");
        first
    }
}

fn apply(ctx: &mut MachineContext, action: &StopAction) -> HomingResult<()> {
    match action {
        StopAction::HoldAndFlush => {
            ctx.motion.flush_pending_steps();
            ctx.drives.hold_and_flush()
        }
        StopAction::Settle(seconds) => {
            let until = ctx.reactor.monotonic() + seconds;
            ctx.reactor.pause_until(until);
            Ok(())
        }
        StopAction::QueryProtection => ctx.drives.query_protection(),
        StopAction::FaultReportMode(actuators) => ctx.drives.set_fault_report_mode(actuators),
        StopAction::MarkKnown(axes) => {
            let pos = ctx.motion.position();
            ctx.motion.set_position(pos, *axes);
            Ok(())
        }
        StopAction::Nudge { axis, delta, speed } => {
            let mut pos = ctx.motion.position();
            pos[axis.index()] += delta;
            ctx.motion.commanded_move(pos, *speed)
        }
        StopAction::Deenergize(stage) => ctx.drives.set_enabled(*stage, false),
    }
}
