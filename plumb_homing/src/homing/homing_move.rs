//! One arm-sensors / drive-move / resolve-trigger cycle.
//!
//! ## Lifecycle
//!
//! 1. Publish [`MoveEvent::Begin`]
//! 2. Capture `start_pos` of every actuator bound to an armed sensor
//! 3. Arm each sensor with a poll interval derived from the planned move
//! 4. Issue one interruptible move bound to a first-trigger composite
//! 5. Collect per-sensor wait results, then `halt_pos` / `trig_pos`
//! 6. Resolve the machine position and publish [`MoveEvent::End`]
//!
//! Faults from steps 4–6 are merged and raised only after bookkeeping
//! has completed.

use crate::context::{ArmRequest, CompositeTrigger, EndstopSensor, MachineContext, StepMap, TriggerOutcome};
use crate::events::{MoveEvent, ObserverList};
use plumb_common::axis::{ActuatorId, Axis, AxisSet, Coord, xyz_distance};
use plumb_common::consts::{
    ENDSTOP_IDLE_REST_TIME, ENDSTOP_SAMPLE_COUNT, ENDSTOP_SAMPLE_TIME, HOMING_START_DELAY,
};
use plumb_common::error::{HomingError, HomingResult};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, trace};

// ─── Sensor binding ─────────────────────────────────────────────────

/// A sensor paired with the logical name and axis it protects.
#[derive(Clone)]
pub struct SensorBinding {
    pub sensor: Rc<dyn EndstopSensor>,
    pub name: String,
    pub axis: Axis,
}

impl SensorBinding {
    pub fn new(sensor: Rc<dyn EndstopSensor>, name: impl Into<String>, axis: Axis) -> Self {
        Self {
            sensor,
            name: name.into(),
            axis,
        }
    }
}

impl fmt::Debug for SensorBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorBinding")
            .field("name", &self.name)
            .field("axis", &self.axis)
            .field("actuators", &self.sensor.actuators())
            .finish()
    }
}

// ─── Actuator sample ────────────────────────────────────────────────

/// Step counters of one actuator over one homing move.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuatorSample {
    actuator: ActuatorId,
    sensor: String,
    start_pos: i64,
    halt_pos: Option<i64>,
    trig_pos: Option<i64>,
}

impl ActuatorSample {
    fn capture(ctx: &MachineContext, actuator: ActuatorId, sensor: &str) -> Self {
        let start_pos = ctx.kinematics.mcu_position(&actuator);
        Self {
            actuator,
            sensor: sensor.to_string(),
            start_pos,
            halt_pos: None,
            trig_pos: None,
        }
    }

    /// Record halt and trigger positions. Only the first call has effect.
    fn note_end(&mut self, ctx: &MachineContext, trigger_time: f64) {
        if self.halt_pos.is_some() {
            return;
        }
        self.halt_pos = Some(ctx.kinematics.mcu_position(&self.actuator));
        self.trig_pos = Some(ctx.kinematics.mcu_position_at(&self.actuator, trigger_time));
    }

    #[inline]
    pub fn actuator(&self) -> &str {
        &self.actuator
    }

    #[inline]
    pub fn sensor(&self) -> &str {
        &self.sensor
    }

    #[inline]
    pub const fn start_pos(&self) -> i64 {
        self.start_pos
    }

    #[inline]
    pub const fn halt_pos(&self) -> Option<i64> {
        self.halt_pos
    }

    #[inline]
    pub const fn trig_pos(&self) -> Option<i64> {
        self.trig_pos
    }

    fn halt_steps(&self) -> i64 {
        self.halt_pos.unwrap_or(self.start_pos) - self.start_pos
    }

    fn trig_steps(&self) -> i64 {
        self.trig_pos.unwrap_or(self.start_pos) - self.start_pos
    }

    fn overshoot_steps(&self) -> i64 {
        self.halt_pos.unwrap_or(self.start_pos) - self.trig_pos.unwrap_or(self.start_pos)
    }
}

// ─── Options and outcome ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveOptions {
    /// Resolve the position from trigger-time step counters (probing).
    pub resolve_at_trigger: bool,
    /// Fail with `TriggerMissing` when no sensor fires.
    pub require_trigger: bool,
    /// Level that counts as triggered.
    pub trigger_level: bool,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            resolve_at_trigger: false,
            require_trigger: true,
            trigger_level: true,
        }
    }
}

impl MoveOptions {
    pub const fn probe() -> Self {
        Self {
            resolve_at_trigger: true,
            require_trigger: true,
            trigger_level: true,
        }
    }

    /// First pass of a stall-detection home: pre-triggers are tolerated.
    pub const fn sensorless() -> Self {
        Self {
            resolve_at_trigger: false,
            require_trigger: false,
            trigger_level: true,
        }
    }
}

/// Resolved result of a successful move.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveOutcome {
    /// Position at the trigger instant.
    pub trigger_position: Coord,
    /// Position where motion actually halted; now the believed position.
    pub halt_position: Coord,
    pub trigger_times: BTreeMap<String, f64>,
    pub untriggered: Vec<String>,
}

// ─── Homing move ────────────────────────────────────────────────────

pub struct HomingMove {
    bindings: Vec<SensorBinding>,
    samples: Vec<ActuatorSample>,
    observers: ObserverList<MoveEvent>,
    trigger_times: BTreeMap<String, f64>,
    untriggered: Vec<String>,
    full_travel_no_trigger: bool,
    executed: bool,
}

impl HomingMove {
    pub fn new(bindings: Vec<SensorBinding>, observers: ObserverList<MoveEvent>) -> Self {
        Self {
            bindings,
            samples: Vec::new(),
            observers,
            trigger_times: BTreeMap::new(),
            untriggered: Vec::new(),
            full_travel_no_trigger: false,
            executed: false,
        }
    }

    #[inline]
    pub fn bindings(&self) -> &[SensorBinding] {
        &self.bindings
    }

    #[inline]
    pub fn samples(&self) -> &[ActuatorSample] {
        &self.samples
    }

    #[inline]
    pub const fn full_travel_no_trigger(&self) -> bool {
        self.full_travel_no_trigger
    }

    /// Step counter of each tracked actuator at its trigger instant.
    pub fn trigger_positions(&self) -> BTreeMap<ActuatorId, i64> {
        self.samples
            .iter()
            .filter_map(|s| s.trig_pos.map(|p| (s.actuator.clone(), p)))
            .collect()
    }

    /// Axis protected by the named sensor.
    pub fn axis_of(&self, sensor: &str) -> Option<Axis> {
        self.bindings
            .iter()
            .find(|b| b.name == sensor)
            .map(|b| b.axis)
    }

    /// Sensor poll interval for a planned move: move time divided by the
    /// largest per-actuator step count, or the idle rest time if nothing
    /// steps.
    pub fn poll_interval(
        ctx: &MachineContext,
        binding: &SensorBinding,
        target: &Coord,
        speed: f64,
    ) -> f64 {
        let start = ctx.motion.position();
        let move_t = xyz_distance(&start, target) / speed;
        let max_steps = binding
            .sensor
            .actuators()
            .iter()
            .map(|a| {
                (ctx.kinematics.steps_from_position(a, &start)
                    - ctx.kinematics.steps_from_position(a, target))
                .abs()
            })
            .fold(0.0_f64, f64::max);
        if max_steps <= 0.0 {
            return ENDSTOP_IDLE_REST_TIME;
        }
        move_t / max_steps
    }

    /// Drive toward `target` with every bound sensor armed.
    ///
    /// A move runs once; its samples stay available for
    /// [`check_no_movement`](Self::check_no_movement) afterwards. A second
    /// call is rejected without touching the machine.
    pub fn execute(
        &mut self,
        ctx: &mut MachineContext,
        target: Coord,
        speed: f64,
        opts: MoveOptions,
    ) -> HomingResult<MoveOutcome> {
        if self.executed {
            return Err(HomingError::InvalidCommand {
                reason: "homing move already executed".to_string(),
            });
        }
        self.executed = true;
        self.observers.notify(&MoveEvent::Begin {
            sensors: self.bindings.iter().map(|b| b.name.clone()).collect(),
        })?;

        ctx.motion.flush_pending_steps();
        let kin_spos = commanded_steps(ctx);

        self.samples = self
            .bindings
            .iter()
            .flat_map(|b| {
                b.sensor
                    .actuators()
                    .into_iter()
                    .map(move |a| (a, b.name.as_str()))
            })
            .map(|(a, name)| ActuatorSample::capture(ctx, a, name))
            .collect();

        let print_time = ctx.motion.last_move_time();
        let mut completions = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            let rest_time = Self::poll_interval(ctx, binding, &target, speed);
            debug!(sensor = %binding.name, rest_time, "arming endstop");
            completions.push(binding.sensor.arm(ArmRequest {
                start_time: print_time,
                sample_time: ENDSTOP_SAMPLE_TIME,
                sample_count: ENDSTOP_SAMPLE_COUNT,
                rest_time,
                triggered: opts.trigger_level,
            }));
        }
        let composite = CompositeTrigger::new(completions);
        ctx.motion.dwell(HOMING_START_DELAY);

        let mut error = ctx
            .motion
            .interruptible_move(target, speed, &composite)
            .err()
            .map(|e| match e {
                HomingError::MoveFailed { .. } => e,
                other => HomingError::MoveFailed {
                    reason: other.to_string(),
                },
            });

        let move_end = ctx.motion.last_move_time();
        self.trigger_times.clear();
        self.untriggered.clear();
        for binding in &self.bindings {
            match binding.sensor.wait_result(move_end) {
                TriggerOutcome::Triggered { time } => {
                    self.trigger_times.insert(binding.name.clone(), time);
                }
                TriggerOutcome::Timeout => {
                    error.get_or_insert(HomingError::CommunicationTimeout {
                        sensor: binding.name.clone(),
                    });
                    self.untriggered.push(binding.name.clone());
                }
                TriggerOutcome::NotTriggered => {
                    self.untriggered.push(binding.name.clone());
                }
            }
        }
        if opts.require_trigger && self.trigger_times.is_empty() {
            let sensor = self.untriggered.join(",");
            error.get_or_insert(HomingError::TriggerMissing { sensor });
        }

        ctx.motion.flush_pending_steps();
        for sample in &mut self.samples {
            let tt = self
                .trigger_times
                .get(&sample.sensor)
                .copied()
                .unwrap_or(move_end);
            sample.note_end(ctx, tt);
            trace!(
                actuator = %sample.actuator,
                start = sample.start_pos,
                halt = ?sample.halt_pos,
                trig = ?sample.trig_pos,
                "actuator sample"
            );
        }

        let (trigger_position, halt_position) = if opts.resolve_at_trigger {
            let trig_steps = self.step_offsets(ActuatorSample::trig_steps);
            let halt_steps = self.step_offsets(ActuatorSample::halt_steps);
            let trigpos = resolve_position(ctx, &kin_spos, &trig_steps);
            let haltpos = if trig_steps != halt_steps {
                resolve_position(ctx, &kin_spos, &halt_steps)
            } else {
                trigpos
            };
            (trigpos, haltpos)
        } else {
            let over_steps = self.step_offsets(ActuatorSample::overshoot_steps);
            let haltpos = if over_steps.values().any(|s| *s != 0.0) {
                // Commanded target is where the trigger happened; halt is
                // the overshoot past it.
                ctx.motion.set_position(target, AxisSet::empty());
                let halt_kin_spos = commanded_steps(ctx);
                resolve_position(ctx, &halt_kin_spos, &over_steps)
            } else {
                target
            };
            (target, haltpos)
        };
        ctx.motion.set_position(halt_position, AxisSet::empty());

        if let Err(e) = self.publish_end() {
            error.get_or_insert(e);
        }

        if let Some(e) = error {
            debug!("homing move failed: {e}");
            return Err(e);
        }
        Ok(MoveOutcome {
            trigger_position,
            halt_position,
            trigger_times: self.trigger_times.clone(),
            untriggered: self.untriggered.clone(),
        })
    }

    /// Name of the first sensor whose actuator registered no steps between
    /// move start and trigger.
    pub fn check_no_movement(&self) -> Option<&str> {
        self.samples
            .iter()
            .find(|s| s.trig_pos == Some(s.start_pos))
            .map(|s| s.sensor.as_str())
    }

    /// Flag the move as a full vertical travel without genuine trigger and
    /// re-publish the end notification.
    pub fn note_full_travel(&mut self) -> HomingResult<()> {
        self.full_travel_no_trigger = true;
        self.publish_end()
    }

    fn publish_end(&self) -> HomingResult<()> {
        self.observers.notify(&MoveEvent::End {
            trigger_times: self.trigger_times.clone(),
            untriggered: self.untriggered.clone(),
            full_travel_no_trigger: self.full_travel_no_trigger,
        })
    }

    fn step_offsets(&self, f: fn(&ActuatorSample) -> i64) -> StepMap {
        self.samples
            .iter()
            .map(|s| (s.actuator.clone(), f(s) as f64))
            .collect()
    }
}

/// Commanded step position of every actuator.
pub(crate) fn commanded_steps(ctx: &MachineContext) -> StepMap {
    ctx.kinematics
        .list_actuators()
        .into_iter()
        .map(|a| {
            let p = ctx.kinematics.commanded_step_position(&a);
            (a, p)
        })
        .collect()
}

/// Machine position from base step positions plus per-actuator offsets.
pub(crate) fn resolve_position(ctx: &MachineContext, base: &StepMap, offsets: &StepMap) -> Coord {
    let steps: StepMap = base
        .iter()
        .map(|(a, p)| (a.clone(), p + offsets.get(a).copied().unwrap_or(0.0)))
        .collect();
    ctx.position_from_steps(&steps)
}
