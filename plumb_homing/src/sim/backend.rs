//! Collaborator handles over a shared [`SimWorld`].
//!
//! Every handle holds the same `Rc<RefCell<SimWorld>>`; none keeps a
//! borrow across calls, so handles can be used in any order.

use super::world::{SimEvent, SimWorld};
use crate::context::{
    AlignController, ArmRequest, CompositeTrigger, DriveControl, DriveStage, EndstopSensor,
    IoRemap, Kinematics, LevelingState, MachineContext, MachineStatus, MotionExecutor, Reactor,
    StepMap, TriggerCompletion, TriggerOutcome,
};
use plumb_common::align::{AlignMotion, AlignRequest, AlignmentStatus};
use plumb_common::axis::{ActuatorId, Axis, AxisSet, Coord};
use plumb_common::config::MachineConfig;
use plumb_common::error::{HomingError, HomingResult};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::{debug, info};

type Shared = Rc<RefCell<SimWorld>>;

// ─── Machine ────────────────────────────────────────────────────────

/// Simulated machine built from a [`MachineConfig`].
#[derive(Debug, Clone)]
pub struct SimMachine {
    world: Shared,
    with_controller: bool,
    with_remap: bool,
}

impl SimMachine {
    pub fn new(config: &MachineConfig) -> Self {
        info!(service = %config.shared.service_name, "simulated machine created");
        Self {
            world: Rc::new(RefCell::new(SimWorld::new(config))),
            with_controller: config.z_align.is_some(),
            with_remap: config.io_remap.is_some(),
        }
    }

    /// Read access to the physical model.
    pub fn world(&self) -> Ref<'_, SimWorld> {
        self.world.borrow()
    }

    /// Write access for fault injection and scripting.
    pub fn world_mut(&self) -> RefMut<'_, SimWorld> {
        self.world.borrow_mut()
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<SimEvent> {
        self.world.borrow().events.clone()
    }

    pub fn clear_events(&self) {
        self.world.borrow_mut().events.clear();
    }

    /// Physical position of one actuator [mm].
    pub fn physical(&self, actuator: &str) -> Option<f64> {
        self.world.borrow().actuators.get(actuator).map(|a| a.phys)
    }

    pub fn set_stuck(&self, sensor: &str, stuck: bool) {
        if let Some(es) = self.world.borrow_mut().endstops.get_mut(sensor) {
            es.stuck = stuck;
        }
    }

    pub fn set_dead(&self, sensor: &str, dead: bool) {
        if let Some(es) = self.world.borrow_mut().endstops.get_mut(sensor) {
            es.dead = dead;
        }
    }

    pub fn set_unresponsive(&self, sensor: &str, unresponsive: bool) {
        if let Some(es) = self.world.borrow_mut().endstops.get_mut(sensor) {
            es.unresponsive = unresponsive;
        }
    }

    /// Script the deltaError reported per alignment attempt.
    pub fn script_alignment(&self, deltas: &[i32]) {
        let mut w = self.world.borrow_mut();
        w.aligner.deltas = deltas.iter().copied().collect();
        if w.aligner.deltas.is_empty() {
            w.aligner.deltas.push_back(0);
        }
    }

    pub fn set_alignment_hangs(&self, hangs: bool) {
        self.world.borrow_mut().aligner.never_complete = hangs;
    }

    pub fn set_shutdown(&self, shutdown: bool) {
        self.world.borrow_mut().shutdown = shutdown;
    }

    pub fn set_leveling_active(&self, active: bool) {
        self.world.borrow_mut().leveling_active = active;
    }

    /// Place one actuator at a physical coordinate.
    pub fn place(&self, actuator: &str, phys: f64) {
        if let Some(a) = self.world.borrow_mut().actuators.get_mut(actuator) {
            a.phys = phys;
        }
    }

    /// Injected collaborators for the homing core.
    pub fn context(&self) -> MachineContext {
        let sensors: BTreeMap<String, Rc<dyn EndstopSensor>> = self
            .world
            .borrow()
            .endstops
            .keys()
            .map(|name| {
                let sensor: Rc<dyn EndstopSensor> = Rc::new(SimSensor {
                    world: self.world.clone(),
                    name: name.clone(),
                });
                (name.clone(), sensor)
            })
            .collect();
        debug!(sensors = sensors.len(), "building simulated machine context");

        MachineContext {
            motion: Box::new(SimMotion(self.world.clone())),
            kinematics: Box::new(SimKinematics(self.world.clone())),
            sensors,
            controller: self
                .with_controller
                .then(|| Box::new(SimController(self.world.clone())) as Box<dyn AlignController>),
            drives: Box::new(SimDrives(self.world.clone())),
            reactor: Box::new(SimReactor(self.world.clone())),
            status: Box::new(SimStatus(self.world.clone())),
            leveling: Box::new(SimLeveling(self.world.clone())),
            io_remap: self
                .with_remap
                .then(|| Box::new(SimRemap(self.world.clone())) as Box<dyn IoRemap>),
        }
    }
}

// ─── Sensors ────────────────────────────────────────────────────────

struct SimSensor {
    world: Shared,
    name: String,
}

impl EndstopSensor for SimSensor {
    fn actuators(&self) -> Vec<ActuatorId> {
        self.world
            .borrow()
            .endstops
            .get(&self.name)
            .map(|es| es.actuators.clone())
            .unwrap_or_default()
    }

    fn arm(&self, request: ArmRequest) -> Rc<TriggerCompletion> {
        self.world.borrow_mut().arm(&self.name, request.rest_time)
    }

    fn wait_result(&self, _deadline: f64) -> TriggerOutcome {
        TriggerOutcome::from_raw(self.world.borrow_mut().wait_raw(&self.name))
    }

    fn is_triggered(&self) -> bool {
        self.world.borrow().is_triggered(&self.name)
    }
}

// ─── Motion and kinematics ──────────────────────────────────────────

struct SimMotion(Shared);

impl MotionExecutor for SimMotion {
    fn position(&self) -> Coord {
        self.0.borrow().position
    }

    fn set_position(&mut self, pos: Coord, homing_axes: AxisSet) {
        self.0.borrow_mut().set_position(pos, homing_axes);
    }

    fn mark_unhomed(&mut self, axes: AxisSet) {
        let mut w = self.0.borrow_mut();
        w.homed.remove(axes);
        w.events.push(SimEvent::MarkUnhomed(axes));
    }

    fn commanded_move(&mut self, pos: Coord, speed: f64) -> HomingResult<()> {
        self.0.borrow_mut().commanded_move(pos, speed)
    }

    fn interruptible_move(
        &mut self,
        pos: Coord,
        speed: f64,
        _stop_on: &CompositeTrigger,
    ) -> HomingResult<()> {
        self.0.borrow_mut().interruptible_move(pos, speed)
    }

    fn flush_pending_steps(&mut self) {}

    fn last_move_time(&self) -> f64 {
        self.0.borrow().clock
    }

    fn dwell(&mut self, seconds: f64) {
        let mut w = self.0.borrow_mut();
        w.clock += seconds;
        w.events.push(SimEvent::Dwell(seconds));
    }
}

struct SimKinematics(Shared);

impl SimKinematics {
    fn axis_and_step(&self, actuator: &str) -> Option<(Axis, f64)> {
        self.0
            .borrow()
            .actuators
            .get(actuator)
            .map(|a| (a.axis, a.step_distance))
    }
}

impl Kinematics for SimKinematics {
    fn list_actuators(&self) -> Vec<ActuatorId> {
        self.0.borrow().actuators.keys().cloned().collect()
    }

    fn step_distance(&self, actuator: &str) -> f64 {
        self.axis_and_step(actuator).map_or(0.0, |(_, sd)| sd)
    }

    fn mcu_position(&self, actuator: &str) -> i64 {
        self.0
            .borrow()
            .actuators
            .get(actuator)
            .map_or(0, |a| a.mcu)
    }

    fn mcu_position_at(&self, actuator: &str, time: f64) -> i64 {
        self.0.borrow().mcu_position_at(actuator, time)
    }

    fn commanded_step_position(&self, actuator: &str) -> f64 {
        let pos = self.0.borrow().position;
        self.steps_from_position(actuator, &pos)
    }

    fn steps_from_position(&self, actuator: &str, pos: &Coord) -> f64 {
        match self.axis_and_step(actuator) {
            Some((axis, sd)) if sd > 0.0 => pos[axis.index()] / sd,
            _ => 0.0,
        }
    }

    fn position_from_steps(&self, steps: &StepMap) -> Coord {
        let w = self.0.borrow();
        let mut pos = [0.0; 4];
        for axis in Axis::ALL {
            let primary = &w.primary[axis.index()];
            if let (Some(s), Some(a)) = (steps.get(primary), w.actuators.get(primary)) {
                pos[axis.index()] = s * a.step_distance;
            }
        }
        pos
    }
}

// ─── Alignment controller ───────────────────────────────────────────

struct SimController(Shared);

impl AlignController for SimController {
    fn clock_frequency(&self) -> f64 {
        self.0.borrow().aligner.clock_hz
    }

    fn send(&mut self, motion: AlignMotion, request: AlignRequest) -> HomingResult<()> {
        if self.0.borrow().shutdown {
            return Err(HomingError::Controller {
                reason: "controller is shut down".to_string(),
            });
        }
        self.0.borrow_mut().align_send(motion, request);
        Ok(())
    }

    fn status(&self) -> AlignmentStatus {
        self.0.borrow().align_status()
    }
}

// ─── Drives, clock and status ───────────────────────────────────────

struct SimDrives(Shared);

impl DriveControl for SimDrives {
    fn set_enabled(&mut self, stage: DriveStage, enabled: bool) -> HomingResult<()> {
        self.0.borrow_mut().set_stage(stage, enabled);
        Ok(())
    }

    fn hold_and_flush(&mut self) -> HomingResult<()> {
        self.0.borrow_mut().events.push(SimEvent::HoldAndFlush);
        Ok(())
    }

    fn query_protection(&mut self) -> HomingResult<()> {
        self.0.borrow_mut().events.push(SimEvent::QueryProtection);
        Ok(())
    }

    fn set_fault_report_mode(&mut self, actuators: &[ActuatorId]) -> HomingResult<()> {
        self.0
            .borrow_mut()
            .events
            .push(SimEvent::FaultReportMode(actuators.to_vec()));
        Ok(())
    }

    fn synchronize_actuators(&mut self) -> HomingResult<()> {
        self.0.borrow_mut().events.push(SimEvent::Synchronize);
        Ok(())
    }
}

struct SimReactor(Shared);

impl Reactor for SimReactor {
    fn monotonic(&self) -> f64 {
        self.0.borrow().clock
    }

    fn pause_until(&mut self, t: f64) {
        let mut w = self.0.borrow_mut();
        w.clock = w.clock.max(t);
    }
}

struct SimStatus(Shared);

impl MachineStatus for SimStatus {
    fn is_shutdown(&self) -> bool {
        self.0.borrow().shutdown
    }
}

struct SimLeveling(Shared);

impl LevelingState for SimLeveling {
    fn is_active(&self) -> bool {
        self.0.borrow().leveling_active
    }

    fn clear_mesh(&mut self) {
        self.0.borrow_mut().events.push(SimEvent::MeshCleared);
    }
}

struct SimRemap(Shared);

impl IoRemap for SimRemap {
    fn set_remap(&mut self, enabled: bool) -> HomingResult<()> {
        let mut w = self.0.borrow_mut();
        if !enabled && w.remap_revert_fails {
            return Err(HomingError::Controller {
                reason: "io remap revert rejected".to_string(),
            });
        }
        w.events.push(SimEvent::Remap(enabled));
        Ok(())
    }
}
