//! Physical model behind the simulation backend.
//!
//! The physical frame equals the machine frame: an endstop configured at
//! `position_endstop` trips when its watched actuator physically crosses
//! that coordinate, wherever the host believes it is.

use crate::context::{DriveStage, TriggerCompletion, TriggerOutcome};
use plumb_common::align::{AlignMotion, AlignRequest, AlignmentStatus};
use plumb_common::axis::{ActuatorId, Axis, AxisSet, Coord, xyz_distance};
use plumb_common::config::MachineConfig;
use plumb_common::error::{HomingError, HomingResult};
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, trace};

/// Default controller clock [Hz].
pub const SIM_CLOCK_HZ: f64 = 16_000_000.0;

/// Steps an actuator keeps moving after a trigger before it halts.
pub const SIM_OVERSHOOT_STEPS: f64 = 3.0;

/// Logical name of the simulated bed probe. It trips at bed level, Z = 0.
pub const SIM_PROBE: &str = "probe";

/// Everything the simulated machine did, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    SetPosition { pos: Coord, homed: AxisSet },
    MarkUnhomed(AxisSet),
    Move { target: Coord, speed: f64 },
    HomingMove { target: Coord, speed: f64, triggered: Option<String> },
    Dwell(f64),
    Armed { sensor: String, rest_time: f64 },
    DriveEnabled { stage: DriveStage, enabled: bool },
    HoldAndFlush,
    QueryProtection,
    FaultReportMode(Vec<ActuatorId>),
    Synchronize,
    AlignSent { motion: AlignMotion, request: AlignRequest },
    Remap(bool),
    MeshCleared,
}

impl SimEvent {
    /// True for events that physically move an actuator.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            Self::Move { .. } | Self::HomingMove { .. } | Self::AlignSent { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct SimActuator {
    pub axis: Axis,
    pub step_distance: f64,
    /// Controller step counter.
    pub mcu: i64,
    /// Physical position [mm].
    pub phys: f64,
}

#[derive(Debug)]
pub struct SimEndstop {
    pub actuators: Vec<ActuatorId>,
    /// Actuator whose physical position trips the sensor.
    pub watch: ActuatorId,
    pub trip_at: f64,
    /// Trips when `phys >= trip_at` (else `phys <= trip_at`).
    pub trips_above: bool,
    /// Reads triggered regardless of position.
    pub stuck: bool,
    /// Never trips.
    pub dead: bool,
    /// Never answers when armed.
    pub unresponsive: bool,
    armed: Option<Rc<TriggerCompletion>>,
}

impl SimEndstop {
    fn new(actuators: Vec<ActuatorId>, watch: ActuatorId, trip_at: f64, trips_above: bool) -> Self {
        Self {
            actuators,
            watch,
            trip_at,
            trips_above,
            stuck: false,
            dead: false,
            unresponsive: false,
            armed: None,
        }
    }

    fn tripped_at(&self, phys: f64) -> bool {
        if self.trips_above {
            phys >= self.trip_at
        } else {
            phys <= self.trip_at
        }
    }

    /// Fraction of a move from `p0` by `dp` at which the sensor trips.
    fn trip_fraction(&self, p0: f64, dp: f64) -> Option<f64> {
        if self.stuck || self.tripped_at(p0) {
            return Some(0.0);
        }
        let crossing = if self.trips_above {
            dp > 0.0 && p0 + dp >= self.trip_at
        } else {
            dp < 0.0 && p0 + dp <= self.trip_at
        };
        crossing.then(|| ((self.trip_at - p0) / dp).clamp(0.0, 1.0))
    }
}

/// Scripted controller-side alignment loop.
#[derive(Debug)]
pub struct SimAligner {
    pub clock_hz: f64,
    /// deltaError reported per attempt; the last value repeats.
    pub deltas: VecDeque<i32>,
    /// Controller time needed to finish one attempt [s].
    pub completion_delay: f64,
    /// Never set the done flag.
    pub never_complete: bool,
    sent_at: Option<f64>,
    current: i32,
}

impl Default for SimAligner {
    fn default() -> Self {
        Self {
            clock_hz: SIM_CLOCK_HZ,
            deltas: VecDeque::from([0]),
            completion_delay: 2.0,
            never_complete: false,
            sent_at: None,
            current: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct MoveTrace {
    start_time: f64,
    end_time: f64,
    start_mcu: BTreeMap<ActuatorId, i64>,
    end_mcu: BTreeMap<ActuatorId, i64>,
}

/// Shared state of the simulated machine.
#[derive(Debug)]
pub struct SimWorld {
    pub clock: f64,
    pub position: Coord,
    pub homed: AxisSet,
    pub actuators: BTreeMap<ActuatorId, SimActuator>,
    /// Primary actuator per axis, used for the forward kinematic solution.
    pub primary: [ActuatorId; 3],
    pub endstops: BTreeMap<String, SimEndstop>,
    pub aligner: SimAligner,
    /// Physical coordinate the alignment loop brings both screws to.
    pub align_reference: f64,
    pub shutdown: bool,
    pub leveling_active: bool,
    pub remap_revert_fails: bool,
    pub drives: BTreeMap<&'static str, bool>,
    pub events: Vec<SimEvent>,
    last_move: Option<MoveTrace>,
}

impl SimWorld {
    pub fn new(config: &MachineConfig) -> Self {
        let mut actuators = BTreeMap::new();
        let mut endstops = BTreeMap::new();
        let mut primary: [ActuatorId; 3] = Default::default();

        for axis in Axis::ALL {
            let rail = config.rail(axis);
            for name in &rail.actuators {
                actuators.insert(
                    name.clone(),
                    SimActuator {
                        axis,
                        step_distance: rail.step_distance,
                        mcu: 0,
                        phys: rail.center(),
                    },
                );
            }
            let lead = rail.actuators.first().cloned().unwrap_or_default();
            endstops.insert(
                rail.endstop.clone(),
                SimEndstop::new(
                    rail.actuators.clone(),
                    lead.clone(),
                    rail.position_endstop,
                    rail.homing_positive_dir,
                ),
            );
            primary[axis.index()] = lead;
        }

        let z = config.rail(Axis::Z);
        let z_lead = primary[Axis::Z.index()].clone();
        endstops.insert(
            SIM_PROBE.to_string(),
            SimEndstop::new(vec![z_lead.clone()], z_lead, 0.0, false),
        );
        if let Some(align) = &config.z_align {
            for (sensor, screw) in align.screw_sensors.iter().zip(z.actuators.iter()) {
                endstops.insert(
                    sensor.clone(),
                    SimEndstop::new(vec![screw.clone()], screw.clone(), z.position_max, true),
                );
            }
        }

        Self {
            clock: 0.0,
            position: [0.0; 4],
            homed: AxisSet::empty(),
            actuators,
            primary,
            endstops,
            aligner: SimAligner::default(),
            align_reference: z.position_max,
            shutdown: false,
            leveling_active: false,
            remap_revert_fails: false,
            drives: BTreeMap::new(),
            events: Vec::new(),
            last_move: None,
        }
    }

    fn mcu_snapshot(&self) -> BTreeMap<ActuatorId, i64> {
        self.actuators
            .iter()
            .map(|(n, a)| (n.clone(), a.mcu))
            .collect()
    }

    /// Apply `fraction` of the believed move `from → to` to every actuator.
    fn step_actuators(&mut self, from: &Coord, to: &Coord, fraction: f64) {
        for act in self.actuators.values_mut() {
            let i = act.axis.index();
            let d = (to[i] - from[i]) * fraction;
            act.phys += d;
            act.mcu += (d / act.step_distance).round() as i64;
        }
    }

    fn record_trace(&mut self, start_time: f64, end_time: f64, start_mcu: BTreeMap<ActuatorId, i64>) {
        self.last_move = Some(MoveTrace {
            start_time,
            end_time,
            start_mcu,
            end_mcu: self.mcu_snapshot(),
        });
    }

    pub fn commanded_move(&mut self, target: Coord, speed: f64) -> HomingResult<()> {
        if speed <= 0.0 {
            return Err(HomingError::MoveFailed {
                reason: format!("invalid speed {speed}"),
            });
        }
        let from = self.position;
        let duration = xyz_distance(&from, &target) / speed;
        let start_mcu = self.mcu_snapshot();
        let start_time = self.clock;
        self.step_actuators(&from, &target, 1.0);
        self.clock += duration;
        self.record_trace(start_time, self.clock, start_mcu);
        self.position = target;
        self.events.push(SimEvent::Move { target, speed });
        Ok(())
    }

    pub fn interruptible_move(&mut self, target: Coord, speed: f64) -> HomingResult<()> {
        if speed <= 0.0 {
            return Err(HomingError::MoveFailed {
                reason: format!("invalid speed {speed}"),
            });
        }
        let from = self.position;
        let duration = xyz_distance(&from, &target) / speed;

        // Earliest trip among armed sensors.
        let mut first: Option<(f64, Vec<String>)> = None;
        for (name, es) in &self.endstops {
            if es.armed.is_none() {
                continue;
            }
            let frac = if es.unresponsive || es.dead {
                None
            } else {
                self.actuators.get(&es.watch).and_then(|a| {
                    let dp = target[a.axis.index()] - from[a.axis.index()];
                    es.trip_fraction(a.phys, dp)
                })
            };
            let Some(f) = frac else {
                continue;
            };
            let earlier = first.as_ref().is_none_or(|(best, _)| f < *best - 1e-12);
            if earlier {
                first = Some((f, vec![name.clone()]));
            } else if let Some((best, names)) = first.as_mut() {
                if (f - *best).abs() < 1e-12 {
                    names.push(name.clone());
                }
            }
        }

        let max_steps = self
            .actuators
            .values()
            .map(|a| ((target[a.axis.index()] - from[a.axis.index()]) / a.step_distance).abs())
            .fold(0.0_f64, f64::max);
        let (trig_frac, halt_frac) = match &first {
            Some((f, _)) if max_steps > 0.0 => (*f, (*f + SIM_OVERSHOOT_STEPS / max_steps).min(1.0)),
            Some((f, _)) => (*f, *f),
            None => (1.0, 1.0),
        };

        let start_time = self.clock;
        let start_mcu = self.mcu_snapshot();
        self.step_actuators(&from, &target, halt_frac);
        self.clock = start_time + duration * halt_frac;
        self.record_trace(start_time, self.clock, start_mcu);
        self.position = target;

        let trigger_time = start_time + duration * trig_frac;
        let triggered = first.as_ref().map(|(_, names)| names.clone()).unwrap_or_default();
        for (name, es) in &mut self.endstops {
            if let Some(c) = &es.armed {
                if es.unresponsive {
                    c.complete(TriggerOutcome::Timeout);
                } else if triggered.contains(name) {
                    c.complete(TriggerOutcome::Triggered { time: trigger_time });
                } else {
                    c.complete(TriggerOutcome::NotTriggered);
                }
            }
        }
        debug!(
            ?target,
            triggered = ?triggered,
            trig_frac,
            halt_frac,
            "sim homing move"
        );
        self.events.push(SimEvent::HomingMove {
            target,
            speed,
            triggered: triggered.first().cloned(),
        });
        Ok(())
    }

    pub fn arm(&mut self, sensor: &str, rest_time: f64) -> Rc<TriggerCompletion> {
        let completion = TriggerCompletion::new();
        if let Some(es) = self.endstops.get_mut(sensor) {
            es.armed = Some(completion.clone());
        }
        self.events.push(SimEvent::Armed {
            sensor: sensor.to_string(),
            rest_time,
        });
        completion
    }

    /// Controller wait result for an armed sensor: trigger time, `-1.0` on
    /// timeout, `0.0` when the move completed without a trigger.
    pub fn wait_raw(&mut self, sensor: &str) -> f64 {
        let outcome = self
            .endstops
            .get_mut(sensor)
            .and_then(|es| es.armed.take())
            .and_then(|c| c.outcome());
        match outcome {
            Some(TriggerOutcome::Triggered { time }) => time,
            Some(TriggerOutcome::Timeout) => -1.0,
            Some(TriggerOutcome::NotTriggered) | None => 0.0,
        }
    }

    pub fn is_triggered(&self, sensor: &str) -> bool {
        self.endstops.get(sensor).is_some_and(|es| {
            !es.dead
                && (es.stuck
                    || self
                    .actuators
                    .get(&es.watch)
                    .is_some_and(|a| es.tripped_at(a.phys)))
        })
    }

    pub fn mcu_position_at(&self, actuator: &str, time: f64) -> i64 {
        let now = self.actuators.get(actuator).map(|a| a.mcu).unwrap_or(0);
        let Some(trace) = &self.last_move else {
            return now;
        };
        let (Some(s), Some(e)) = (trace.start_mcu.get(actuator), trace.end_mcu.get(actuator)) else {
            return now;
        };
        if time <= trace.start_time {
            return *s;
        }
        if time >= trace.end_time || trace.end_time <= trace.start_time {
            return *e;
        }
        let f = (time - trace.start_time) / (trace.end_time - trace.start_time);
        s + ((e - s) as f64 * f).round() as i64
    }

    pub fn set_position(&mut self, pos: Coord, homed: AxisSet) {
        self.position = pos;
        self.homed |= homed;
        trace!(?pos, ?homed, "sim set position");
        self.events.push(SimEvent::SetPosition { pos, homed });
    }

    // ─── Alignment controller ───────────────────────────────────────

    pub fn align_send(&mut self, motion: AlignMotion, request: AlignRequest) {
        self.aligner.current = if self.aligner.deltas.len() > 1 {
            self.aligner.deltas.pop_front().unwrap_or(0)
        } else {
            self.aligner.deltas.front().copied().unwrap_or(0)
        };
        self.aligner.sent_at = Some(self.clock);
        self.events.push(SimEvent::AlignSent { motion, request });

        if !self.aligner.never_complete {
            let reference = self.align_reference;
            for act in self.actuators.values_mut() {
                if act.axis.is_vertical() {
                    let d = reference - act.phys;
                    act.phys = reference;
                    act.mcu += (d / act.step_distance).round() as i64;
                }
            }
        }
    }

    pub fn align_status(&self) -> AlignmentStatus {
        match self.aligner.sent_at {
            Some(t) if !self.aligner.never_complete && self.clock >= t + self.aligner.completion_delay => {
                AlignmentStatus {
                    done: true,
                    delta_error: self.aligner.current,
                }
            }
            _ => AlignmentStatus::default(),
        }
    }

    pub fn stage_enabled(&self, stage: DriveStage) -> Option<bool> {
        self.drives.get(stage_key(stage)).copied()
    }

    pub fn set_stage(&mut self, stage: DriveStage, enabled: bool) {
        match stage {
            DriveStage::All => {
                for key in ["horizontal", "vertical"] {
                    self.drives.insert(key, enabled);
                }
            }
            other => {
                self.drives.insert(stage_key(other), enabled);
            }
        }
        self.events.push(SimEvent::DriveEnabled { stage, enabled });
    }
}

fn stage_key(stage: DriveStage) -> &'static str {
    match stage {
        DriveStage::All | DriveStage::Horizontal => "horizontal",
        DriveStage::Vertical => "vertical",
    }
}
