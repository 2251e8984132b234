//! Multi-pass home of one axis group.
//!
//! A session lives for one top-level home command. For each axis group it
//! runs a first pass, an optional retract-and-refine pass, detects stuck
//! sensors, tracks vertical travel and merges per-actuator adjustments
//! registered by rail observers.

use super::homing_move::{HomingMove, MoveOptions, SensorBinding, commanded_steps};
use crate::context::MachineContext;
use crate::events::{MoveEvent, ObserverList, RailsEvent};
use crate::safety::stop::{SafeStopSequence, StopProfile};
use plumb_common::axis::{ActuatorId, Axis, AxisSet, Coord, PartialCoord, fill_coord, xyz_distance};
use plumb_common::config::RailConfig;
use plumb_common::consts::SENSORLESS_SPEED_FACTOR;
use plumb_common::error::{HomingError, HomingResult};
use std::cell::RefCell;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

// ─── Rail ───────────────────────────────────────────────────────────

/// One homed axis with its endstop binding.
#[derive(Debug, Clone)]
pub struct Rail {
    axis: Axis,
    config: RailConfig,
    binding: SensorBinding,
}

impl Rail {
    pub fn new(ctx: &MachineContext, axis: Axis, config: &RailConfig) -> HomingResult<Self> {
        let sensor = ctx.sensor(&config.endstop)?;
        Ok(Self {
            axis,
            config: config.clone(),
            binding: SensorBinding::new(sensor, config.endstop.clone(), axis),
        })
    }

    #[inline]
    pub const fn axis(&self) -> Axis {
        self.axis
    }

    #[inline]
    pub fn config(&self) -> &RailConfig {
        &self.config
    }

    #[inline]
    pub fn binding(&self) -> &SensorBinding {
        &self.binding
    }

    /// Primary actuator (first configured).
    pub fn primary_actuator(&self) -> Option<&str> {
        self.config.actuators.first().map(String::as_str)
    }
}

/// Retract target and the believed start of the refine pass.
///
/// The retract covers `min(1, retract_dist / |move|)` of the first-pass
/// vector, so it never reaches back past the forced start.
pub fn retract_geometry(start: &Coord, home: &Coord, retract_dist: f64) -> (Coord, Coord) {
    let mut axes_d = [0.0; 4];
    for (d, (h, s)) in axes_d.iter_mut().zip(home.iter().zip(start.iter())) {
        *d = h - s;
    }
    let move_d = xyz_distance(home, start);
    let ratio = if move_d > 0.0 {
        (retract_dist / move_d).min(1.0)
    } else {
        1.0
    };
    let mut retract = *home;
    let mut refine_start = *home;
    for i in 0..4 {
        retract[i] = home[i] - axes_d[i] * ratio;
        refine_start[i] = retract[i] - axes_d[i] * ratio;
    }
    (retract, refine_start)
}

// ─── Session ────────────────────────────────────────────────────────

pub struct HomingSession {
    axes: AxisSet,
    trigger_positions: BTreeMap<ActuatorId, i64>,
    position_adjustments: BTreeMap<ActuatorId, f64>,
    sensorless: bool,
    cumulative_z_travel: f64,
    full_travel_no_trigger: bool,
    alignment_ran: bool,
    move_observers: ObserverList<MoveEvent>,
    rails_observers: ObserverList<RailsEvent>,
}

impl HomingSession {
    pub fn new(axes: AxisSet) -> HomingResult<Self> {
        if axes.is_empty() {
            return Err(HomingError::InvalidCommand {
                reason: "homing session needs at least one axis".to_string(),
            });
        }
        Ok(Self {
            axes,
            trigger_positions: BTreeMap::new(),
            position_adjustments: BTreeMap::new(),
            sensorless: false,
            cumulative_z_travel: 0.0,
            full_travel_no_trigger: false,
            alignment_ran: false,
            move_observers: ObserverList::new(),
            rails_observers: ObserverList::new(),
        })
    }

    #[inline]
    pub const fn axes(&self) -> AxisSet {
        self.axes
    }

    pub fn set_axes(&mut self, axes: AxisSet) -> HomingResult<()> {
        if axes.is_empty() {
            return Err(HomingError::InvalidCommand {
                reason: "homing session needs at least one axis".to_string(),
            });
        }
        self.axes = axes;
        Ok(())
    }

    /// Stall-detection mode: first pass at 4x speed, missing trigger tolerated.
    pub fn set_sensorless(&mut self, enabled: bool) {
        self.sensorless = enabled;
    }

    #[inline]
    pub const fn is_sensorless(&self) -> bool {
        self.sensorless
    }

    /// Net travel of the primary vertical actuator over the last group home [mm].
    #[inline]
    pub const fn cumulative_z_travel(&self) -> f64 {
        self.cumulative_z_travel
    }

    /// Set when a vertical pass ran without a genuine trigger.
    #[inline]
    pub const fn full_travel_no_trigger(&self) -> bool {
        self.full_travel_no_trigger
    }

    /// Dual-screw alignment already ran for this command.
    #[inline]
    pub const fn alignment_ran(&self) -> bool {
        self.alignment_ran
    }

    pub fn mark_aligned(&mut self) {
        self.alignment_ran = true;
    }

    pub fn trigger_position(&self, actuator: &str) -> Option<i64> {
        self.trigger_positions.get(actuator).copied()
    }

    pub fn position_adjustments(&self) -> &BTreeMap<ActuatorId, f64> {
        &self.position_adjustments
    }

    pub fn move_observers_mut(&mut self) -> &mut ObserverList<MoveEvent> {
        &mut self.move_observers
    }

    pub fn rails_observers_mut(&mut self) -> &mut ObserverList<RailsEvent> {
        &mut self.rails_observers
    }

    /// Home `rails` as one group.
    ///
    /// `forced` is asserted as the believed position for the homed axes
    /// before moving toward `target`.
    pub fn home_axis_group(
        &mut self,
        ctx: &mut MachineContext,
        rails: &[&Rail],
        forced: PartialCoord,
        target: PartialCoord,
    ) -> HomingResult<()> {
        let Some(lead) = rails.first() else {
            return Err(HomingError::InvalidCommand {
                reason: "no rails to home".to_string(),
            });
        };
        let homing_axes: AxisSet = (0..3)
            .filter(|i| forced[*i].is_some())
            .filter_map(Axis::from_index)
            .collect();

        self.rails_observers.notify(&RailsEvent::Begin { axes: homing_axes })?;

        let start = fill_coord(&ctx.motion.position(), &forced);
        let home = fill_coord(&ctx.motion.position(), &target);
        ctx.motion.set_position(start, homing_axes);

        let bindings: Vec<SensorBinding> = rails.iter().map(|r| r.binding.clone()).collect();
        let hi = lead.config();
        info!(
            axes = ?homing_axes,
            sensorless = self.sensorless,
            "homing {} from {:.3} toward {:.3}",
            lead.axis(),
            start[lead.axis().index()],
            home[lead.axis().index()]
        );

        let vertical = rails
            .iter()
            .find(|r| r.axis().is_vertical())
            .and_then(|r| r.primary_actuator())
            .map(|a| {
                (
                    a.to_string(),
                    ctx.kinematics.mcu_position(a),
                    ctx.kinematics.step_distance(a),
                )
            });

        // First pass.
        let mut hmove = HomingMove::new(bindings.clone(), self.move_observers.clone());
        let first = if self.sensorless {
            hmove.execute(
                ctx,
                home,
                hi.homing_speed * SENSORLESS_SPEED_FACTOR,
                MoveOptions::sensorless(),
            )?
        } else {
            hmove.execute(ctx, home, hi.homing_speed, MoveOptions::default())?
        };
        if first
            .untriggered
            .iter()
            .any(|s| hmove.axis_of(s).is_some_and(Axis::is_vertical))
            && first.trigger_times.is_empty()
        {
            warn!("vertical first pass finished without trigger");
            self.full_travel_no_trigger = true;
        }

        // Retract and refine.
        if hi.homing_retract_dist > 0.0 {
            let start = fill_coord(&ctx.motion.position(), &forced);
            let home = fill_coord(&ctx.motion.position(), &target);
            let (retract, refine_start) = retract_geometry(&start, &home, hi.homing_retract_dist);
            debug!(
                "retract to {:.3} at {} mm/s",
                retract[lead.axis().index()],
                hi.homing_retract_speed
            );
            ctx.motion.commanded_move(retract, hi.homing_retract_speed)?;
            ctx.motion.set_position(refine_start, AxisSet::empty());

            hmove = HomingMove::new(bindings, self.move_observers.clone());
            hmove.execute(ctx, home, hi.second_speed(), MoveOptions::default())?;

            if let Some(sensor) = hmove.check_no_movement().map(str::to_string) {
                let axis = hmove.axis_of(&sensor).unwrap_or(lead.axis());
                if axis.is_vertical() {
                    warn!(sensor = %sensor, "vertical endstop reported no movement, full travel assumed");
                    self.full_travel_no_trigger = true;
                    hmove.note_full_travel()?;
                } else {
                    self.record_z_travel(ctx, vertical.as_ref());
                    error!(sensor = %sensor, "endstop still triggered after retract, emergency stop");
                    let actuators: Vec<ActuatorId> =
                        rails.iter().flat_map(|r| r.config().actuators.clone()).collect();
                    if let Err(e) =
                        SafeStopSequence::new(StopProfile::Emergency { actuators }).execute(ctx)
                    {
                        error!("emergency stop sequence incomplete: {e}");
                    }
                    return Err(HomingError::SpuriousTriggerAfterRetract { sensor });
                }
            }
        }
        self.record_z_travel(ctx, vertical.as_ref());

        ctx.motion.flush_pending_steps();
        self.trigger_positions = hmove.trigger_positions();
        self.position_adjustments.clear();

        let end = RailsEvent::End {
            axes: homing_axes,
            trigger_positions: self.trigger_positions.clone(),
            adjustments: RefCell::new(BTreeMap::new()),
        };
        self.rails_observers.notify(&end)?;
        if let RailsEvent::End { adjustments, .. } = end {
            self.position_adjustments = adjustments.into_inner();
        }

        if self.position_adjustments.values().any(|v| *v != 0.0) {
            let mut homepos = ctx.motion.position();
            let mut steps = commanded_steps(ctx);
            for (a, adj) in &self.position_adjustments {
                if let Some(p) = steps.get_mut(a) {
                    *p += adj;
                }
            }
            let newpos = ctx.position_from_steps(&steps);
            for axis in homing_axes.axes() {
                homepos[axis.index()] = newpos[axis.index()];
            }
            debug!(adjustments = ?self.position_adjustments, "applying actuator adjustments");
            ctx.motion.set_position(homepos, AxisSet::empty());
        }

        info!("homed {} at {:.4}", lead.axis(), ctx.motion.position()[lead.axis().index()]);
        Ok(())
    }

    fn record_z_travel(&mut self, ctx: &MachineContext, vertical: Option<&(String, i64, f64)>) {
        if let Some((actuator, start, step_distance)) = vertical {
            let now = ctx.kinematics.mcu_position(actuator);
            self.cumulative_z_travel = (start - now).abs() as f64 * step_distance;
            debug!(
                actuator = %actuator,
                travel = self.cumulative_z_travel,
                "vertical travel recorded"
            );
        }
    }
}
