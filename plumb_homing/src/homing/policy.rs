//! Command-level homing policy.
//!
//! Decides axis order and per-axis strategy, engages the IO remap around
//! one horizontal axis, gates the vertical home behind dual-screw
//! alignment, persists the measured top-of-travel, and wraps every fault:
//! shutdown-attributed when the machine is already down, otherwise the
//! affected drive stage is de-energized before re-raising.

use super::homing_move::{HomingMove, MoveOptions, SensorBinding};
use super::session::{HomingSession, Rail};
use crate::align::aligner::DualAxisAligner;
use crate::context::{DriveStage, MachineContext};
use crate::persist::TopOfTravelStore;
use crate::safety::remap::with_io_remap;
use plumb_common::consts::FORCED_START_SPAN;
use plumb_common::prelude::*;
use tracing::{error, info, warn};

/// Logical name of the bed probe sensor.
pub const PROBE_SENSOR: &str = "probe";

/// Forced start and target for homing one axis.
///
/// The target is the endstop position. The forced start lies 1.5 spans
/// behind it so the move always covers the whole travel.
pub fn plan_axis_home(axis: Axis, rail: &RailConfig) -> (PartialCoord, PartialCoord) {
    let mut forced: PartialCoord = [None; 4];
    let mut target: PartialCoord = [None; 4];
    let endstop = rail.position_endstop;
    target[axis.index()] = Some(endstop);
    forced[axis.index()] = Some(if rail.homing_positive_dir {
        endstop - FORCED_START_SPAN * (endstop - rail.position_min)
    } else {
        endstop + FORCED_START_SPAN * (rail.position_max - endstop)
    });
    (forced, target)
}

/// Drive stage powering `axis`.
#[inline]
pub const fn stage_of(axis: Axis) -> DriveStage {
    if axis.is_vertical() {
        DriveStage::Vertical
    } else {
        DriveStage::Horizontal
    }
}

/// Summary of one home command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HomeReport {
    /// Axes homed by the command.
    pub axes: AxisSet,
    /// Final deltaError when alignment ran.
    pub alignment_delta: Option<i32>,
    /// Value persisted as the new top-of-travel.
    pub top_of_travel: Option<f64>,
    /// Net vertical travel of the last Z home [mm].
    pub cumulative_z_travel: f64,
    /// The Z home ran without a genuine trigger.
    pub full_travel_no_trigger: bool,
}

/// Entry point for every homing and alignment command.
///
/// Owns the three rails, the optional aligner and the top-of-travel store.
/// The alignment bypass lives here and persists across commands.
pub struct HomingPolicy {
    config: MachineConfig,
    rails: [Rail; 3],
    aligner: Option<DualAxisAligner>,
    store: TopOfTravelStore,
    bypass_alignment: bool,
}

impl HomingPolicy {
    /// Bind each rail to its sensor in `ctx`.
    ///
    /// Fails when a configured endstop has no sensor in the context.
    pub fn new(config: MachineConfig, ctx: &MachineContext) -> HomingResult<Self> {
        let rails = [
            Rail::new(ctx, Axis::X, &config.rails.x)?,
            Rail::new(ctx, Axis::Y, &config.rails.y)?,
            Rail::new(ctx, Axis::Z, &config.rails.z)?,
        ];
        let store = TopOfTravelStore::new(
            &config.persist.top_of_travel_path,
            config.rails.z.position_max,
        );
        let aligner = config.z_align.clone().map(|align| {
            DualAxisAligner::new(align, config.rails.z.position_max, store.clone())
        });
        Ok(Self {
            config,
            rails,
            aligner,
            store,
            bypass_alignment: false,
        })
    }

    #[inline]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Persisted top-of-travel record.
    #[inline]
    pub fn store(&self) -> &TopOfTravelStore {
        &self.store
    }

    /// Rail homed for `axis`.
    #[inline]
    pub fn rail(&self, axis: Axis) -> &Rail {
        &self.rails[axis.index()]
    }

    /// True while `ALIGN_Z_BYPASS ENABLE=0` is in effect.
    #[inline]
    pub const fn alignment_bypassed(&self) -> bool {
        self.bypass_alignment
    }

    /// Dual-screw aligner, absent without a `[z_align]` section.
    #[inline]
    pub fn aligner(&self) -> Option<&DualAxisAligner> {
        self.aligner.as_ref()
    }

    /// `ALIGN_Z_BYPASS ENABLE=0` sets the bypass; `ENABLE=1` clears it.
    pub fn set_alignment_enabled(&mut self, enabled: bool) {
        self.bypass_alignment = !enabled;
        info!(
            bypass = self.bypass_alignment,
            "z alignment before vertical home {}",
            if enabled { "enabled" } else { "bypassed" }
        );
    }

    // ─── Commands ───────────────────────────────────────────────────

    /// Home the named axes in X, Y, Z order.
    pub fn home(&mut self, ctx: &mut MachineContext, axes: AxisSet) -> HomingResult<HomeReport> {
        let axes = if axes.is_empty() { AxisSet::XYZ } else { axes };
        let mut session = HomingSession::new(axes)?;
        let mut report = HomeReport {
            axes,
            ..HomeReport::default()
        };
        for axis in axes.axes() {
            if let Err(e) = self.home_one(ctx, &mut session, axis, &mut report) {
                return Err(Self::fail(ctx, stage_of(axis), e));
            }
        }
        report.cumulative_z_travel = session.cumulative_z_travel();
        report.full_travel_no_trigger = session.full_travel_no_trigger();
        info!(axes = ?axes, "home complete");
        Ok(report)
    }

    /// Home only the vertical axis from an arbitrary, possibly unknown
    /// position. Never aligns.
    pub fn home_z_free(&mut self, ctx: &mut MachineContext) -> HomingResult<HomeReport> {
        let mut session = HomingSession::new(AxisSet::Z)?;
        if let Err(e) = self.home_rail(ctx, &mut session, Axis::Z) {
            return Err(Self::fail(ctx, DriveStage::Vertical, e));
        }
        Ok(HomeReport {
            axes: AxisSet::Z,
            cumulative_z_travel: session.cumulative_z_travel(),
            full_travel_no_trigger: session.full_travel_no_trigger(),
            ..HomeReport::default()
        })
    }

    /// Run full dual-screw alignment unconditionally.
    pub fn align_z(&mut self, ctx: &mut MachineContext) -> HomingResult<i32> {
        let result = match self.aligner.as_mut() {
            Some(aligner) => aligner.align(ctx),
            None => Err(no_aligner()),
        };
        result.map_err(|e| Self::fail(ctx, DriveStage::Vertical, e))
    }

    /// Lift to the safe height with the rise variant of the alignment
    /// protocol.
    pub fn rise_safe_z(&mut self, ctx: &mut MachineContext) -> HomingResult<i32> {
        let result = match self.aligner.as_mut() {
            Some(aligner) => aligner.rise_to_safe_height(ctx),
            None => Err(no_aligner()),
        };
        result.map_err(|e| Self::fail(ctx, DriveStage::Vertical, e))
    }

    /// Stall-detection vertical home over `distance` mm. Leaves Z at
    /// `distance - backoff` and marked not homed.
    pub fn calibrate_z_sensorless(
        &mut self,
        ctx: &mut MachineContext,
        distance: f64,
    ) -> HomingResult<Coord> {
        let limits = &self.config.homing;
        if !(0.0..=limits.sensorless_max_distance).contains(&distance) {
            return Err(HomingError::InvalidCommand {
                reason: format!(
                    "DISTANCE {distance} outside 0..={}",
                    limits.sensorless_max_distance
                ),
            });
        }
        let backoff = limits.sensorless_backoff;
        let result = self.sensorless_home(ctx, distance, backoff);
        result.map_err(|e| Self::fail(ctx, DriveStage::Vertical, e))
    }

    /// Probe toward `pos`; returns the position at the trigger instant.
    ///
    /// A probe that reports no movement is logged, not fatal.
    pub fn probing_move(
        &mut self,
        ctx: &mut MachineContext,
        pos: Coord,
        speed: f64,
    ) -> HomingResult<Coord> {
        let sensor = ctx.sensor(PROBE_SENSOR)?;
        let mut hmove = HomingMove::new(
            vec![SensorBinding::new(sensor, PROBE_SENSOR, Axis::Z)],
            Default::default(),
        );
        let outcome = match hmove.execute(ctx, pos, speed, MoveOptions::probe()) {
            Ok(o) => o,
            Err(e) => return Err(Self::shutdown_attributed(ctx, e)),
        };
        if hmove.check_no_movement().is_some() {
            warn!("probe triggered prior to movement");
        }
        Ok(outcome.trigger_position)
    }

    /// Single homing move with caller-supplied sensors and trigger policy.
    pub fn manual_home(
        &mut self,
        ctx: &mut MachineContext,
        bindings: Vec<SensorBinding>,
        pos: Coord,
        speed: f64,
        triggered: bool,
        check_triggered: bool,
    ) -> HomingResult<Coord> {
        let mut hmove = HomingMove::new(bindings, Default::default());
        let opts = MoveOptions {
            resolve_at_trigger: false,
            require_trigger: check_triggered,
            trigger_level: triggered,
        };
        hmove
            .execute(ctx, pos, speed, opts)
            .map(|o| o.halt_position)
            .map_err(|e| Self::shutdown_attributed(ctx, e))
    }

    // ─── Internals ──────────────────────────────────────────────────

    fn home_one(
        &mut self,
        ctx: &mut MachineContext,
        session: &mut HomingSession,
        axis: Axis,
        report: &mut HomeReport,
    ) -> HomingResult<()> {
        session.set_axes(AxisSet::of(axis))?;
        if !axis.is_vertical() {
            let remapped = self.config.io_remap.as_ref().is_some_and(|r| r.axis == axis);
            return if remapped {
                with_io_remap(ctx, |ctx| self.home_rail(ctx, session, axis))
            } else {
                self.home_rail(ctx, session, axis)
            };
        }

        if self.aligner.is_none() {
            return self.home_rail(ctx, session, axis);
        }
        if self.bypass_alignment {
            info!("z alignment bypassed, plain vertical home");
            return self.home_rail(ctx, session, axis);
        }
        if session.alignment_ran() {
            return self.home_rail(ctx, session, axis);
        }
        self.home_z_aligned(ctx, session, report)
    }

    /// Alignment-gated vertical home.
    fn home_z_aligned(
        &mut self,
        ctx: &mut MachineContext,
        session: &mut HomingSession,
        report: &mut HomeReport,
    ) -> HomingResult<()> {
        let policy = self.config.homing.clone();
        let z_max = self.config.rails.z.position_max;
        let z = Axis::Z.index();

        ctx.leveling.clear_mesh();

        let mut pos = ctx.motion.position();
        pos[Axis::X.index()] = self.config.rails.x.center();
        pos[Axis::Y.index()] = self.config.rails.y.center();
        ctx.motion.commanded_move(pos, policy.center_move_speed)?;

        let delta = match self.aligner.as_mut() {
            Some(aligner) => aligner.align(ctx)?,
            None => return Err(no_aligner()),
        };
        session.mark_aligned();
        report.alignment_delta = Some(delta);

        let mut pos = ctx.motion.position();
        pos[z] = z_max;
        ctx.motion.set_position(pos, AxisSet::Z);
        let lowered = z_max * policy.pre_home_lift_ratio;
        pos[z] -= lowered;
        ctx.motion.commanded_move(pos, policy.pre_home_lift_speed)?;

        self.home_rail(ctx, session, Axis::Z)?;

        let measured = lowered + session.cumulative_z_travel();
        let stored = self.store.write(measured)?;
        info!(
            lowered,
            travel = session.cumulative_z_travel(),
            stored,
            "top-of-travel measured"
        );
        report.top_of_travel = Some(stored);
        Ok(())
    }

    fn sensorless_home(
        &self,
        ctx: &mut MachineContext,
        distance: f64,
        backoff: f64,
    ) -> HomingResult<Coord> {
        let mut session = HomingSession::new(AxisSet::Z)?;
        session.set_sensorless(true);
        let rail = self.rail(Axis::Z);
        let cfg = rail.config();
        let z = Axis::Z.index();
        let mut forced: PartialCoord = [None; 4];
        let mut target: PartialCoord = [None; 4];
        target[z] = Some(cfg.position_endstop);
        forced[z] = Some(if cfg.homing_positive_dir {
            cfg.position_endstop - distance
        } else {
            cfg.position_endstop + distance
        });
        session.home_axis_group(ctx, &[rail], forced, target)?;

        let mut pos = ctx.motion.position();
        pos[z] = distance - backoff;
        ctx.motion.set_position(pos, AxisSet::Z);
        ctx.motion.mark_unhomed(AxisSet::Z);
        info!(z = pos[z], "sensorless calibration complete, z left unhomed");
        Ok(pos)
    }

    fn home_rail(
        &self,
        ctx: &mut MachineContext,
        session: &mut HomingSession,
        axis: Axis,
    ) -> HomingResult<()> {
        let rail = self.rail(axis);
        let (forced, target) = plan_axis_home(axis, rail.config());
        session.home_axis_group(ctx, &[rail], forced, target)
    }

    fn shutdown_attributed(ctx: &MachineContext, e: HomingError) -> HomingError {
        if ctx.status.is_shutdown() {
            e.during_shutdown()
        } else {
            e
        }
    }

    /// Wrap a fault leaving the policy layer.
    fn fail(ctx: &mut MachineContext, stage: DriveStage, e: HomingError) -> HomingError {
        if ctx.status.is_shutdown() {
            let e = e.during_shutdown();
            error!(code = e.code().as_u16(), "{e}");
            return e;
        }
        error!(code = e.code().as_u16(), stage = %stage, "{e}, de-energizing");
        if let Err(off) = ctx.drives.set_enabled(stage, false) {
            warn!("failed to de-energize {stage} stage: {off}");
        }
        e
    }
}

fn no_aligner() -> HomingError {
    HomingError::InvalidCommand {
        reason: "no [z_align] section configured".to_string(),
    }
}
