//! Dual-screw alignment of the vertical axis.
//!
//! `Idle → ArmedDescent → {Converged(deltaError) | TimedOut}`, retried
//! host-side up to `retries` times.
//!
//! The host only converts speeds and distances into controller units and
//! polls the status record. Per-screw edge detection and debounce run on
//! the controller.

use crate::context::{DriveStage, MachineContext};
use crate::persist::TopOfTravelStore;
use crate::safety::stop::{SafeStopSequence, StopProfile};
use plumb_common::consts::{
    ALIGN_POLL_INTERVAL, ALIGN_SETTLE_DELAY, POST_ALIGN_DROP_SPEED, RISE_NUDGE_SPEED, RISE_NUDGE_Z,
    RISE_PROVISIONAL_Z,
};
use plumb_common::prelude::*;
use tracing::{debug, error, info, warn};

// ─── Phases and verdicts ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignPhase {
    Idle,
    /// Command sent, controller driving both screws.
    ArmedDescent,
    Converged(i32),
    TimedOut,
}

/// Result of one command round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Converged(i32),
    Timeout,
}

/// Result of the bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignVerdict {
    Converged { delta_error: i32, attempts: u32 },
    Timeout { attempt: u32 },
    RetriesExhausted { attempts: u32, delta_error: i32 },
}

// ─── Aligner ────────────────────────────────────────────────────────

pub struct DualAxisAligner {
    config: AlignConfig,
    /// Configured vertical max travel [mm].
    max_travel: f64,
    store: TopOfTravelStore,
    phase: AlignPhase,
    attempts: u32,
}

impl DualAxisAligner {
    pub fn new(config: AlignConfig, max_travel: f64, store: TopOfTravelStore) -> Self {
        Self {
            config,
            max_travel,
            store,
            phase: AlignPhase::Idle,
            attempts: 0,
        }
    }

    #[inline]
    pub const fn phase(&self) -> AlignPhase {
        self.phase
    }

    /// Round-trips issued by the last run.
    #[inline]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    #[inline]
    pub fn config(&self) -> &AlignConfig {
        &self.config
    }

    /// Send one command and poll until done or timed out.
    fn attempt(
        &mut self,
        ctx: &mut MachineContext,
        motion: AlignMotion,
        request: AlignRequest,
    ) -> HomingResult<AttemptOutcome> {
        ctx.controller()?.send(motion, request)?;
        self.phase = AlignPhase::ArmedDescent;

        let start = ctx.reactor.monotonic();
        ctx.reactor.pause_until(start + ALIGN_SETTLE_DELAY);

        let deadline = start + self.config.timeout;
        loop {
            let now = ctx.reactor.monotonic();
            if now > deadline {
                self.phase = AlignPhase::TimedOut;
                return Ok(AttemptOutcome::Timeout);
            }
            if let Some(delta) = ctx.controller()?.status().result() {
                debug!(delta, elapsed = now - start, "alignment status done");
                self.phase = AlignPhase::Converged(delta);
                return Ok(AttemptOutcome::Converged(delta));
            }
            ctx.reactor.pause_until(now + ALIGN_POLL_INTERVAL);
        }
    }

    /// Bounded retry loop over [`attempt`](Self::attempt).
    pub fn run_protocol(
        &mut self,
        ctx: &mut MachineContext,
        motion: AlignMotion,
    ) -> HomingResult<AlignVerdict> {
        let clock = ctx.controller()?.clock_frequency();
        let request = AlignRequest::from_config(&self.config, motion, clock);
        info!(
            ?motion,
            quick_ticks = request.quick_speed_ticks,
            slow_ticks = request.slow_speed_ticks,
            travel_steps = request.travel_steps,
            filter = request.filter_count,
            "starting z alignment"
        );

        self.attempts = 0;
        self.phase = AlignPhase::Idle;
        let mut last_delta = 0;
        for attempt in 1..=self.config.retries {
            self.attempts = attempt;
            match self.attempt(ctx, motion, request)? {
                AttemptOutcome::Timeout => {
                    return Ok(AlignVerdict::Timeout { attempt });
                }
                AttemptOutcome::Converged(delta) => {
                    info!(attempt, delta, tolerance = self.config.retry_tolerance, "alignment attempt finished");
                    if delta.abs() < self.config.retry_tolerance {
                        return Ok(AlignVerdict::Converged {
                            delta_error: delta,
                            attempts: attempt,
                        });
                    }
                    last_delta = delta;
                }
            }
        }
        Ok(AlignVerdict::RetriesExhausted {
            attempts: self.config.retries,
            delta_error: last_delta,
        })
    }

    /// Turn a failed verdict into its fault after running the abandon
    /// sequence.
    fn settle_verdict(&self, ctx: &mut MachineContext, verdict: AlignVerdict) -> HomingResult<i32> {
        let fault = match verdict {
            AlignVerdict::Converged { delta_error, .. } => return Ok(delta_error),
            AlignVerdict::Timeout { attempt } => HomingError::AlignmentTimeout {
                timeout_s: self.config.timeout,
                attempt,
            },
            AlignVerdict::RetriesExhausted {
                attempts,
                delta_error,
            } => HomingError::AlignmentRetriesExhausted {
                attempts,
                delta_error,
                tolerance: self.config.retry_tolerance,
            },
        };
        error!("{fault}, abandoning");
        if let Err(e) = SafeStopSequence::new(StopProfile::AlignmentAbandon).execute(ctx) {
            error!("abandon sequence incomplete: {e}");
        }
        Err(fault)
    }

    /// Full alignment followed by the position reconcile.
    ///
    /// Returns the final deltaError.
    pub fn align(&mut self, ctx: &mut MachineContext) -> HomingResult<i32> {
        let pos = ctx.motion.position();
        ctx.motion.set_position(pos, AxisSet::Z);
        ctx.drives.set_enabled(DriveStage::Vertical, true)?;

        let verdict = self.run_protocol(ctx, AlignMotion::Descend)?;
        let delta = self.settle_verdict(ctx, verdict)?;

        let mut pos = ctx.motion.position();
        let z = Axis::Z.index();
        if ctx.leveling.is_active() {
            pos[z] = self.max_travel;
            ctx.motion.set_position(pos, AxisSet::Z);
            info!("leveling active, z pinned to max travel {:.3}", self.max_travel);
        } else {
            let top = self.store.read();
            pos[z] = top;
            ctx.motion.set_position(pos, AxisSet::Z);
            pos[z] -= self.config.post_align_drop;
            ctx.motion.commanded_move(pos, POST_ALIGN_DROP_SPEED)?;
            ctx.drives.synchronize_actuators()?;
            info!(top_of_travel = top, "z restored from persisted top-of-travel");
        }
        Ok(delta)
    }

    /// Lift to the safe height using the rise variant of the protocol.
    pub fn rise_to_safe_height(&mut self, ctx: &mut MachineContext) -> HomingResult<i32> {
        let [left, right] = &self.config.screw_sensors;
        let left = ctx.sensor(left)?;
        let right = ctx.sensor(right)?;
        if left.is_triggered() && right.is_triggered() {
            warn!("both screw limit sensors triggered before rise");
            return Err(HomingError::AlignmentPrecheckFailed);
        }

        let mut pos = ctx.motion.position();
        ctx.motion.set_position(pos, AxisSet::Z);
        ctx.drives.set_enabled(DriveStage::Vertical, true)?;
        pos[Axis::Z.index()] = RISE_PROVISIONAL_Z;
        ctx.motion.set_position(pos, AxisSet::Z);
        pos[Axis::Z.index()] += RISE_NUDGE_Z;
        ctx.motion.commanded_move(pos, RISE_NUDGE_SPEED)?;

        let verdict = self.run_protocol(ctx, AlignMotion::Rise)?;
        let delta = self.settle_verdict(ctx, verdict)?;
        ctx.drives.set_enabled(DriveStage::Vertical, true)?;
        info!(delta, "rise to safe height complete");
        Ok(delta)
    }
}
