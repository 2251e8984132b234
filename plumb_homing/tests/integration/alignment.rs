//! Integration test: dual-screw alignment and the rise variant.
//!
//! 1. Bounded retries against a scripted deltaError sequence
//! 2. Timeout and retry exhaustion run the abandon sequence
//! 3. Post-alignment reconcile with and without leveling
//! 4. Rise precheck refuses to move when both screws read triggered

use super::{align_sends, count, position_of, rig, rig_with};
use plumb_common::align::AlignMotion;
use plumb_common::axis::{Axis, AxisSet};
use plumb_common::consts::POST_ALIGN_DROP_SPEED;
use plumb_common::error::{FaultCode, HomingError};
use plumb_homing::align::aligner::AlignPhase;
use plumb_homing::context::{DriveStage, Reactor};
use plumb_homing::sim::SimEvent;
use std::cell::Cell;
use std::fs;
use std::rc::Rc;

#[test]
fn converges_once_delta_is_within_tolerance() {
    let mut rig = rig();
    rig.sim.script_alignment(&[12, 9, 6]);

    let delta = rig.policy.align_z(&mut rig.ctx).unwrap();

    assert_eq!(delta, 9);
    let aligner = rig.policy.aligner().unwrap();
    assert_eq!(aligner.attempts(), 2);
    assert_eq!(aligner.phase(), AlignPhase::Converged(9));
    assert_eq!(align_sends(&rig.sim), 2);
}

#[test]
fn tolerance_is_strict() {
    let mut rig = rig();
    rig.sim.script_alignment(&[10, -10, -9]);
    assert_eq!(rig.policy.align_z(&mut rig.ctx).unwrap(), -9);
    assert_eq!(align_sends(&rig.sim), 3);
}

#[test]
fn retries_are_bounded_and_exhaustion_abandons() {
    let mut rig = rig_with(|c| {
        if let Some(align) = c.z_align.as_mut() {
            align.retries = 3;
        }
    });
    rig.sim.script_alignment(&[20]);

    let err = rig.policy.align_z(&mut rig.ctx).unwrap_err();

    assert_eq!(
        err,
        HomingError::AlignmentRetriesExhausted {
            attempts: 3,
            delta_error: 20,
            tolerance: 10,
        }
    );
    assert_eq!(align_sends(&rig.sim), 3);

    // Abandon: XYZ marked known, X nudged, every stage de-energized.
    assert!(rig.sim.world().homed.contains(AxisSet::XYZ));
    let all_off = position_of(&rig.sim, |e| {
        *e == SimEvent::DriveEnabled {
            stage: DriveStage::All,
            enabled: false,
        }
    })
    .unwrap();
    let nudge = position_of(&rig.sim, |e| {
        matches!(e, SimEvent::Move { target, .. } if (target[0] - 0.001).abs() < 1e-12)
    })
    .unwrap();
    assert!(nudge < all_off);
}

#[test]
fn timeout_abandons_after_one_attempt() {
    let mut rig = rig_with(|c| {
        if let Some(align) = c.z_align.as_mut() {
            align.timeout = 3.0;
        }
    });
    rig.sim.set_alignment_hangs(true);

    let err = rig.policy.align_z(&mut rig.ctx).unwrap_err();

    assert_eq!(err.code(), FaultCode::AlignmentTimeout);
    assert_eq!(err.context()["attempt"], "1");
    assert_eq!(align_sends(&rig.sim), 1);
    assert!(rig.sim.world().clock > 3.0);
    assert_eq!(rig.policy.aligner().unwrap().phase(), AlignPhase::TimedOut);
    assert_eq!(
        count(&rig.sim, |e| matches!(
            e,
            SimEvent::DriveEnabled {
                enabled: false,
                ..
            }
        )),
        2
    );
}

/// Clock whose pauses end after at most 10 ms, whatever was requested.
struct ShortPauseReactor(Rc<Cell<f64>>);

impl Reactor for ShortPauseReactor {
    fn monotonic(&self) -> f64 {
        self.0.get()
    }

    fn pause_until(&mut self, t: f64) {
        let now = self.0.get();
        if t > now {
            self.0.set(now + (t - now).min(0.01));
        }
    }
}

#[test]
fn timeout_waits_for_the_wall_clock_deadline() {
    let mut rig = rig_with(|c| {
        if let Some(align) = c.z_align.as_mut() {
            align.timeout = 3.0;
        }
    });
    rig.sim.set_alignment_hangs(true);
    let clock = Rc::new(Cell::new(0.0));
    rig.ctx.reactor = Box::new(ShortPauseReactor(clock.clone()));

    let err = rig.policy.align_z(&mut rig.ctx).unwrap_err();

    assert_eq!(err.code(), FaultCode::AlignmentTimeout);
    assert!(clock.get() > 3.0, "gave up at {}", clock.get());
    assert_eq!(align_sends(&rig.sim), 1);
}

#[test]
fn reconcile_restores_persisted_top_of_travel() {
    let mut rig = rig();
    rig.policy.store().write(243.5).unwrap();

    rig.policy.align_z(&mut rig.ctx).unwrap();

    let z = rig.ctx.motion.position()[Axis::Z.index()];
    assert!((z - 233.5).abs() < 1e-9, "z after reconcile {z}");
    let drop = position_of(&rig.sim, |e| {
        matches!(e, SimEvent::Move { target, speed }
            if (target[2] - 233.5).abs() < 1e-9 && *speed == POST_ALIGN_DROP_SPEED)
    });
    assert!(drop.is_some());
    assert_eq!(count(&rig.sim, |e| *e == SimEvent::Synchronize), 1);
    assert!(rig.sim.world().homed.has(Axis::Z));
}

#[test]
fn reconcile_clamps_oversized_record() {
    let mut rig = rig();
    let path = rig.policy.store().path().to_path_buf();
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, r#"{"zmax": 400.0}"#).unwrap();

    assert_eq!(rig.policy.store().read(), 250.0);
    rig.policy.align_z(&mut rig.ctx).unwrap();
    let z = rig.ctx.motion.position()[Axis::Z.index()];
    assert!((z - 240.0).abs() < 1e-9);
}

#[test]
fn leveling_pins_z_to_max_travel() {
    let mut rig = rig();
    rig.policy.store().write(243.5).unwrap();
    rig.sim.set_leveling_active(true);

    rig.policy.align_z(&mut rig.ctx).unwrap();

    assert_eq!(rig.ctx.motion.position()[Axis::Z.index()], 250.0);
    assert_eq!(count(&rig.sim, |e| *e == SimEvent::Synchronize), 0);
}

#[test]
fn rise_precheck_refuses_when_both_screws_triggered() {
    let mut rig = rig();
    rig.sim.place("stepper_z", 250.0);
    rig.sim.place("stepper_z1", 250.0);

    let err = rig.policy.rise_safe_z(&mut rig.ctx).unwrap_err();

    assert_eq!(err, HomingError::AlignmentPrecheckFailed);
    assert_eq!(count(&rig.sim, SimEvent::is_motion), 0);
    assert_eq!(align_sends(&rig.sim), 0);
}

#[test]
fn rise_runs_with_one_screw_triggered() {
    let mut rig = rig();
    rig.sim.place("stepper_z", 250.0);

    let delta = rig.policy.rise_safe_z(&mut rig.ctx).unwrap();

    assert_eq!(delta, 0);
    let sends: Vec<_> = rig
        .sim
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::AlignSent { motion, request } => Some((motion, request)),
            _ => None,
        })
        .collect();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, AlignMotion::Rise);
    assert!(sends[0].1.travel_steps < 8000);
    assert_eq!(sends[0].1.filter_count, 10);

    // Provisional Z of 10 mm, nudged up by 0.1 mm before the protocol.
    let nudge = position_of(&rig.sim, |e| {
        matches!(e, SimEvent::Move { target, .. } if (target[2] - 10.1).abs() < 1e-9)
    });
    let send = position_of(&rig.sim, |e| matches!(e, SimEvent::AlignSent { .. }));
    assert!(nudge.unwrap() < send.unwrap());
}

#[test]
fn missing_aligner_is_an_invalid_command() {
    let mut rig = rig_with(|c| c.z_align = None);
    let err = rig.policy.align_z(&mut rig.ctx).unwrap_err();
    assert_eq!(err.code(), FaultCode::InvalidCommand);
}
