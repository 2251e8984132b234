//! Integration test: command-level homing policy.
//!
//! Validates the full G28-style flow, the alignment bypass switch, the IO
//! remap scope, shutdown attribution and sensorless calibration.

use super::{align_sends, count, position_of, rig, rig_with};
use plumb_common::axis::{Axis, AxisSet};
use plumb_common::error::{FaultCode, HomingError};
use plumb_homing::context::DriveStage;
use plumb_homing::sim::SimEvent;

// ── Full home ───────────────────────────────────────────────────────

#[test]
fn full_home_aligns_then_persists_top_of_travel() {
    let mut rig = rig();

    let report = rig.policy.home(&mut rig.ctx, AxisSet::empty()).unwrap();

    assert_eq!(report.axes, AxisSet::XYZ);
    assert_eq!(report.alignment_delta, Some(0));
    // Screws aligned at 250 mm, dropped 10 mm from the 240 mm fallback
    // record, then lowered 225 mm and homed over the remaining 15 mm.
    let top = report.top_of_travel.unwrap();
    assert!((top - 240.0075).abs() < 1e-6, "top-of-travel {top}");
    assert!(top <= 250.0);
    assert!((report.cumulative_z_travel - 15.0075).abs() < 1e-6);
    assert_eq!(rig.policy.store().read(), top);

    let world = rig.sim.world();
    assert!(world.homed.contains(AxisSet::XYZ));
    drop(world);

    let cleared = position_of(&rig.sim, |e| *e == SimEvent::MeshCleared).unwrap();
    let aligned = position_of(&rig.sim, |e| matches!(e, SimEvent::AlignSent { .. })).unwrap();
    let center = position_of(&rig.sim, |e| {
        matches!(e, SimEvent::Move { target, speed } if target[0] == 110.0 && target[1] == 110.0 && *speed == 50.0)
    })
    .unwrap();
    assert!(cleared < center && center < aligned);
    assert_eq!(count(&rig.sim, |e| *e == SimEvent::Remap(true)), 1);
    assert_eq!(count(&rig.sim, |e| *e == SimEvent::Remap(false)), 1);
}

#[test]
fn alignment_runs_once_per_home_command() {
    let mut rig = rig();
    rig.policy.home(&mut rig.ctx, AxisSet::Z).unwrap();
    assert_eq!(align_sends(&rig.sim), 1);
    rig.policy.home(&mut rig.ctx, AxisSet::Z).unwrap();
    assert_eq!(align_sends(&rig.sim), 2);
}

#[test]
fn bypass_persists_until_reenabled() {
    let mut rig = rig();
    rig.policy.set_alignment_enabled(false);
    assert!(rig.policy.alignment_bypassed());

    let first = rig.policy.home(&mut rig.ctx, AxisSet::Z).unwrap();
    let second = rig.policy.home(&mut rig.ctx, AxisSet::Z).unwrap();
    assert_eq!(first.alignment_delta, None);
    assert_eq!(second.top_of_travel, None);
    assert_eq!(align_sends(&rig.sim), 0);

    rig.policy.set_alignment_enabled(true);
    let third = rig.policy.home(&mut rig.ctx, AxisSet::Z).unwrap();
    assert_eq!(third.alignment_delta, Some(0));
    assert_eq!(align_sends(&rig.sim), 1);
}

#[test]
fn home_z_free_never_aligns() {
    let mut rig = rig();
    let report = rig.policy.home_z_free(&mut rig.ctx).unwrap();
    assert_eq!(report.axes, AxisSet::Z);
    assert_eq!(align_sends(&rig.sim), 0);
    assert!((report.cumulative_z_travel - 125.0075).abs() < 1e-6);
    assert_eq!(count(&rig.sim, |e| *e == SimEvent::MeshCleared), 0);
}

#[test]
fn machine_without_aligner_homes_z_directly() {
    let mut rig = rig_with(|c| c.z_align = None);
    let report = rig.policy.home(&mut rig.ctx, AxisSet::Z).unwrap();
    assert_eq!(report.alignment_delta, None);
    assert!(rig.ctx.controller.is_none());
}

// ── Failure wrapping ────────────────────────────────────────────────

#[test]
fn fault_deenergizes_the_affected_stage() {
    let mut rig = rig();
    rig.sim.set_dead("y", true);

    let err = rig.policy.home(&mut rig.ctx, AxisSet::Y).unwrap_err();

    assert_eq!(err.code(), FaultCode::TriggerMissing);
    assert_eq!(
        count(&rig.sim, |e| *e
            == SimEvent::DriveEnabled {
                stage: DriveStage::Horizontal,
                enabled: false,
            }),
        1
    );
}

#[test]
fn shutdown_is_attributed_and_drives_untouched() {
    let mut rig = rig();
    rig.sim.set_dead("y", true);
    rig.sim.set_shutdown(true);

    let err = rig.policy.home(&mut rig.ctx, AxisSet::Y).unwrap_err();

    assert_eq!(err.code(), FaultCode::ShutdownDuringHoming);
    match &err {
        HomingError::ShutdownDuringHoming { source } => {
            assert_eq!(source.code(), FaultCode::TriggerMissing);
        }
        other => panic!("unexpected {other:?}"),
    }
    let fault = err.to_fault();
    assert_eq!(fault.context["cause_code"], "22");
    assert_eq!(
        count(&rig.sim, |e| matches!(e, SimEvent::DriveEnabled { .. })),
        0
    );
}

#[test]
fn stuck_x_sensor_stops_and_reverts_remap() {
    let mut rig = rig();
    rig.sim.set_stuck("x", true);

    let err = rig.policy.home(&mut rig.ctx, AxisSet::X).unwrap_err();

    assert_eq!(err.code(), FaultCode::SpuriousTriggerAfterRetract);
    let engaged = position_of(&rig.sim, |e| *e == SimEvent::Remap(true)).unwrap();
    let hold = position_of(&rig.sim, |e| *e == SimEvent::HoldAndFlush).unwrap();
    let reverted = position_of(&rig.sim, |e| *e == SimEvent::Remap(false)).unwrap();
    assert!(engaged < hold && hold < reverted);
}

#[test]
fn remap_is_scoped_to_the_configured_axis() {
    let mut rig = rig();
    rig.policy.home(&mut rig.ctx, AxisSet::Y).unwrap();
    assert_eq!(count(&rig.sim, |e| matches!(e, SimEvent::Remap(_))), 0);

    rig.policy.home(&mut rig.ctx, AxisSet::X).unwrap();
    assert_eq!(count(&rig.sim, |e| matches!(e, SimEvent::Remap(_))), 2);
}

#[test]
fn failed_remap_revert_fails_the_home() {
    let mut rig = rig();
    rig.sim.world_mut().remap_revert_fails = true;

    let err = rig.policy.home(&mut rig.ctx, AxisSet::X).unwrap_err();
    assert_eq!(err.code(), FaultCode::ControllerFault);
    // The axis itself was homed before the revert failed.
    assert!(rig.sim.world().homed.has(Axis::X));
}

// ── Sensorless calibration ──────────────────────────────────────────

#[test]
fn sensorless_calibration_leaves_z_unhomed() {
    let mut rig = rig();

    let pos = rig.policy.calibrate_z_sensorless(&mut rig.ctx, 200.0).unwrap();

    assert_eq!(pos[Axis::Z.index()], 197.0);
    assert_eq!(rig.ctx.motion.position()[Axis::Z.index()], 197.0);
    assert!(!rig.sim.world().homed.has(Axis::Z));
    assert_eq!(
        rig.sim.events().last(),
        Some(&SimEvent::MarkUnhomed(AxisSet::Z))
    );

    // First pass at four times the homing speed.
    let speeds: Vec<f64> = rig
        .sim
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::HomingMove { speed, .. } => Some(speed),
            _ => None,
        })
        .collect();
    assert_eq!(speeds, vec![40.0, 2.0]);
}

#[test]
fn sensorless_distance_is_bounded() {
    let mut rig = rig();
    let err = rig
        .policy
        .calibrate_z_sensorless(&mut rig.ctx, 400.0)
        .unwrap_err();
    assert_eq!(err.code(), FaultCode::InvalidCommand);
    assert!(rig
        .policy
        .calibrate_z_sensorless(&mut rig.ctx, -1.0)
        .is_err());
    assert_eq!(count(&rig.sim, SimEvent::is_motion), 0);
}
