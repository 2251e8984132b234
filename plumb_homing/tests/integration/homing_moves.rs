//! Integration test: single homing moves against the simulated machine.

use super::{count, rig};
use plumb_common::axis::{Axis, AxisSet};
use plumb_common::error::{FaultCode, HomingError};
use plumb_homing::events::{MoveEvent, ObserverList};
use plumb_homing::homing::homing_move::{HomingMove, MoveOptions, SensorBinding};
use plumb_homing::sim::SimEvent;
use std::cell::RefCell;
use std::rc::Rc;

fn x_binding(rig: &super::Rig) -> SensorBinding {
    SensorBinding::new(rig.ctx.sensor("x").unwrap(), "x", Axis::X)
}

#[test]
fn start_pos_is_captured_before_motion() {
    let mut rig = rig();
    rig.ctx.motion.set_position([330.0, 0.0, 0.0, 0.0], AxisSet::X);
    let before = rig.ctx.kinematics.mcu_position("stepper_x");

    // Count physical moves already issued when the move begins.
    let moves_at_begin = Rc::new(RefCell::new(None));
    let mut observers = ObserverList::new();
    let seen = moves_at_begin.clone();
    let sim = rig.sim.clone();
    observers.register(move |e: &MoveEvent| {
        if let MoveEvent::Begin { .. } = e {
            *seen.borrow_mut() = Some(sim.events().iter().filter(|e| e.is_motion()).count());
        }
        Ok(())
    });

    let mut hmove = HomingMove::new(vec![x_binding(&rig)], observers);
    let outcome = hmove
        .execute(&mut rig.ctx, [0.0, 0.0, 0.0, 0.0], 50.0, MoveOptions::default())
        .unwrap();

    assert_eq!(*moves_at_begin.borrow(), Some(0));
    let sample = &hmove.samples()[0];
    assert_eq!(sample.actuator(), "stepper_x");
    assert_eq!(sample.start_pos(), before);
    let trig = sample.trig_pos().unwrap();
    let halt = sample.halt_pos().unwrap();
    assert_eq!(trig - sample.start_pos(), -8800);
    assert_eq!(halt - trig, -3);

    // Target is taken as the trigger point; the halt includes the overshoot.
    assert_eq!(outcome.trigger_position[0], 0.0);
    assert!((outcome.halt_position[0] + 0.0375).abs() < 1e-9);
    assert_eq!(rig.ctx.motion.position(), outcome.halt_position);
    assert!(outcome.trigger_times.contains_key("x"));
    assert!(outcome.untriggered.is_empty());
    assert_eq!(hmove.check_no_movement(), None);
}

#[test]
fn move_end_is_published_with_trigger_times() {
    let mut rig = rig();
    rig.ctx.motion.set_position([330.0, 0.0, 0.0, 0.0], AxisSet::X);

    let events = Rc::new(RefCell::new(Vec::new()));
    let mut observers = ObserverList::new();
    let sink = events.clone();
    observers.register(move |e: &MoveEvent| {
        sink.borrow_mut().push(e.clone());
        Ok(())
    });

    let mut hmove = HomingMove::new(vec![x_binding(&rig)], observers);
    hmove
        .execute(&mut rig.ctx, [0.0, 0.0, 0.0, 0.0], 50.0, MoveOptions::default())
        .unwrap();

    let events = events.borrow();
    assert_eq!(events.len(), 2);
    assert_eq!(
        events[0],
        MoveEvent::Begin {
            sensors: vec!["x".to_string()]
        }
    );
    match &events[1] {
        MoveEvent::End {
            trigger_times,
            untriggered,
            full_travel_no_trigger,
        } => {
            // 1 ms settle dwell, then 110 mm at 50 mm/s.
            assert!((trigger_times["x"] - 2.201).abs() < 1e-9);
            assert!(untriggered.is_empty());
            assert!(!full_travel_no_trigger);
        }
        other => panic!("expected End, got {other:?}"),
    }
}

#[test]
fn observer_veto_fails_the_move_after_bookkeeping() {
    let mut rig = rig();
    rig.ctx.motion.set_position([330.0, 0.0, 0.0, 0.0], AxisSet::X);
    let mut observers = ObserverList::new();
    observers.register(|e: &MoveEvent| match e {
        MoveEvent::End { .. } => Err(HomingError::Controller {
            reason: "vetoed".to_string(),
        }),
        MoveEvent::Begin { .. } => Ok(()),
    });

    let mut hmove = HomingMove::new(vec![x_binding(&rig)], observers);
    let err = hmove
        .execute(&mut rig.ctx, [0.0, 0.0, 0.0, 0.0], 50.0, MoveOptions::default())
        .unwrap_err();
    assert_eq!(err.code(), FaultCode::ControllerFault);
    assert!(hmove.samples()[0].halt_pos().is_some());
}

#[test]
fn missing_trigger_is_fatal_only_when_required() {
    let mut rig = rig();
    rig.sim.set_dead("x", true);
    rig.ctx.motion.set_position([100.0, 0.0, 0.0, 0.0], AxisSet::X);

    let bindings = vec![x_binding(&rig)];
    let err = rig
        .policy
        .manual_home(&mut rig.ctx, bindings.clone(), [50.0, 0.0, 0.0, 0.0], 50.0, true, true)
        .unwrap_err();
    assert_eq!(
        err,
        HomingError::TriggerMissing {
            sensor: "x".to_string()
        }
    );

    let halt = rig
        .policy
        .manual_home(&mut rig.ctx, bindings, [0.0, 0.0, 0.0, 0.0], 50.0, true, false)
        .unwrap();
    assert_eq!(halt, [0.0, 0.0, 0.0, 0.0]);
}

#[test]
fn unresponsive_sensor_is_a_communication_timeout() {
    let mut rig = rig();
    rig.sim.set_unresponsive("y", true);
    let binding = SensorBinding::new(rig.ctx.sensor("y").unwrap(), "y", Axis::Y);
    let err = rig
        .policy
        .manual_home(&mut rig.ctx, vec![binding], [0.0, -20.0, 0.0, 0.0], 50.0, true, true)
        .unwrap_err();
    assert_eq!(err.code(), FaultCode::CommunicationTimeout);
    assert_eq!(err.context()["sensor"], "y");
}

#[test]
fn probing_move_resolves_the_trigger_instant() {
    let mut rig = rig();
    rig.sim.place("stepper_z", 10.0);
    rig.sim.place("stepper_z1", 10.0);
    rig.ctx.motion.set_position([110.0, 110.0, 10.0, 0.0], AxisSet::XYZ);

    let hit = rig
        .policy
        .probing_move(&mut rig.ctx, [110.0, 110.0, -5.0, 0.0], 5.0)
        .unwrap();
    assert!(hit[2].abs() < 0.003, "probe hit at {}", hit[2]);
    assert!((hit[0] - 110.0).abs() < 1e-9);
    // Believed position reflects the halted steps, below the trigger.
    assert!(rig.ctx.motion.position()[2] < hit[2]);
    assert_eq!(
        count(&rig.sim, |e| matches!(
            e,
            SimEvent::HomingMove { triggered: Some(s), .. } if s == "probe"
        )),
        1
    );
}

#[test]
fn poll_interval_follows_step_rate() {
    let mut rig = rig();
    rig.ctx.motion.set_position([330.0, 0.0, 0.0, 0.0], AxisSet::X);
    let binding = x_binding(&rig);

    // 330 mm at 50 mm/s over 26400 steps.
    let rest = HomingMove::poll_interval(&rig.ctx, &binding, &[0.0, 0.0, 0.0, 0.0], 50.0);
    assert!((rest - 0.00025).abs() < 1e-12, "rest {rest}");

    let idle = HomingMove::poll_interval(&rig.ctx, &binding, &[330.0, 0.0, 0.0, 0.0], 50.0);
    assert_eq!(idle, 0.001);
}

#[test]
fn a_move_runs_only_once() {
    let mut rig = rig();
    rig.ctx.motion.set_position([330.0, 0.0, 0.0, 0.0], AxisSet::X);
    let mut hmove = HomingMove::new(vec![x_binding(&rig)], ObserverList::new());
    hmove
        .execute(&mut rig.ctx, [0.0, 0.0, 0.0, 0.0], 50.0, MoveOptions::default())
        .unwrap();
    let samples = hmove.samples().to_vec();
    let homing_moves = count(&rig.sim, |e| matches!(e, SimEvent::HomingMove { .. }));

    let err = hmove
        .execute(&mut rig.ctx, [10.0, 0.0, 0.0, 0.0], 50.0, MoveOptions::default())
        .unwrap_err();

    assert_eq!(err.code(), FaultCode::InvalidCommand);
    assert_eq!(hmove.samples(), samples.as_slice());
    assert_eq!(
        count(&rig.sim, |e| matches!(e, SimEvent::HomingMove { .. })),
        homing_moves
    );
}
