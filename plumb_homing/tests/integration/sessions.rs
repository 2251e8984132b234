//! Integration test: multi-pass axis-group homes.

use super::{position_of, rig, rig_with};
use plumb_common::axis::{Axis, AxisSet};
use plumb_common::error::HomingError;
use plumb_homing::events::RailsEvent;
use plumb_homing::homing::policy::plan_axis_home;
use plumb_homing::homing::session::HomingSession;
use plumb_homing::sim::SimEvent;
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn retract_backs_off_along_the_first_pass_vector() {
    let mut rig = rig();
    let rail = rig.policy.rail(Axis::X).clone();
    let (forced, target) = plan_axis_home(Axis::X, rail.config());
    let mut session = HomingSession::new(AxisSet::X).unwrap();

    session
        .home_axis_group(&mut rig.ctx, &[&rail], forced, target)
        .unwrap();

    let moves: Vec<_> = rig
        .sim
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::Move { target, speed } => Some((target, speed)),
            _ => None,
        })
        .collect();
    assert_eq!(moves.len(), 1);
    let (retract, speed) = moves[0];
    assert!((retract[0] - 5.0).abs() < 1e-9);
    assert_eq!(&retract[1..], &[0.0, 0.0, 0.0]);
    assert_eq!(speed, 5.0);

    let homing_moves: Vec<_> = rig
        .sim
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::HomingMove { speed, triggered, .. } => Some((speed, triggered)),
            _ => None,
        })
        .collect();
    assert_eq!(
        homing_moves,
        vec![(50.0, Some("x".to_string())), (25.0, Some("x".to_string()))]
    );

    let x = rig.ctx.motion.position()[0];
    assert!((x + 0.0375).abs() < 1e-9, "x homed at {x}");
    assert!(rig.sim.world().homed.has(Axis::X));
    assert!(session.trigger_position("stepper_x").is_some());
}

#[test]
fn rail_observers_can_adjust_actuators() {
    let mut rig = rig();
    let rail = rig.policy.rail(Axis::X).clone();
    let (forced, target) = plan_axis_home(Axis::X, rail.config());
    let mut session = HomingSession::new(AxisSet::X).unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = seen.clone();
    session
        .rails_observers_mut()
        .register(move |e: &RailsEvent| {
            match e {
                RailsEvent::Begin { axes } => sink.borrow_mut().push(format!("begin {axes:?}")),
                RailsEvent::End {
                    trigger_positions, ..
                } => {
                    sink.borrow_mut()
                        .push(format!("end {}", trigger_positions.len()));
                    e.set_adjustment("stepper_x", 80.0);
                }
            }
            Ok(())
        });

    session
        .home_axis_group(&mut rig.ctx, &[&rail], forced, target)
        .unwrap();

    assert_eq!(seen.borrow().len(), 2);
    assert!(seen.borrow()[0].starts_with("begin"));
    assert_eq!(seen.borrow()[1], "end 1");
    assert_eq!(session.position_adjustments().get("stepper_x"), Some(&80.0));
    // 80 steps of 0.0125 mm on top of the homed position.
    let x = rig.ctx.motion.position()[0];
    assert!((x - (1.0 - 0.0375)).abs() < 1e-9, "x adjusted to {x}");
}

#[test]
fn stuck_horizontal_sensor_triggers_emergency_stop() {
    let mut rig = rig();
    rig.sim.set_stuck("x", true);
    let rail = rig.policy.rail(Axis::X).clone();
    let (forced, target) = plan_axis_home(Axis::X, rail.config());
    let mut session = HomingSession::new(AxisSet::X).unwrap();

    let err = session
        .home_axis_group(&mut rig.ctx, &[&rail], forced, target)
        .unwrap_err();
    assert_eq!(
        err,
        HomingError::SpuriousTriggerAfterRetract {
            sensor: "x".to_string()
        }
    );

    let hold = position_of(&rig.sim, |e| *e == SimEvent::HoldAndFlush).unwrap();
    let query = position_of(&rig.sim, |e| *e == SimEvent::QueryProtection).unwrap();
    let fault = position_of(&rig.sim, |e| {
        *e == SimEvent::FaultReportMode(vec!["stepper_x".to_string()])
    })
    .unwrap();
    assert!(hold < query && query < fault);
}

#[test]
fn stuck_vertical_sensor_is_tolerated() {
    let mut rig = rig();
    rig.sim.set_stuck("z", true);
    let rail = rig.policy.rail(Axis::Z).clone();
    let (forced, target) = plan_axis_home(Axis::Z, rail.config());
    let mut session = HomingSession::new(AxisSet::Z).unwrap();

    session
        .home_axis_group(&mut rig.ctx, &[&rail], forced, target)
        .unwrap();
    assert!(session.full_travel_no_trigger());
    assert!(position_of(&rig.sim, |e| *e == SimEvent::HoldAndFlush).is_none());
}

#[test]
fn vertical_travel_is_net_primary_motion() {
    let mut rig = rig();
    let rail = rig.policy.rail(Axis::Z).clone();
    let (forced, target) = plan_axis_home(Axis::Z, rail.config());
    let mut session = HomingSession::new(AxisSet::Z).unwrap();

    // Screws start mid-travel at 125 mm.
    session
        .home_axis_group(&mut rig.ctx, &[&rail], forced, target)
        .unwrap();

    let travel = session.cumulative_z_travel();
    assert!((travel - 125.0075).abs() < 1e-6, "travel {travel}");
    assert!(!session.full_travel_no_trigger());
    assert!(session.trigger_position("stepper_z").is_some());
    assert!(session.trigger_position("stepper_z1").is_some());
}

fn homing_move_speeds(rig: &super::Rig) -> Vec<f64> {
    rig.sim
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SimEvent::HomingMove { speed, .. } => Some(speed),
            _ => None,
        })
        .collect()
}

#[test]
fn sensorless_pass_tolerates_a_silent_vertical_sensor() {
    let mut rig = rig_with(|c| c.rails.z.homing_retract_dist = 0.0);
    rig.sim.set_dead("z", true);
    let rail = rig.policy.rail(Axis::Z).clone();
    let (forced, target) = plan_axis_home(Axis::Z, rail.config());
    let mut session = HomingSession::new(AxisSet::Z).unwrap();
    session.set_sensorless(true);

    session
        .home_axis_group(&mut rig.ctx, &[&rail], forced, target)
        .unwrap();

    assert!(session.full_travel_no_trigger());
    // Four times the 10 mm/s homing speed, single pass.
    assert_eq!(homing_move_speeds(&rig), vec![40.0]);
    assert_eq!(
        rig.sim.events().into_iter().find_map(|e| match e {
            SimEvent::HomingMove { triggered, .. } => Some(triggered),
            _ => None,
        }),
        Some(None)
    );
}

#[test]
fn refine_pass_still_requires_a_trigger() {
    let mut rig = rig();
    rig.sim.set_dead("z", true);
    let rail = rig.policy.rail(Axis::Z).clone();
    let (forced, target) = plan_axis_home(Axis::Z, rail.config());
    let mut session = HomingSession::new(AxisSet::Z).unwrap();
    session.set_sensorless(true);

    let err = session
        .home_axis_group(&mut rig.ctx, &[&rail], forced, target)
        .unwrap_err();

    assert_eq!(
        err,
        HomingError::TriggerMissing {
            sensor: "z".to_string()
        }
    );
    assert!(session.full_travel_no_trigger());
    assert_eq!(homing_move_speeds(&rig), vec![40.0, 2.0]);
}
