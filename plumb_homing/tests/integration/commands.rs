//! Integration test: parsed command scripts driving the policy.

use super::{align_sends, rig};
use plumb_common::axis::AxisSet;
use plumb_common::error::FaultCode;
use plumb_homing::command::{Command, CommandOutput};

#[test]
fn script_runs_in_order() {
    let mut rig = rig();
    let script = Command::parse_script(&["ALIGN_Z_BYPASS", "ENABLE=0", "HOME", "Z", "HOME", "X", "Y"])
        .unwrap();
    assert_eq!(script.len(), 3);

    let outputs: Vec<CommandOutput> = script
        .iter()
        .map(|c| c.execute(&mut rig.policy, &mut rig.ctx).unwrap())
        .collect();

    assert_eq!(outputs[0], CommandOutput::BypassSet { enabled: false });
    match &outputs[1] {
        CommandOutput::Homed(report) => {
            assert_eq!(report.axes, AxisSet::Z);
            assert_eq!(report.alignment_delta, None);
        }
        other => panic!("unexpected {other:?}"),
    }
    match &outputs[2] {
        CommandOutput::Homed(report) => assert_eq!(report.axes, AxisSet::X | AxisSet::Y),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(align_sends(&rig.sim), 0);
    assert!(rig.sim.world().homed.contains(AxisSet::XYZ));
}

#[test]
fn aligned_home_reports_top_of_travel() {
    let mut rig = rig();
    let cmd: Command = "home".parse().unwrap();

    let output = cmd.execute(&mut rig.policy, &mut rig.ctx).unwrap();

    let text = output.to_string();
    assert!(text.starts_with("homed XYZ"), "{text}");
    assert!(text.contains("deltaError 0"), "{text}");
    assert!(text.contains("top-of-travel 240.0"), "{text}");
}

#[test]
fn fault_renders_as_json() {
    let mut rig = rig();
    rig.sim.set_dead("x", true);
    let cmd: Command = "HOME X".parse().unwrap();

    let err = cmd.execute(&mut rig.policy, &mut rig.ctx).unwrap_err();

    assert_eq!(err.code(), FaultCode::TriggerMissing);
    let json = err.to_fault().to_json();
    assert!(json.contains("\"TRIGGER_MISSING\""), "{json}");
    assert!(json.contains("\"sensor\":\"x\""), "{json}");
}

#[test]
fn calibration_command_reports_position() {
    let mut rig = rig();
    let cmd: Command = "CALIBRATE_Z_SENSORLESS DISTANCE=200".parse().unwrap();

    match cmd.execute(&mut rig.policy, &mut rig.ctx).unwrap() {
        CommandOutput::Calibrated { position } => assert_eq!(position[2], 197.0),
        other => panic!("unexpected {other:?}"),
    }
}
