//! Shared rig for the integration tests.

pub mod alignment;
pub mod commands;
pub mod homing_moves;
pub mod policy;
pub mod sessions;

use plumb_common::config::MachineConfig;
use plumb_homing::context::MachineContext;
use plumb_homing::homing::policy::HomingPolicy;
use plumb_homing::sim::{SimEvent, SimMachine};
use tempfile::TempDir;

pub const MACHINE_TOML: &str = r#"
[shared]
log_level = "debug"
service_name = "plumb-it"

[rails.x]
actuators = ["stepper_x"]
endstop = "x"
position_min = 0.0
position_max = 220.0
position_endstop = 0.0
homing_speed = 50.0
homing_retract_dist = 5.0
step_distance = 0.0125

[rails.y]
actuators = ["stepper_y"]
endstop = "y"
position_min = 0.0
position_max = 220.0
position_endstop = 0.0
homing_speed = 50.0
homing_retract_dist = 5.0
step_distance = 0.0125

[rails.z]
actuators = ["stepper_z", "stepper_z1"]
endstop = "z"
position_min = 0.0
position_max = 250.0
position_endstop = 0.0
homing_speed = 10.0
second_homing_speed = 2.0
homing_retract_dist = 5.0
step_distance = 0.0025

[z_align]
quick_speed = 60.0
slow_speed = 20.0
rising_dist = 20.0
safe_rising_dist = 5.0
filter_cnt = 10
timeout = 30.0
retries = 5
retry_tolerance = 10
rotation_distance = 8.0
microsteps = 16
screw_sensors = ["z_left", "z_right"]

[io_remap]
axis = "x"
"#;

/// Simulated machine, its context and a policy writing into a temp dir.
pub struct Rig {
    pub sim: SimMachine,
    pub ctx: MachineContext,
    pub policy: HomingPolicy,
    pub dir: TempDir,
}

pub fn rig() -> Rig {
    rig_with(|_| {})
}

pub fn rig_with(edit: impl FnOnce(&mut MachineConfig)) -> Rig {
    let dir = TempDir::new().unwrap();
    let mut config = MachineConfig::from_toml(MACHINE_TOML).unwrap();
    config.persist.top_of_travel_path = dir.path().join("state").join("real_zmax.json");
    edit(&mut config);
    config.validate().unwrap();

    let sim = SimMachine::new(&config);
    let ctx = sim.context();
    let policy = HomingPolicy::new(config, &ctx).unwrap();
    Rig {
        sim,
        ctx,
        policy,
        dir,
    }
}

pub fn count(sim: &SimMachine, pred: impl Fn(&SimEvent) -> bool) -> usize {
    sim.events().iter().filter(|e| pred(e)).count()
}

pub fn align_sends(sim: &SimMachine) -> usize {
    count(sim, |e| matches!(e, SimEvent::AlignSent { .. }))
}

/// Index of the first event matching `pred`.
pub fn position_of(sim: &SimMachine, pred: impl Fn(&SimEvent) -> bool) -> Option<usize> {
    sim.events().iter().position(|e| pred(e))
}
