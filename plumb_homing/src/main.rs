//! # PLUMB Homing Binary
//!
//! Runs homing and alignment commands against the simulated machine.
//!
//! # Usage
//!
//! ```bash
//! # Full home with alignment
//! plumb_homing --config config/machine.toml HOME
//!
//! # Several commands in one run
//! plumb_homing -c machine.toml ALIGN_Z_BYPASS ENABLE=0 HOME Z RISE_SAFE_Z
//!
//! # Verbose JSON logs
//! plumb_homing -c machine.toml -v --json HOME X Y
//! ```

use clap::Parser;
use plumb_common::config::MachineConfig;
use plumb_common::consts::DEFAULT_CONFIG_PATH;
use plumb_homing::command::Command;
use plumb_homing::homing::policy::HomingPolicy;
use plumb_homing::sim::SimMachine;
use std::path::PathBuf;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

/// PLUMB homing - homing and dual-screw Z alignment on a simulated machine
#[derive(Parser, Debug)]
#[command(name = "plumb_homing")]
#[command(version)]
#[command(about = "Homing and dual-screw Z alignment core, driven against a simulated machine")]
#[command(long_about = None)]
struct Args {
    /// Path to the machine configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the persisted top-of-travel file.
    #[arg(long, value_name = "FILE")]
    state_file: Option<PathBuf>,

    /// Commands to run in order (e.g. `HOME X Y`, `ALIGN_Z_BYPASS ENABLE=0`).
    #[arg(value_name = "COMMAND", trailing_var_arg = true)]
    commands: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("FATAL: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let loaded = MachineConfig::load_validated(&args.config);
    let default_level = loaded
        .as_ref()
        .map_or("info", |c| c.shared.log_level.as_filter());
    setup_tracing(&args, default_level);

    info!("PLUMB homing v{} starting...", env!("CARGO_PKG_VERSION"));
    let mut config = loaded.map_err(|e| {
        error!("failed to load {}: {e}", args.config.display());
        e
    })?;
    if let Some(path) = &args.state_file {
        config.persist.top_of_travel_path = path.clone();
    }

    let commands = Command::parse_script(&args.commands)?;
    if commands.is_empty() {
        warn!("no commands given, nothing to do");
        return Ok(());
    }

    let sim = SimMachine::new(&config);
    let mut ctx = sim.context();
    let mut policy = HomingPolicy::new(config, &ctx)?;

    for command in &commands {
        match command.execute(&mut policy, &mut ctx) {
            Ok(output) => println!("ok: {output}"),
            Err(e) => {
                println!("{}", e.to_fault().to_json());
                return Err(Box::new(e));
            }
        }
    }

    info!("{} command(s) completed", commands.len());
    Ok(())
}

/// Setup tracing subscriber; `--verbose` wins over the configured level.
fn setup_tracing(args: &Args, default_level: &str) {
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
