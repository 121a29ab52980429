use std::path::PathBuf;

use clap::Parser;
use embassy_executor::Spawner;
use log::*;
use static_cell::StaticCell;

use forge_heater::command::{dispatch, Command, HeaterId};
use forge_heater::config::{ConfigError, HeaterConfig};
use forge_heater::heater_controller::HeaterController;
use forge_heater::simulation::{log_state, SimulatedHeater, ThermalModel};
use forge_heater::CONTROL_TICK_MICROS;

/// Run a forge heater against a simulated thermal model, in virtual time.
#[derive(Parser, Debug)]
#[clap(name = "forge-heater-sim", version)]
struct Args {
    /// hotend or bed
    #[clap(long, default_value = "hotend")]
    heater: HeaterId,

    /// Target temperature in °C, overriding the preset
    #[clap(long)]
    target: Option<f32>,

    /// Autotune before regulating
    #[clap(long)]
    autotune: bool,

    /// Maximum tuning cycles
    #[clap(long)]
    cycles: Option<u32>,

    /// Virtual seconds to run
    #[clap(long, default_value_t = 300)]
    seconds: u32,

    /// JSON heater config replacing the preset
    #[clap(long)]
    config: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<HeaterConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => {
            let json = std::fs::read(path).map_err(|e| {
                error!("Cannot read {}: {}", path.display(), e);
                ConfigError::Parse
            })?;
            HeaterConfig::from_json(&json)?
        }
        None => match args.heater {
            HeaterId::Hotend => HeaterConfig::hotend(),
            HeaterId::Bed => HeaterConfig::bed(),
        },
    };
    if let Some(target) = args.target {
        config.controller.target = target;
        config.tuning.target = target;
    }
    if let Some(cycles) = args.cycles {
        config.tuning.max_cycles = cycles;
    }
    config.validate()?;
    Ok(config)
}

#[embassy_executor::task]
async fn simulate(args: Args, config: HeaterConfig) {
    static SIM: StaticCell<SimulatedHeater> = StaticCell::new();
    let model = match args.heater {
        HeaterId::Hotend => ThermalModel::hotend(),
        HeaterId::Bed => ThermalModel::bed(),
    };
    let sim: &'static SimulatedHeater = SIM.init(SimulatedHeater::new(model).with_divider(config.divider));
    let links = args.heater.links();

    let mut controller = match HeaterController::from_config(
        sim.thermistor_input(),
        sim.output(),
        config,
        sim.clock(),
        sim.delay(),
        links,
    )
    .await
    {
        Ok(controller) => controller,
        Err(e) => {
            error!("Bring-up failed: {}", e);
            std::process::exit(1);
        }
    };

    let Some(mut status) = links.status.receiver() else {
        error!("No status receiver available");
        std::process::exit(1);
    };

    if args.autotune {
        if let Err(e) = dispatch(Command::Autotune { target: None }, links) {
            warn!("{}", e);
        }
    }
    if let Err(e) = dispatch(Command::Start, links) {
        warn!("{}", e);
    }

    let ticks = args.seconds as u64 * 1_000_000 / CONTROL_TICK_MICROS as u64;
    for _ in 0..ticks {
        controller.tick().await;
    }
    log_state(sim);

    if let Some(report) = controller.last_tune() {
        info!(
            "Tuned gains: Kp={} Ki={} Kd={} ({:?}, {} cycles)",
            report.gains.kp, report.gains.ki, report.gains.kd, report.status, report.cycles
        );
    }
    match status.try_get() {
        Some(snapshot) => match serde_json_core::to_string::<_, 512>(&snapshot) {
            Ok(json) => println!("{}", json),
            Err(_) => warn!("Status too large to encode"),
        },
        None => warn!("No status published"),
    }
    std::process::exit(0);
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp_nanos()
        .init();

    let args = Args::parse();
    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(2);
        }
    };

    spawner.spawn(simulate(args, config).unwrap());
}
