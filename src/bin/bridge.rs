//! Process entry point: loads the bridge configuration, starts the meter
//! orchestrator, and waits for SIGINT/SIGTERM to shut everything down
//! gracefully.

use std::env;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::{error, info};

use dlms_meter_bridge::config::{load_config, BridgeConfig};
use dlms_meter_bridge::error::BridgeError;
use dlms_meter_bridge::orchestrator::Orchestrator;

const DEFAULT_CONFIG_PATH: &str = "./dlms-bridge.toml";

fn config_path() -> String {
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            if let Some(path) = args.next() {
                return path;
            }
        }
    }
    env::var("DLMS_BRIDGE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
}

fn validate(config: &BridgeConfig) -> Result<(), BridgeError> {
    if config.meters.is_empty() {
        return Err(BridgeError::NoMeters);
    }
    for meter in &config.meters {
        if meter.enabled_measurements().is_empty() {
            return Err(BridgeError::NoMeasurements(meter.name.clone()));
        }
    }
    Ok(())
}

fn run() -> Result<(), BridgeError> {
    dlms_meter_bridge::init_logging(log::LevelFilter::Info);

    let path = config_path();
    info!("loading configuration from {path}");
    let config = load_config(&path)?;
    validate(&config)?;

    let orchestrator = Arc::new(Orchestrator::new(&config));
    orchestrator.start();

    let health_orchestrator = Arc::clone(&orchestrator);
    let health_thread = thread::spawn(move || health_orchestrator.health_check_loop());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;

    info!("bridge running, waiting for shutdown signal");
    rx.recv().ok();

    info!("shutdown signal received");
    orchestrator.stop();
    let _ = health_thread.join();

    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}
