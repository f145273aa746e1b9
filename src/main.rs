//! Thin process wrapper around [`db_air_bridge::Engine`]: parse and
//! validate configuration, initialize logging, install the termination
//! handler, bootstrap the engine's endpoints, and run until signaled.

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use db_air_bridge::config::{Args, Config};
use db_air_bridge::engine::Engine;
use db_air_bridge::error::DbError;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = match Config::from_args(args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> Result<(), DbError> {
    let run_flag = Arc::new(AtomicBool::new(true));
    let handler_flag = run_flag.clone();
    ctrlc::set_handler(move || {
        log::info!("termination signal received, finishing current pass");
        handler_flag.store(false, Ordering::Relaxed);
    })
    .expect("failed to install termination signal handler");

    log::info!(
        "starting db-air-bridge: {} adapter(s), control serial '{}', protocol {:?}",
        config.adapters.len(),
        config.control_serial_path,
        config.serial_protocol
    );

    let mut engine = Engine::bootstrap(config, run_flag)?;
    engine.run();

    log::info!("shutdown complete");
    Ok(())
}
