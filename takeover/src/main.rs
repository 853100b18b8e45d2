#![warn(clippy::pedantic)]

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use takeover::server::Echo;
use takeover::{Config, Outcome};

fn main() -> ExitCode {
    let config = Config::parse();
    if let Err(err) = simple_logger::init_with_level(config.log_level) {
        eprintln!("failed to initialize logger: {err}");
        return ExitCode::FAILURE;
    }
    info!("config: {:?}", config);

    let exit = Arc::new(AtomicBool::new(false));
    let handler_exit = Arc::clone(&exit);
    if let Err(err) = ctrlc::set_handler(move || handler_exit.store(true, Ordering::SeqCst)) {
        error!("failed to set signal handler: {}", err);
        return ExitCode::FAILURE;
    }

    match takeover::run(&config, Arc::new(Echo::new(config.greeting.clone())), &exit) {
        Ok(Outcome::HandedOff { connections }) => {
            info!("handed off {} connections, exiting", connections);
            ExitCode::SUCCESS
        }
        Ok(Outcome::Shutdown) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
