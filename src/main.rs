//! mindfleet - supervisor daemon for a fleet of long-running AI minds.

use clap::Parser;
use std::process::ExitCode;

mod activity;
mod cli;
mod config;
mod core;
mod daemon;
mod delivery;
mod error;
mod events;
mod lifecycle;
mod logging;
mod sleep;
mod supervisor;
mod web;

#[cfg(test)]
mod testing;

use cli::Commands;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args = Commands::parse();

    let home = match args.home() {
        Ok(home) => home,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // The guard flushes the daemon log on exit
    let _guard = match logging::init(&home, args.log_mode()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Run the command
    match args.run(&home).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
