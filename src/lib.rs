//! mindfleet library root.

pub mod activity;
pub mod cli;
pub mod config;
pub mod core;
pub mod daemon;
pub mod delivery;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod logging;
pub mod sleep;
pub mod supervisor;
pub mod web;

#[cfg(test)]
mod testing;

pub use activity::ActivityTracker;
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{Content, DeliveryPayload, MindRef};
pub use daemon::run_daemon;
pub use delivery::DeliveryManager;
pub use error::{Error, Result};
pub use events::{EventBus, EventHub};
pub use lifecycle::MindLifecycleCoordinator;
pub use sleep::SleepManager;
pub use supervisor::{ProcessSupervisor, RestartTracker};
pub use web::run_server;
