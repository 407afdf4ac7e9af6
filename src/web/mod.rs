//! Web server module (Axum + API).

pub mod api;
pub mod router;
pub mod server;

use std::sync::Arc;

use crate::events::{EventHub, EventSequencer, SnapshotSource};
use crate::lifecycle::MindLifecycleCoordinator;

pub use server::{run_server, WebServerConfig};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: MindLifecycleCoordinator,
    pub hub: EventHub,
    pub sequencer: Arc<EventSequencer>,
    pub snapshots: Arc<dyn SnapshotSource>,
}
