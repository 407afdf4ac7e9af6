//! The mindfleet daemon: builds every component once, then serves the API,
//! polls the inbox spool, and shuts the fleet down on Ctrl+C or SIGTERM.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::activity::ActivityTracker;
use crate::config::{load_settings_or_default, Settings};
use crate::core::{HistoryStore, Inbox, InboxRetry, SqliteHistory};
use crate::delivery::{DeliveryManager, HttpTransport};
use crate::error::Result;
use crate::events::{ActivityLog, EventHub, EventSequencer, PageSummary, Snapshot, SnapshotSource};
use crate::lifecycle::{DeliverOutcome, LifecycleObserver, MindLifecycleCoordinator, NoServices};
use crate::sleep::SleepManager;
use crate::supervisor::{LaunchSpec, ProcessSupervisor, UnixLauncher};
use crate::web::{run_server, AppState, WebServerConfig};

pub const STATE_DIR: &str = "state";
pub const RESTART_STATE_FILE: &str = "restart-state.json";
pub const SLEEP_STATE_FILE: &str = "sleep-state.json";
pub const HISTORY_FILE: &str = "history.db";
pub const PAGES_DIR: &str = "pages";

const SNAPSHOT_CONVERSATIONS: usize = 20;
const SNAPSHOT_PAGES: usize = 20;

/// State sent first on every event stream.
pub struct FleetSnapshot {
    history: Arc<dyn HistoryStore>,
    activity_log: ActivityLog,
    activity: ActivityTracker,
    pages_dir: PathBuf,
}

impl SnapshotSource for FleetSnapshot {
    fn snapshot(&self) -> Snapshot {
        let conversations = self
            .history
            .recent_conversations(SNAPSHOT_CONVERSATIONS)
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to read recent conversations: {}", e);
                Vec::new()
            });

        Snapshot {
            conversations,
            recent_activity: self.activity_log.recent(),
            active_minds: self.activity.active_minds(),
            recent_pages: recent_pages(&self.pages_dir, SNAPSHOT_PAGES),
        }
    }
}

/// Most recently modified files under `dir`, newest first.
pub fn recent_pages(dir: &Path, limit: usize) -> Vec<PageSummary> {
    let mut pages = Vec::new();
    collect_pages(dir, dir, &mut pages);
    pages.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
    pages.truncate(limit);
    pages
}

fn collect_pages(root: &Path, dir: &Path, out: &mut Vec<PageSummary>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if meta.is_dir() {
            collect_pages(root, &path, out);
        } else if let Ok(modified) = meta.modified() {
            let relative = path.strip_prefix(root).unwrap_or(&path);
            out.push(PageSummary {
                path: relative.to_string_lossy().to_string(),
                modified: DateTime::<Utc>::from(modified),
            });
        }
    }
}

/// Hand over every due spooled message; returns how many left the spool.
/// Messages for minds that are not running, or that failed, go back with a backoff.
pub async fn poll_inbox_once(
    inbox: &Inbox,
    coordinator: &MindLifecycleCoordinator,
    retry: &InboxRetry,
) -> usize {
    let claimed = match inbox.claim() {
        Ok(claimed) => claimed,
        Err(e) => {
            tracing::warn!("Failed to read inbox: {}", e);
            return 0;
        }
    };

    let mut handed_over = 0;
    for entry in claimed {
        let (id, mind) = (entry.entry.id.clone(), entry.entry.mind.clone());
        let outcome = coordinator.deliver(&mind, entry.entry.payload.clone()).await;
        let result = match outcome {
            DeliverOutcome::Delivered | DeliverOutcome::Queued | DeliverOutcome::Waking => {
                handed_over += 1;
                inbox.ack(entry)
            }
            DeliverOutcome::NotRunning | DeliverOutcome::Failed => {
                inbox.release(entry, retry).map(|_| ())
            }
        };
        tracing::debug!(id = %id, mind = %mind, ?outcome, "processed spooled message");
        if let Err(e) = result {
            tracing::warn!(id = %id, "Failed to update inbox entry: {}", e);
        }
    }
    handed_over
}

async fn run_inbox_poller(
    inbox: Inbox,
    coordinator: MindLifecycleCoordinator,
    interval: Duration,
    retry: InboxRetry,
    mut shutdown: watch::Receiver<bool>,
) {
    tracing::info!("Inbox poller watching {}", inbox.dir().display());
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        poll_inbox_once(&inbox, &coordinator, &retry).await;
    }
    tracing::info!("Inbox poller stopped");
}

/// Fully wired daemon.
pub struct Daemon {
    settings: Settings,
    hub: EventHub,
    sequencer: Arc<EventSequencer>,
    coordinator: MindLifecycleCoordinator,
    snapshots: Arc<FleetSnapshot>,
    inbox: Inbox,
}

impl Daemon {
    pub fn build(home: &Path, settings: Settings) -> Result<Self> {
        let state_dir = home.join(STATE_DIR);
        std::fs::create_dir_all(&state_dir)?;

        let hub = EventHub::new();
        let activity_log = ActivityLog::attach(&hub, settings.activity.recent_events);
        let activity = ActivityTracker::new(
            hub.clone(),
            Duration::from_millis(settings.activity.idle_after_ms),
        );

        let launcher = Arc::new(UnixLauncher::new(Duration::from_millis(
            settings.supervisor.liveness_poll_ms,
        )));
        let supervisor = ProcessSupervisor::new(
            launcher,
            &settings.supervisor,
            Some(state_dir.join(RESTART_STATE_FILE)),
        );
        supervisor.set_observer(Arc::new(LifecycleObserver::new(activity.clone(), hub.clone())));

        let daemon_url = settings.daemon.base_url();
        for (name, mind) in &settings.minds {
            for spec in LaunchSpec::for_mind(home, name, mind, &daemon_url) {
                supervisor.register(spec);
            }
        }

        let history: Arc<dyn HistoryStore> =
            Arc::new(SqliteHistory::open(&state_dir.join(HISTORY_FILE))?);
        let transport = Arc::new(HttpTransport::new(Duration::from_millis(
            settings.delivery.timeout_ms,
        ))?);
        let delivery = DeliveryManager::new(
            supervisor.clone(),
            activity.clone(),
            hub.clone(),
            history.clone(),
            transport,
        );

        let sleep = SleepManager::new(
            supervisor.clone(),
            delivery.clone(),
            activity.clone(),
            hub.clone(),
            &settings.delivery,
            Some(state_dir.join(SLEEP_STATE_FILE)),
        );
        for (name, mind) in &settings.minds {
            sleep.set_wake_trigger(name, mind.wake_trigger.clone());
        }

        let coordinator = MindLifecycleCoordinator::new(
            supervisor,
            sleep,
            delivery,
            activity.clone(),
            hub.clone(),
            Arc::new(NoServices),
        );

        let snapshots = Arc::new(FleetSnapshot {
            history,
            activity_log,
            activity,
            pages_dir: home.join(PAGES_DIR),
        });

        Ok(Self {
            settings,
            hub,
            sequencer: Arc::new(EventSequencer::new()),
            coordinator,
            snapshots,
            inbox: Inbox::new(home),
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            coordinator: self.coordinator.clone(),
            hub: self.hub.clone(),
            sequencer: self.sequencer.clone(),
            snapshots: self.snapshots.clone(),
        }
    }

    pub fn coordinator(&self) -> &MindLifecycleCoordinator {
        &self.coordinator
    }

    /// Run until Ctrl+C or SIGTERM, then stop every mind.
    pub async fn run(self) -> Result<()> {
        let autostart: Vec<String> = self
            .settings
            .minds
            .iter()
            .filter(|(_, m)| m.autostart)
            .map(|(name, _)| name.clone())
            .collect();
        self.coordinator.boot(&autostart).await;

        match self.inbox.recover_orphaned() {
            Ok(0) => {}
            Ok(n) => tracing::info!("Returned {} interrupted inbox message(s) to the spool", n),
            Err(e) => tracing::warn!("Failed to recover inbox: {}", e),
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = tokio::spawn(run_inbox_poller(
            self.inbox.clone(),
            self.coordinator.clone(),
            Duration::from_millis(self.settings.daemon.inbox_poll_ms),
            InboxRetry::from_config(&self.settings.daemon),
            shutdown_rx,
        ));

        let config = WebServerConfig {
            host: self.settings.daemon.host.clone(),
            port: self.settings.daemon.port,
        };
        let result = run_server(config, self.app_state(), shutdown_signal()).await;

        let _ = shutdown_tx.send(true);
        if let Err(e) = poller.await {
            tracing::warn!("Inbox poller ended abnormally: {}", e);
        }
        self.coordinator.shutdown().await;
        tracing::info!("Daemon stopped");
        result
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

/// Run the daemon in the foreground.
pub async fn run_daemon(home: &Path) -> Result<()> {
    tracing::info!("Starting mindfleet daemon in {}", home.display());
    let settings = load_settings_or_default(home);
    Daemon::build(home, settings)?.run().await
}
