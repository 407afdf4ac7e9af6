//! Top-level mind lifecycle: full start/stop, sleep/wake, and the never-failing
//! delivery entrypoint used by every message source.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::activity::ActivityTracker;
use crate::core::{DeliveryPayload, MindRef};
use crate::delivery::{DeliveryManager, DeliveryStatus};
use crate::error::Result;
use crate::events::{ActivityEvent, ActivityKind, EventHub, LifecycleState, MindEvent};
use crate::sleep::{GateOutcome, SleepManager, WakeOptions, WakeResult};
use crate::supervisor::{ExitReport, InstanceStatus, ProcessSupervisor, SupervisorObserver};

/// Per-mind services that outlive the compute process: channel connectors,
/// schedules, and budget tracking. Sleep leaves them running; a full stop
/// does not.
#[async_trait]
pub trait MindServices: Send + Sync {
    async fn start(&self, name: &str) -> Result<()>;
    async fn stop(&self, name: &str) -> Result<()>;
}

/// Used when no connectors or schedules are wired in.
pub struct NoServices;

#[async_trait]
impl MindServices for NoServices {
    async fn start(&self, name: &str) -> Result<()> {
        tracing::debug!(mind = %name, "no services to start");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        tracing::debug!(mind = %name, "no services to stop");
        Ok(())
    }
}

/// Turns supervision transitions into activity and lifecycle events.
pub struct LifecycleObserver {
    activity: ActivityTracker,
    hub: EventHub,
}

impl LifecycleObserver {
    pub fn new(activity: ActivityTracker, hub: EventHub) -> Self {
        Self { activity, hub }
    }

    fn lifecycle(&self, key: &str, state: LifecycleState) {
        self.hub
            .mind
            .publish(&key.to_string(), &MindEvent::Lifecycle { state });
    }
}

impl SupervisorObserver for LifecycleObserver {
    fn on_started(&self, key: &str) {
        self.lifecycle(key, LifecycleState::Started);
        self.hub
            .publish_activity(ActivityEvent::new(key, ActivityKind::MindStarted));
    }

    fn on_exit(&self, key: &str, report: &ExitReport) {
        self.activity.mark_idle(key);

        let (state, kind) = match report {
            ExitReport::Stopped | ExitReport::Clean | ExitReport::RestartRequested => {
                (LifecycleState::Stopped, ActivityKind::MindStopped)
            }
            ExitReport::Crashed { attempt, delay_ms } => (
                LifecycleState::Crashed,
                ActivityKind::MindCrashed {
                    attempt: *attempt,
                    restart_in_ms: Some(*delay_ms),
                },
            ),
            ExitReport::Exhausted { attempts } => (
                LifecycleState::Crashed,
                ActivityKind::MindCrashed {
                    attempt: *attempts,
                    restart_in_ms: None,
                },
            ),
        };
        self.lifecycle(key, state);
        self.hub.publish_activity(ActivityEvent::new(key, kind));
    }
}

/// Result of the delivery entrypoint.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliverOutcome {
    Delivered,
    /// Held for a sleeping mind.
    Queued,
    /// Held for a sleeping mind that is now waking.
    Waking,
    NotRunning,
    Failed,
}

impl From<DeliveryStatus> for DeliverOutcome {
    fn from(status: DeliveryStatus) -> Self {
        match status {
            DeliveryStatus::Delivered => DeliverOutcome::Delivered,
            DeliveryStatus::NotRunning => DeliverOutcome::NotRunning,
            DeliveryStatus::Failed => DeliverOutcome::Failed,
        }
    }
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MindStatus {
    pub name: String,
    pub port: u16,
    pub process: InstanceStatus,
    pub pid: Option<u32>,
    pub sleeping: bool,
    pub queued: usize,
    pub active: bool,
    pub restart_attempts: u32,
}

#[derive(Clone)]
pub struct MindLifecycleCoordinator {
    supervisor: ProcessSupervisor,
    sleep: SleepManager,
    delivery: DeliveryManager,
    activity: ActivityTracker,
    hub: EventHub,
    services: Arc<dyn MindServices>,
}

impl MindLifecycleCoordinator {
    pub fn new(
        supervisor: ProcessSupervisor,
        sleep: SleepManager,
        delivery: DeliveryManager,
        activity: ActivityTracker,
        hub: EventHub,
        services: Arc<dyn MindServices>,
    ) -> Self {
        Self {
            supervisor,
            sleep,
            delivery,
            activity,
            hub,
            services,
        }
    }

    /// Start services and the process. A sleeping mind is woken instead, which
    /// also delivers its queue.
    pub async fn start_mind_full(&self, name: &str) -> Result<()> {
        let mind = MindRef::parse(name)?;
        let key = mind.key();
        self.supervisor.spec(&key)?;

        if mind.variant.is_none() {
            self.services.start(&mind.base).await?;
            if self.sleep.is_sleeping(&mind.base) {
                self.wake_mind(&mind.base).await?;
                return Ok(());
            }
        }

        self.supervisor.start_mind(&key).await
    }

    /// Stop everything: services, process, sleep queue, activity, restart budget.
    pub async fn stop_mind_full(&self, name: &str) -> Result<()> {
        let mind = MindRef::parse(name)?;
        let key = mind.key();
        self.supervisor.spec(&key)?;

        if mind.variant.is_none() {
            self.sleep.clear(&mind.base);
            if let Err(e) = self.services.stop(&mind.base).await {
                tracing::warn!(mind = %key, "Failed to stop services: {}", e);
            }
        }

        let outcome = self.supervisor.stop_mind(&key).await?;
        tracing::info!(mind = %key, ?outcome, "mind stopped");
        self.activity.mark_idle(&key);
        self.supervisor.reset_restarts(&key);
        Ok(())
    }

    /// Pause the compute process only.
    pub async fn sleep_mind(&self, name: &str) -> Result<()> {
        let base = MindRef::parse(name)?.base;
        self.supervisor.spec(&base)?;
        self.sleep.sleep_mind(&base).await?;
        self.hub.mind.publish(
            &base,
            &MindEvent::Lifecycle {
                state: LifecycleState::Sleeping,
            },
        );
        Ok(())
    }

    pub async fn wake_mind(&self, name: &str) -> Result<WakeResult> {
        let base = MindRef::parse(name)?.base;
        self.supervisor.spec(&base)?;
        self.hub.mind.publish(
            &base,
            &MindEvent::Lifecycle {
                state: LifecycleState::Waking,
            },
        );
        self.sleep.initiate_wake(&base, WakeOptions::manual()).await
    }

    /// Delivery entrypoint for connectors, the CLI, schedules and relays.
    /// Never fails; problems are logged and reflected in the outcome.
    pub async fn deliver(&self, name: &str, payload: DeliveryPayload) -> DeliverOutcome {
        let mind = match MindRef::parse(name) {
            Ok(mind) => mind,
            Err(e) => {
                tracing::warn!("Dropping message: {}", e);
                return DeliverOutcome::Failed;
            }
        };
        let key = mind.key();
        if !self.supervisor.is_registered(&key) {
            tracing::warn!(mind = %key, "Dropping message for unknown mind");
            return DeliverOutcome::Failed;
        }

        if mind.variant.is_none() {
            match self.sleep.handle_inbound(&key, &payload) {
                GateOutcome::Queued => return DeliverOutcome::Queued,
                GateOutcome::Waking => return DeliverOutcome::Waking,
                GateOutcome::Awake => {}
            }
        }

        self.delivery.route_and_deliver(&key, &payload).await.into()
    }

    /// Event reported by a mind about its own turn.
    pub fn record_mind_event(&self, name: &str, event: &MindEvent) -> Result<()> {
        let key = MindRef::parse(name)?.key();
        self.supervisor.spec(&key)?;
        self.delivery.report(&key, event);
        Ok(())
    }

    pub fn status(&self) -> Vec<MindStatus> {
        self.supervisor
            .keys()
            .into_iter()
            .filter_map(|key| {
                let spec = self.supervisor.spec(&key).ok()?;
                let is_base = spec.mind.variant.is_none();
                Some(MindStatus {
                    port: spec.port,
                    process: self.supervisor.status(&key),
                    pid: self.supervisor.pid(&key),
                    sleeping: is_base && self.sleep.is_sleeping(&key),
                    queued: if is_base { self.sleep.queue_len(&key) } else { 0 },
                    active: self.activity.is_active(&key),
                    restart_attempts: self.supervisor.restart_attempts(&key),
                    name: key,
                })
            })
            .collect()
    }

    /// Start autostart minds, except those that went to sleep before the last shutdown.
    pub async fn boot(&self, autostart: &[String]) {
        for name in autostart {
            if self.sleep.is_sleeping(name) {
                tracing::info!(mind = %name, queued = self.sleep.queue_len(name), "mind is asleep; not starting");
                if let Err(e) = self.services.start(name).await {
                    tracing::warn!(mind = %name, "Failed to start services: {}", e);
                }
                continue;
            }
            if let Err(e) = self.start_mind_full(name).await {
                tracing::error!(mind = %name, "Failed to start: {}", e);
            }
        }
    }

    pub async fn shutdown(&self) {
        tracing::info!("Shutting down minds");
        self.activity.stop_all();
        self.supervisor.stop_all().await;
        for key in self.supervisor.keys() {
            if !key.contains('@') {
                if let Err(e) = self.services.stop(&key).await {
                    tracing::warn!(mind = %key, "Failed to stop services: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryConfig, SupervisorConfig};
    use crate::core::{Content, InMemoryHistory};
    use crate::error::Error;
    use crate::events::GlobalTopic;
    use crate::sleep::WakeTrigger;
    use crate::supervisor::ExitOutcome;
    use crate::testing::{eventually, test_spec, FakeLauncher, RecordingTransport};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingServices {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MindServices for RecordingServices {
        async fn start(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("start {}", name));
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("stop {}", name));
            Ok(())
        }
    }

    struct Fixture {
        coordinator: MindLifecycleCoordinator,
        supervisor: ProcessSupervisor,
        sleep: SleepManager,
        launcher: FakeLauncher,
        transport: RecordingTransport,
        services: Arc<RecordingServices>,
        hub: EventHub,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let hub = EventHub::new();
        let launcher = FakeLauncher::new();
        let supervisor = ProcessSupervisor::new(
            Arc::new(launcher.clone()),
            &SupervisorConfig {
                base_delay_ms: 1000,
                ..SupervisorConfig::default()
            },
            None,
        );
        supervisor.register(test_spec(dir.path(), "m", 4100));
        supervisor.register(test_spec(dir.path(), "m@exp", 4101));
        let activity = ActivityTracker::new(hub.clone(), Duration::from_secs(120));
        supervisor.set_observer(Arc::new(LifecycleObserver::new(activity.clone(), hub.clone())));

        let transport = RecordingTransport::new();
        let delivery = DeliveryManager::new(
            supervisor.clone(),
            activity.clone(),
            hub.clone(),
            Arc::new(InMemoryHistory::new()),
            Arc::new(transport.clone()),
        );
        let sleep = SleepManager::new(
            supervisor.clone(),
            delivery.clone(),
            activity.clone(),
            hub.clone(),
            &DeliveryConfig::default(),
            None,
        );
        let services = Arc::new(RecordingServices::default());
        let coordinator = MindLifecycleCoordinator::new(
            supervisor.clone(),
            sleep.clone(),
            delivery,
            activity,
            hub.clone(),
            services.clone(),
        );
        Fixture {
            coordinator,
            supervisor,
            sleep,
            launcher,
            transport,
            services,
            hub,
            _dir: dir,
        }
    }

    fn msg(channel: &str, text: &str) -> DeliveryPayload {
        DeliveryPayload::new(channel, Some("ada"), Content::text(text))
    }

    fn record_activity(hub: &EventHub) -> Arc<Mutex<Vec<ActivityKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.activity
            .subscribe(GlobalTopic, move |e: &ActivityEvent| {
                sink.lock().unwrap().push(e.kind.clone());
                Ok(())
            })
            .detach();
        seen
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeping_mind_wakes_on_trigger_and_delivers_in_order() {
        let f = fixture();
        f.sleep.set_wake_trigger(
            "m",
            WakeTrigger::Channel {
                channel: "dm".to_string(),
            },
        );
        f.coordinator.start_mind_full("m").await.unwrap();
        f.coordinator.sleep_mind("m").await.unwrap();
        assert!(!f.supervisor.is_running("m"));

        let outcome = f.coordinator.deliver("m", msg("group", "from the group")).await;
        assert_eq!(outcome, DeliverOutcome::Queued);
        assert!(f.sleep.is_sleeping("m"));
        assert!(!f.supervisor.is_running("m"));

        let outcome = f.coordinator.deliver("m", msg("dm", "direct")).await;
        assert_eq!(outcome, DeliverOutcome::Waking);

        eventually(|| !f.sleep.is_sleeping("m")).await;
        assert!(f.supervisor.is_running("m"));
        assert_eq!(f.transport.texts(4100), vec!["from the group", "direct"]);
        assert_eq!(f.launcher.spawn_count("m"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deliver_never_fails() {
        let f = fixture();
        assert_eq!(f.coordinator.deliver("ghost", msg("dm", "x")).await, DeliverOutcome::Failed);
        assert_eq!(f.coordinator.deliver("@", msg("dm", "x")).await, DeliverOutcome::Failed);
        assert_eq!(f.coordinator.deliver("m", msg("dm", "x")).await, DeliverOutcome::NotRunning);

        f.coordinator.start_mind_full("m").await.unwrap();
        f.transport.fail_next(4100, 1);
        assert_eq!(f.coordinator.deliver("m", msg("dm", "x")).await, DeliverOutcome::Failed);
        assert_eq!(f.coordinator.deliver("m", msg("dm", "y")).await, DeliverOutcome::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_variants_are_not_gated_by_base_sleep() {
        let f = fixture();
        f.coordinator.start_mind_full("m@exp").await.unwrap();
        f.coordinator.sleep_mind("m").await.unwrap();

        let outcome = f.coordinator.deliver("m@exp", msg("dm", "to variant")).await;
        assert_eq!(outcome, DeliverOutcome::Delivered);
        assert_eq!(f.transport.texts(4101), vec!["to variant"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_keeps_services_but_full_stop_does_not() {
        let f = fixture();
        f.coordinator.start_mind_full("m").await.unwrap();
        f.coordinator.sleep_mind("m").await.unwrap();
        assert_eq!(*f.services.calls.lock().unwrap(), vec!["start m"]);

        f.sleep.set_wake_trigger("m", WakeTrigger::Never);
        f.coordinator.deliver("m", msg("dm", "queued")).await;
        f.coordinator.stop_mind_full("m").await.unwrap();

        assert_eq!(*f.services.calls.lock().unwrap(), vec!["start m", "stop m"]);
        assert!(!f.sleep.is_sleeping("m"));
        assert_eq!(f.sleep.queue_len("m"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_full_wakes_sleeping_mind() {
        let f = fixture();
        f.sleep.set_wake_trigger("m", WakeTrigger::Never);
        f.coordinator.start_mind_full("m").await.unwrap();
        f.coordinator.sleep_mind("m").await.unwrap();
        f.coordinator.deliver("m", msg("dm", "held")).await;

        f.coordinator.start_mind_full("m").await.unwrap();
        assert!(!f.sleep.is_sleeping("m"));
        assert_eq!(f.transport.texts(4100), vec!["held"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_marks_idle_and_reports() {
        let f = fixture();
        let seen = record_activity(&f.hub);
        f.coordinator.start_mind_full("m").await.unwrap();
        f.coordinator.deliver("m", msg("dm", "hi")).await;

        f.launcher.exit("m", ExitOutcome::code(1));
        eventually(|| f.supervisor.is_running("m") && f.launcher.spawn_count("m") == 2).await;

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ActivityKind::MindStarted,
                ActivityKind::MindActive {
                    channel: Some("dm".to_string())
                },
                ActivityKind::MindIdle,
                ActivityKind::MindCrashed {
                    attempt: 1,
                    restart_in_ms: Some(1000)
                },
                ActivityKind::MindStarted,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_full_resets_restart_budget() {
        let f = fixture();
        f.coordinator.start_mind_full("m").await.unwrap();
        f.launcher.exit("m", ExitOutcome::code(1));
        eventually(|| f.supervisor.restart_attempts("m") == 1).await;

        f.coordinator.stop_mind_full("m").await.unwrap();
        assert_eq!(f.supervisor.restart_attempts("m"), 0);
        assert_eq!(f.supervisor.status("m"), InstanceStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_event_for_unknown_mind_is_rejected() {
        let f = fixture();
        let done = MindEvent::Done {
            channel: None,
            conversation_id: None,
        };
        assert!(matches!(
            f.coordinator.record_mind_event("ghost", &done),
            Err(Error::UnknownMind(_))
        ));
        f.coordinator.record_mind_event("m", &done).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_boot_skips_sleeping_minds() {
        let f = fixture();
        f.coordinator.sleep_mind("m").await.unwrap();
        f.coordinator
            .boot(&["m".to_string(), "m@exp".to_string()])
            .await;
        assert_eq!(f.launcher.spawn_count("m"), 0);
        assert_eq!(f.launcher.spawn_count("m@exp"), 1);

        let status = f.coordinator.status();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].name, "m");
        assert!(status[0].sleeping);
        assert_eq!(status[1].name, "m@exp");
        assert_eq!(status[1].process, InstanceStatus::Running);

        f.coordinator.shutdown().await;
        assert_eq!(f.supervisor.status("m@exp"), InstanceStatus::Stopped);
    }
}
