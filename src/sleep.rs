//! Sleep/wake state machine with a per-mind pending-message queue.
//!
//! Sleeping stops only the compute process. Messages that arrive meanwhile
//! are queued in arrival order; a message matching the mind's wake trigger
//! starts a wake, and the wake drains the queue, triggering message included,
//! before the mind is considered awake again.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::activity::ActivityTracker;
use crate::config::DeliveryConfig;
use crate::core::inbox::parse_queued_payload;
use crate::core::{DeliveryPayload, MindRef};
use crate::delivery::{DeliveryManager, DeliveryStatus};
use crate::error::{Error, Result};
use crate::events::{ActivityEvent, ActivityKind, EventHub};
use crate::supervisor::ProcessSupervisor;

/// Which inbound messages wake a sleeping mind.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WakeTrigger {
    #[default]
    Any,
    Never,
    Channel {
        channel: String,
    },
    Sender {
        sender: String,
    },
    AnyOf {
        triggers: Vec<WakeTrigger>,
    },
}

impl WakeTrigger {
    pub fn matches(&self, payload: &DeliveryPayload) -> bool {
        match self {
            WakeTrigger::Any => true,
            WakeTrigger::Never => false,
            WakeTrigger::Channel { channel } => payload.channel == *channel,
            WakeTrigger::Sender { sender } => payload.sender.as_deref() == Some(sender.as_str()),
            WakeTrigger::AnyOf { triggers } => triggers.iter().any(|t| t.matches(payload)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeOptions {
    /// Shown in logs.
    pub reason: String,
}

impl WakeOptions {
    pub fn manual() -> Self {
        Self {
            reason: "manual".to_string(),
        }
    }

    pub fn triggered_by(payload: &DeliveryPayload) -> Self {
        Self {
            reason: format!("message on {}", payload.channel),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WakeResult {
    NotSleeping,
    /// Another wake is already in flight; it will drain the queue.
    AlreadyWaking,
    /// The mind is still being stopped; the wake runs once the stop completes.
    Deferred,
    Woke { delivered: usize },
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    /// The mind is awake; the caller delivers directly.
    Awake,
    Queued,
    /// Queued, and a wake was started in the background.
    Waking,
}

#[derive(Default)]
struct SleepEntry {
    sleeping: bool,
    waking: bool,
    /// `sleep_mind` is still stopping the process.
    stopping: bool,
    /// A wake was requested while stopping.
    wake_pending: bool,
    queue: VecDeque<DeliveryPayload>,
}

struct SleepInner {
    minds: Mutex<HashMap<String, SleepEntry>>,
    triggers: Mutex<HashMap<String, WakeTrigger>>,
    supervisor: ProcessSupervisor,
    delivery: DeliveryManager,
    activity: ActivityTracker,
    hub: EventHub,
    state_path: Option<PathBuf>,
    retry_attempts: u32,
    retry_delay: Duration,
}

/// Cloning shares state.
#[derive(Clone)]
pub struct SleepManager {
    inner: Arc<SleepInner>,
}

impl SleepManager {
    /// `state_path` persists sleeping flags and queues; it is loaded here if present.
    pub fn new(
        supervisor: ProcessSupervisor,
        delivery: DeliveryManager,
        activity: ActivityTracker,
        hub: EventHub,
        config: &DeliveryConfig,
        state_path: Option<PathBuf>,
    ) -> Self {
        let minds = match &state_path {
            Some(path) => load_state(path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load sleep state from {}: {}", path.display(), e);
                HashMap::new()
            }),
            None => HashMap::new(),
        };

        Self {
            inner: Arc::new(SleepInner {
                minds: Mutex::new(minds),
                triggers: Mutex::new(HashMap::new()),
                supervisor,
                delivery,
                activity,
                hub,
                state_path,
                retry_attempts: config.queue_retry_attempts,
                retry_delay: Duration::from_millis(config.queue_retry_delay_ms),
            }),
        }
    }

    pub fn set_wake_trigger(&self, name: &str, trigger: WakeTrigger) {
        self.inner
            .triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(base_name(name), trigger);
    }

    pub fn is_sleeping(&self, name: &str) -> bool {
        self.lock()
            .get(&base_name(name))
            .is_some_and(|e| e.sleeping)
    }

    pub fn sleeping_minds(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, e)| e.sleeping)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn queue_len(&self, name: &str) -> usize {
        self.lock()
            .get(&base_name(name))
            .map_or(0, |e| e.queue.len())
    }

    pub fn queued(&self, name: &str) -> Vec<DeliveryPayload> {
        self.lock()
            .get(&base_name(name))
            .map(|e| e.queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether `payload` alone should wake `name`.
    pub fn check_wake_trigger(&self, name: &str, payload: &DeliveryPayload) -> bool {
        self.inner
            .triggers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&base_name(name))
            .cloned()
            .unwrap_or_default()
            .matches(payload)
    }

    /// Append to the queue of a sleeping mind; false if it is awake.
    pub fn queue_sleep_message(&self, name: &str, payload: &DeliveryPayload) -> bool {
        let base = base_name(name);
        let mut minds = self.lock();
        let Some(entry) = minds.get_mut(&base).filter(|e| e.sleeping) else {
            return false;
        };
        entry.queue.push_back(payload.clone());
        tracing::debug!(mind = %base, queued = entry.queue.len(), channel = %payload.channel, "queued message for sleeping mind");
        self.persist(&minds);
        true
    }

    /// Gate an inbound message for `name`: queue it while asleep and start a
    /// wake if it matches the trigger.
    pub fn handle_inbound(&self, name: &str, payload: &DeliveryPayload) -> GateOutcome {
        if !self.queue_sleep_message(name, payload) {
            return GateOutcome::Awake;
        }
        if !self.check_wake_trigger(name, payload) {
            return GateOutcome::Queued;
        }

        self.spawn_wake(&base_name(name), WakeOptions::triggered_by(payload));
        GateOutcome::Waking
    }

    fn spawn_wake(&self, base: &str, opts: WakeOptions) {
        let manager = self.clone();
        let base = base.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.initiate_wake(&base, opts).await {
                tracing::error!(mind = %base, "wake failed: {}", e);
            }
        });
    }

    /// Start the process, drain the queue in order, then mark the mind awake.
    ///
    /// Concurrent calls while a wake is in flight return `AlreadyWaking`. A call
    /// while `sleep_mind` is still stopping the process is `Deferred` and runs
    /// when the stop completes. If the process fails to start, the mind stays
    /// asleep with its queue intact.
    pub async fn initiate_wake(&self, name: &str, opts: WakeOptions) -> Result<WakeResult> {
        let base = base_name(name);
        {
            let mut minds = self.lock();
            match minds.get_mut(&base) {
                Some(entry) if entry.sleeping && entry.stopping => {
                    entry.wake_pending = true;
                    tracing::debug!(mind = %base, reason = %opts.reason, "wake deferred until stop completes");
                    return Ok(WakeResult::Deferred);
                }
                Some(entry) if entry.sleeping && entry.waking => return Ok(WakeResult::AlreadyWaking),
                Some(entry) if entry.sleeping => entry.waking = true,
                _ => return Ok(WakeResult::NotSleeping),
            }
        }

        tracing::info!(mind = %base, reason = %opts.reason, "waking mind");

        if let Err(e) = self.inner.supervisor.start_mind(&base).await {
            if let Some(entry) = self.lock().get_mut(&base) {
                entry.waking = false;
            }
            return Err(e);
        }

        let mut delivered = 0;
        loop {
            let next = {
                let mut minds = self.lock();
                let Some(entry) = minds.get_mut(&base) else {
                    // Cleared by a full stop mid-drain.
                    break;
                };
                match entry.queue.front() {
                    Some(payload) => Some(payload.clone()),
                    None => {
                        entry.sleeping = false;
                        entry.waking = false;
                        self.persist(&minds);
                        None
                    }
                }
            };
            let Some(payload) = next else {
                break;
            };

            if self.deliver_queued(&base, &payload).await {
                delivered += 1;
            }

            let mut minds = self.lock();
            if let Some(entry) = minds.get_mut(&base) {
                entry.queue.pop_front();
            }
            self.persist(&minds);
        }

        self.inner.hub.publish_activity(ActivityEvent::new(
            &base,
            ActivityKind::MindWaking { delivered },
        ));
        Ok(WakeResult::Woke { delivered })
    }

    async fn deliver_queued(&self, base: &str, payload: &DeliveryPayload) -> bool {
        if self.inner.delivery.route_and_deliver(base, payload).await == DeliveryStatus::Delivered {
            return true;
        }

        for attempt in 1..=self.inner.retry_attempts {
            tokio::time::sleep(self.inner.retry_delay).await;
            match self.inner.delivery.forward(base, payload).await {
                Ok(()) => return true,
                Err(e) => tracing::warn!(mind = %base, attempt, "queued delivery retry failed: {}", e),
            }
        }

        tracing::error!(
            mind = %base,
            channel = %payload.channel,
            "dropping queued message after {} retries",
            self.inner.retry_attempts
        );
        false
    }

    /// Stop the compute process and start queueing. Services keep running.
    ///
    /// Messages arriving during the stop are queued; a wake they trigger
    /// starts once the process is down.
    pub async fn sleep_mind(&self, name: &str) -> Result<()> {
        let base = base_name(name);
        {
            let mut minds = self.lock();
            let entry = minds.entry(base.clone()).or_default();
            if entry.waking {
                return Err(Error::Other(format!("'{}' is waking up", base)));
            }
            if entry.sleeping {
                return Ok(());
            }
            entry.sleeping = true;
            entry.stopping = true;
            self.persist(&minds);
        }

        tracing::info!(mind = %base, "putting mind to sleep");
        let stopped = self.inner.supervisor.stop_mind(&base).await;

        let wake_pending = {
            let mut minds = self.lock();
            match minds.get_mut(&base) {
                Some(entry) => {
                    entry.stopping = false;
                    std::mem::take(&mut entry.wake_pending)
                }
                None => false,
            }
        };

        if stopped.is_ok() {
            self.inner.activity.mark_idle(&base);
            self.inner
                .hub
                .publish_activity(ActivityEvent::new(&base, ActivityKind::MindSleeping));
        }
        if wake_pending {
            self.spawn_wake(&base, WakeOptions {
                reason: "message during sleep".to_string(),
            });
        }
        stopped.map(|_| ())
    }

    /// Forget sleep state; queued messages are discarded.
    pub fn clear(&self, name: &str) {
        let base = base_name(name);
        let mut minds = self.lock();
        if let Some(entry) = minds.remove(&base) {
            if !entry.queue.is_empty() {
                tracing::warn!(mind = %base, dropped = entry.queue.len(), "discarding queued messages");
            }
            self.persist(&minds);
        }
    }

    fn persist(&self, minds: &HashMap<String, SleepEntry>) {
        let Some(path) = &self.inner.state_path else {
            return;
        };
        if let Err(e) = save_state(path, minds) {
            tracing::warn!("Failed to save sleep state to {}: {}", path.display(), e);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SleepEntry>> {
        self.inner.minds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn base_name(name: &str) -> String {
    MindRef::parse(name)
        .map(|m| m.base)
        .unwrap_or_else(|_| name.to_string())
}

#[derive(Serialize)]
struct StateFile<'a> {
    minds: BTreeMap<&'a str, StateEntry<'a>>,
}

#[derive(Serialize)]
struct StateEntry<'a> {
    sleeping: bool,
    queue: &'a VecDeque<DeliveryPayload>,
}

fn save_state(path: &Path, minds: &HashMap<String, SleepEntry>) -> Result<()> {
    let file = StateFile {
        minds: minds
            .iter()
            .filter(|(_, e)| e.sleeping)
            .map(|(name, e)| {
                (
                    name.as_str(),
                    StateEntry {
                        sleeping: true,
                        queue: &e.queue,
                    },
                )
            })
            .collect(),
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
    Ok(())
}

fn load_state(path: &Path) -> Result<HashMap<String, SleepEntry>> {
    let mut minds = HashMap::new();
    if !path.exists() {
        return Ok(minds);
    }

    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
    let Some(entries) = value.get("minds").and_then(|m| m.as_object()) else {
        return Ok(minds);
    };

    for (name, entry) in entries {
        if !entry.get("sleeping").and_then(|s| s.as_bool()).unwrap_or(false) {
            continue;
        }
        let mut queue = VecDeque::new();
        for (i, raw) in entry
            .get("queue")
            .and_then(|q| q.as_array())
            .into_iter()
            .flatten()
            .enumerate()
        {
            match parse_queued_payload(raw) {
                Ok(payload) => queue.push_back(payload),
                Err(e) => tracing::warn!(mind = %name, index = i, "skipping queued message: {}", e),
            }
        }
        minds.insert(
            name.clone(),
            SleepEntry {
                sleeping: true,
                queue,
                ..SleepEntry::default()
            },
        );
    }
    Ok(minds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SupervisorConfig;
    use crate::core::{Content, InMemoryHistory};
    use crate::events::GlobalTopic;
    use crate::supervisor::{InstanceStatus, StopSignal};
    use crate::testing::{eventually, test_spec, FakeBehavior, FakeLauncher, RecordingTransport};

    struct Fixture {
        sleep: SleepManager,
        supervisor: ProcessSupervisor,
        launcher: FakeLauncher,
        transport: RecordingTransport,
        hub: EventHub,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_in(tempfile::tempdir().unwrap())
    }

    fn fixture_in(dir: tempfile::TempDir) -> Fixture {
        let hub = EventHub::new();
        let launcher = FakeLauncher::new();
        let supervisor = ProcessSupervisor::new(
            Arc::new(launcher.clone()),
            &SupervisorConfig::default(),
            None,
        );
        supervisor.register(test_spec(dir.path(), "scout", 4100));
        let activity = ActivityTracker::new(hub.clone(), Duration::from_secs(120));
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
            delivery,
            activity,
            hub.clone(),
            &DeliveryConfig {
                timeout_ms: 1000,
                queue_retry_attempts: 2,
                queue_retry_delay_ms: 100,
            },
            Some(dir.path().join("state").join("sleep-state.json")),
        );
        Fixture {
            sleep,
            supervisor,
            launcher,
            transport,
            hub,
            dir,
        }
    }

    fn msg(channel: &str, text: &str) -> DeliveryPayload {
        DeliveryPayload::new(channel, Some("ada"), Content::text(text))
    }

    #[test]
    fn test_wake_trigger_predicates() {
        let dm = msg("dm", "hi");
        let group = DeliveryPayload::new("group", Some("bob"), Content::text("hi"));

        assert!(WakeTrigger::Any.matches(&dm));
        assert!(!WakeTrigger::Never.matches(&dm));

        let channel = WakeTrigger::Channel {
            channel: "dm".to_string(),
        };
        assert!(channel.matches(&dm));
        assert!(!channel.matches(&group));

        let sender = WakeTrigger::Sender {
            sender: "bob".to_string(),
        };
        assert!(sender.matches(&group));
        assert!(!sender.matches(&dm));

        let any_of = WakeTrigger::AnyOf {
            triggers: vec![channel, sender],
        };
        assert!(any_of.matches(&dm));
        assert!(any_of.matches(&group));
    }

    #[test]
    fn test_wake_trigger_config_format() {
        let t: WakeTrigger = serde_json::from_str(r#"{"type":"channel","channel":"dm"}"#).unwrap();
        assert_eq!(
            t,
            WakeTrigger::Channel {
                channel: "dm".to_string()
            }
        );
        let t: WakeTrigger = serde_json::from_str(r#"{"type":"never"}"#).unwrap();
        assert_eq!(t, WakeTrigger::Never);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_stops_process_and_queues() {
        let f = fixture();
        f.supervisor.start_mind("scout").await.unwrap();
        f.sleep.set_wake_trigger("scout", WakeTrigger::Never);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = f.hub.activity.subscribe(GlobalTopic, move |e: &ActivityEvent| {
            sink.lock().unwrap().push(e.kind.clone());
            Ok(())
        });

        f.sleep.sleep_mind("scout").await.unwrap();
        assert!(f.sleep.is_sleeping("scout"));
        assert_eq!(f.supervisor.status("scout"), InstanceStatus::Stopped);
        assert_eq!(*seen.lock().unwrap(), vec![ActivityKind::MindSleeping]);

        assert_eq!(f.sleep.handle_inbound("scout", &msg("dm", "one")), GateOutcome::Queued);
        assert_eq!(f.sleep.queue_len("scout"), 1);
        assert!(f.transport.sent().is_empty());

        // Sleeping twice is a no-op.
        f.sleep.sleep_mind("scout").await.unwrap();
        assert_eq!(f.sleep.queue_len("scout"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wake_drains_in_fifo_order() {
        let f = fixture();
        f.sleep.set_wake_trigger("scout", WakeTrigger::Never);
        f.sleep.sleep_mind("scout").await.unwrap();

        for text in ["one", "two", "three", "four"] {
            f.sleep.handle_inbound("scout", &msg("dm", text));
        }

        let result = f.sleep.initiate_wake("scout", WakeOptions::manual()).await.unwrap();
        assert_eq!(result, WakeResult::Woke { delivered: 4 });
        assert_eq!(f.transport.texts(4100), vec!["one", "two", "three", "four"]);
        assert!(!f.sleep.is_sleeping("scout"));
        assert_eq!(f.sleep.queue_len("scout"), 0);

        // Awake minds are not gated.
        assert_eq!(f.sleep.handle_inbound("scout", &msg("dm", "five")), GateOutcome::Awake);
        assert_eq!(
            f.sleep.initiate_wake("scout", WakeOptions::manual()).await.unwrap(),
            WakeResult::NotSleeping
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_wakes_start_one_process() {
        let f = fixture();
        f.sleep.sleep_mind("scout").await.unwrap();
        f.sleep.queue_sleep_message("scout", &msg("dm", "one"));

        let (a, b) = tokio::join!(
            f.sleep.initiate_wake("scout", WakeOptions::manual()),
            f.sleep.initiate_wake("scout", WakeOptions::manual()),
        );
        let mut results = vec![a.unwrap(), b.unwrap()];
        results.sort_by_key(|r| matches!(r, WakeResult::AlreadyWaking));
        assert_eq!(
            results,
            vec![WakeResult::Woke { delivered: 1 }, WakeResult::AlreadyWaking]
        );
        assert_eq!(f.launcher.spawn_count("scout"), 1);
        assert_eq!(f.transport.texts(4100), vec!["one"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_match_wakes_in_background() {
        let f = fixture();
        f.sleep.set_wake_trigger(
            "scout",
            WakeTrigger::Channel {
                channel: "dm".to_string(),
            },
        );
        f.sleep.sleep_mind("scout").await.unwrap();

        assert_eq!(f.sleep.handle_inbound("scout", &msg("group", "first")), GateOutcome::Queued);
        assert_eq!(f.sleep.handle_inbound("scout", &msg("dm", "second")), GateOutcome::Waking);

        eventually(|| !f.sleep.is_sleeping("scout")).await;
        assert_eq!(f.transport.texts(4100), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_delivery_retries_then_drops() {
        let f = fixture();
        f.sleep.sleep_mind("scout").await.unwrap();
        f.sleep.queue_sleep_message("scout", &msg("dm", "flaky"));
        f.sleep.queue_sleep_message("scout", &msg("dm", "doomed"));
        f.sleep.queue_sleep_message("scout", &msg("dm", "fine"));

        // First message: initial attempt and one retry fail, second retry succeeds.
        // Second message: initial attempt and both retries fail.
        f.transport.fail_next(4100, 5);
        let result = f.sleep.initiate_wake("scout", WakeOptions::manual()).await.unwrap();

        assert_eq!(result, WakeResult::Woke { delivered: 2 });
        assert_eq!(f.transport.texts(4100), vec!["flaky", "fine"]);
        assert_eq!(f.sleep.queue_len("scout"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_wake_keeps_queue() {
        let f = fixture();
        f.sleep.sleep_mind("scout").await.unwrap();
        f.sleep.queue_sleep_message("scout", &msg("dm", "kept"));
        f.launcher.push_behavior("scout", FakeBehavior::FailSpawn);

        assert!(f.sleep.initiate_wake("scout", WakeOptions::manual()).await.is_err());
        assert!(f.sleep.is_sleeping("scout"));
        assert_eq!(f.sleep.queue_len("scout"), 1);

        let result = f.sleep.initiate_wake("scout", WakeOptions::manual()).await.unwrap();
        assert_eq!(result, WakeResult::Woke { delivered: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_survives_restart_and_skips_malformed() {
        let f = fixture();
        f.sleep.sleep_mind("scout").await.unwrap();
        f.sleep.queue_sleep_message("scout", &msg("dm", "one"));
        f.sleep.queue_sleep_message("scout", &msg("dm", "two"));

        let path = f.dir.path().join("state").join("sleep-state.json");
        let mut raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["minds"]["scout"]["queue"]
            .as_array_mut()
            .unwrap()
            .insert(1, serde_json::json!({"sender": "ada"}));
        std::fs::write(&path, raw.to_string()).unwrap();

        let reloaded = fixture_in(f.dir);
        assert!(reloaded.sleep.is_sleeping("scout"));
        let texts: Vec<String> = reloaded
            .sleep
            .queued("scout")
            .iter()
            .map(|p| p.content.preview(100))
            .collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_stop_wakes_after_stop() {
        crate::logging::init_test();
        let f = fixture();
        f.supervisor.start_mind("scout").await.unwrap();
        f.launcher.set_ignore_term(true);

        let sleeper = f.sleep.clone();
        let sleeping = tokio::spawn(async move { sleeper.sleep_mind("scout").await });
        eventually(|| f.launcher.signals("scout") == vec![StopSignal::Terminate]).await;

        assert_eq!(f.sleep.handle_inbound("scout", &msg("dm", "during")), GateOutcome::Waking);
        assert_eq!(f.sleep.queue_len("scout"), 1);
        assert!(f.transport.sent().is_empty());
        assert_eq!(
            f.sleep.initiate_wake("scout", WakeOptions::manual()).await.unwrap(),
            WakeResult::Deferred
        );

        sleeping.await.unwrap().unwrap();
        assert_eq!(
            f.launcher.signals("scout"),
            vec![StopSignal::Terminate, StopSignal::Kill]
        );

        eventually(|| !f.sleep.is_sleeping("scout")).await;
        assert!(f.supervisor.is_running("scout"));
        assert_eq!(f.launcher.spawn_count("scout"), 2);
        assert_eq!(f.transport.texts(4100), vec!["during"]);
        assert_eq!(f.sleep.queue_len("scout"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_discards_queue() {
        let f = fixture();
        f.sleep.sleep_mind("scout").await.unwrap();
        f.sleep.queue_sleep_message("scout", &msg("dm", "one"));
        f.sleep.clear("scout");
        assert!(!f.sleep.is_sleeping("scout"));
        assert_eq!(f.sleep.queue_len("scout"), 0);
        assert!(!f.sleep.queue_sleep_message("scout", &msg("dm", "two")));
    }
}
