//! Fakes shared by unit tests: a scriptable process launcher and a recording transport.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

use crate::core::{DeliveryPayload, MindRef};
use crate::delivery::MindTransport;
use crate::error::{Error, Result};
use crate::supervisor::{
    ExitOutcome, LaunchSpec, ProcessControl, ProcessLauncher, SpawnedMind, StopSignal,
};

/// Poll `check` on the (usually paused) tokio clock until it holds.
pub async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached");
}

pub fn test_spec(home: &Path, name: &str, port: u16) -> LaunchSpec {
    let mind = MindRef::parse(name).unwrap();
    LaunchSpec {
        run_dir: home.join("minds").join(mind.key()),
        mind,
        port,
        program: "fake-mind".to_string(),
        args: Vec::new(),
        working_dir: None,
        env: BTreeMap::new(),
        daemon_url: "http://127.0.0.1:7777".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeBehavior {
    /// Reports liveness right away.
    Live,
    /// Never reports liveness.
    Hang,
    FailSpawn,
}

struct FakeProcess {
    exit: Option<oneshot::Sender<ExitOutcome>>,
    liveness: Option<oneshot::Sender<()>>,
}

#[derive(Default)]
struct FakeState {
    next_pid: u32,
    spawns: HashMap<String, usize>,
    behaviors: HashMap<String, VecDeque<FakeBehavior>>,
    current: HashMap<String, u32>,
    processes: HashMap<u32, FakeProcess>,
    signals: HashMap<String, Vec<StopSignal>>,
    ignore_term: bool,
}

impl FakeState {
    fn finish(&mut self, pid: u32, outcome: ExitOutcome) {
        if let Some(mut process) = self.processes.remove(&pid) {
            process.liveness.take();
            if let Some(tx) = process.exit.take() {
                let _ = tx.send(outcome);
            }
        }
    }
}

/// In-memory launcher. Processes live until `exit` or a stop signal.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Behavior for the next spawn of `key`; later spawns default to `Live`.
    pub fn push_behavior(&self, key: &str, behavior: FakeBehavior) {
        self.lock()
            .behaviors
            .entry(key.to_string())
            .or_default()
            .push_back(behavior);
    }

    pub fn set_ignore_term(&self, ignore: bool) {
        self.lock().ignore_term = ignore;
    }

    /// Spawn attempts for `key`, failed ones included.
    pub fn spawn_count(&self, key: &str) -> usize {
        self.lock().spawns.get(key).copied().unwrap_or(0)
    }

    pub fn signals(&self, key: &str) -> Vec<StopSignal> {
        self.lock().signals.get(key).cloned().unwrap_or_default()
    }

    /// Make the current process of `key` exit.
    pub fn exit(&self, key: &str, outcome: ExitOutcome) {
        let mut state = self.lock();
        if let Some(pid) = state.current.get(key).copied() {
            state.finish(pid, outcome);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct FakeControl {
    state: Arc<Mutex<FakeState>>,
    key: String,
    pid: u32,
}

impl ProcessControl for FakeControl {
    fn signal_group(&self, signal: StopSignal) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .signals
            .entry(self.key.clone())
            .or_default()
            .push(signal);
        match signal {
            StopSignal::Terminate if state.ignore_term => {}
            StopSignal::Terminate => state.finish(
                self.pid,
                ExitOutcome {
                    code: None,
                    signal: Some(15),
                },
            ),
            StopSignal::Kill => state.finish(
                self.pid,
                ExitOutcome {
                    code: None,
                    signal: Some(9),
                },
            ),
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessLauncher for FakeLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedMind> {
        // Real spawns suspend; concurrent callers must get a chance to interleave.
        tokio::task::yield_now().await;

        let key = spec.key();
        let mut state = self.lock();
        *state.spawns.entry(key.clone()).or_insert(0) += 1;
        let behavior = state
            .behaviors
            .get_mut(&key)
            .and_then(|q| q.pop_front())
            .unwrap_or(FakeBehavior::Live);

        if behavior == FakeBehavior::FailSpawn {
            return Err(Error::Process(format!("spawn {}: no such file", spec.program)));
        }

        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        let (exit_tx, exit_rx) = oneshot::channel();
        let (live_tx, live_rx) = oneshot::channel();

        let liveness = match behavior {
            FakeBehavior::Live => {
                let _ = live_tx.send(());
                None
            }
            _ => Some(live_tx),
        };

        state.processes.insert(
            pid,
            FakeProcess {
                exit: Some(exit_tx),
                liveness,
            },
        );
        state.current.insert(key.clone(), pid);

        Ok(SpawnedMind {
            pid: Some(pid),
            control: Arc::new(FakeControl {
                state: Arc::clone(&self.state),
                key,
                pid,
            }),
            liveness: live_rx,
            exit: exit_rx,
        })
    }
}

/// Transport that records deliveries per port and can be told to fail.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    sent: Arc<Mutex<Vec<(u16, DeliveryPayload)>>>,
    failures: Arc<Mutex<HashMap<u16, usize>>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` sends to `port`.
    pub fn fail_next(&self, port: u16, times: usize) {
        *self
            .failures
            .lock()
            .unwrap()
            .entry(port)
            .or_insert(0) += times;
    }

    pub fn sent(&self) -> Vec<(u16, DeliveryPayload)> {
        self.sent.lock().unwrap().clone()
    }

    /// Text of every payload sent to `port`, in order.
    pub fn texts(&self, port: u16) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, payload)| payload.content.preview(usize::MAX))
            .collect()
    }
}

#[async_trait]
impl MindTransport for RecordingTransport {
    async fn send(&self, port: u16, payload: &DeliveryPayload) -> Result<()> {
        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(left) = failures.get_mut(&port) {
                if *left > 0 {
                    *left -= 1;
                    return Err(Error::Http(format!("connection refused on {}", port)));
                }
            }
        }
        self.sent.lock().unwrap().push((port, payload.clone()));
        Ok(())
    }
}

/// A fully wired coordinator over fakes, for tests above the lifecycle layer.
pub struct TestFleet {
    pub coordinator: crate::lifecycle::MindLifecycleCoordinator,
    pub hub: crate::events::EventHub,
    pub activity: crate::activity::ActivityTracker,
    pub history: Arc<crate::core::InMemoryHistory>,
    pub launcher: FakeLauncher,
    pub transport: RecordingTransport,
}

impl TestFleet {
    /// Registers each `(name, port)` under `home`.
    pub fn new(home: &Path, minds: &[(&str, u16)]) -> Self {
        use crate::activity::ActivityTracker;
        use crate::config::{DeliveryConfig, SupervisorConfig};
        use crate::delivery::DeliveryManager;
        use crate::events::EventHub;
        use crate::lifecycle::{LifecycleObserver, MindLifecycleCoordinator, NoServices};
        use crate::sleep::SleepManager;
        use crate::supervisor::ProcessSupervisor;

        let hub = EventHub::new();
        let launcher = FakeLauncher::new();
        let supervisor = ProcessSupervisor::new(
            Arc::new(launcher.clone()),
            &SupervisorConfig::default(),
            None,
        );
        for (name, port) in minds {
            supervisor.register(test_spec(home, name, *port));
        }
        let activity = ActivityTracker::new(hub.clone(), Duration::from_secs(120));
        supervisor.set_observer(Arc::new(LifecycleObserver::new(activity.clone(), hub.clone())));

        let history = Arc::new(crate::core::InMemoryHistory::new());
        let transport = RecordingTransport::new();
        let delivery = DeliveryManager::new(
            supervisor.clone(),
            activity.clone(),
            hub.clone(),
            history.clone(),
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
        let coordinator = MindLifecycleCoordinator::new(
            supervisor,
            sleep,
            delivery,
            activity.clone(),
            hub.clone(),
            Arc::new(NoServices),
        );

        Self {
            coordinator,
            hub,
            activity,
            history,
            launcher,
            transport,
        }
    }
}
