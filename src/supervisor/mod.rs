//! Supervision of mind instance processes.
//!
//! Per instance key: `Stopped -> Starting -> Running`, then either back to
//! `Stopped` (clean exit or explicit stop) or `Restarting -> Starting` after a
//! crash. When the restart budget runs out the instance parks in `Failed` until
//! an explicit start.

pub mod process;
pub mod restart;

pub use process::{
    ExitOutcome, LaunchSpec, ProcessControl, ProcessLauncher, SpawnedMind, StopSignal,
    UnixLauncher,
};
pub use restart::{RestartDecision, RestartSnapshot, RestartTracker};

use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::SupervisorConfig;
use crate::error::{Error, Result};

/// How long to wait for the process to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceStatus {
    Stopped,
    Starting,
    Running,
    Restarting { attempt: u32, delay_ms: u64 },
    Failed { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running; any pending restart was cancelled.
    NotRunning,
    Graceful,
    Killed,
}

/// What the supervisor did about a process exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReport {
    /// Exit caused by `stop_mind` or a failed startup.
    Stopped,
    Clean,
    RestartRequested,
    Crashed { attempt: u32, delay_ms: u64 },
    Exhausted { attempts: u32 },
}

/// Receives supervision transitions. Called outside every supervisor lock.
pub trait SupervisorObserver: Send + Sync {
    fn on_started(&self, _key: &str) {}
    fn on_exit(&self, _key: &str, _report: &ExitReport) {}
}

pub struct NoopObserver;

impl SupervisorObserver for NoopObserver {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartKind {
    Explicit,
    Restart,
}

enum Begin {
    AlreadyRunning,
    Join,
    Spawn(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillReason {
    Stop,
    StartupTimeout(StartKind),
}

struct Instance {
    status: InstanceStatus,
    /// Bumped on every spawn and every cancellation; stale exits and timers compare against it.
    generation: u64,
    pid: Option<u32>,
    control: Option<Arc<dyn ProcessControl>>,
    exited: Option<watch::Receiver<bool>>,
    kill_reason: Option<KillReason>,
    /// Kind of the latest start; decides what an exit before liveness means.
    start_kind: StartKind,
}

impl Instance {
    fn stopped() -> Self {
        Self {
            status: InstanceStatus::Stopped,
            generation: 0,
            pid: None,
            control: None,
            exited: None,
            kill_reason: None,
            start_kind: StartKind::Explicit,
        }
    }
}

struct Inner {
    launcher: Arc<dyn ProcessLauncher>,
    specs: Mutex<HashMap<String, LaunchSpec>>,
    instances: Mutex<HashMap<String, Instance>>,
    restarts: Mutex<RestartTracker>,
    observer: Mutex<Arc<dyn SupervisorObserver>>,
    state_path: Option<PathBuf>,
    startup_timeout: Duration,
    stop_grace: Duration,
}

/// Owns one child process per running mind instance. Cloning shares state.
#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

impl ProcessSupervisor {
    /// `state_path` persists the restart table; it is loaded here if present.
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        config: &SupervisorConfig,
        state_path: Option<PathBuf>,
    ) -> Self {
        let mut restarts = RestartTracker::from_config(config);
        if let Some(path) = &state_path {
            if let Err(e) = restarts.load_from(path) {
                tracing::warn!("Failed to load restart state from {}: {}", path.display(), e);
            }
        }

        Self {
            inner: Arc::new(Inner {
                launcher,
                specs: Mutex::new(HashMap::new()),
                instances: Mutex::new(HashMap::new()),
                restarts: Mutex::new(restarts),
                observer: Mutex::new(Arc::new(NoopObserver)),
                state_path,
                startup_timeout: config.startup_timeout(),
                stop_grace: config.stop_grace(),
            }),
        }
    }

    pub fn set_observer(&self, observer: Arc<dyn SupervisorObserver>) {
        *self.inner.observer.lock().unwrap_or_else(|e| e.into_inner()) = observer;
    }

    pub fn register(&self, spec: LaunchSpec) {
        let key = spec.key();
        tracing::debug!(mind = %key, port = spec.port, "registered mind instance");
        self.inner
            .specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, spec);
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.inner
            .specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Registered instance keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn spec(&self, key: &str) -> Result<LaunchSpec> {
        self.inner
            .specs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownMind(key.to_string()))
    }

    pub fn status(&self, key: &str) -> InstanceStatus {
        self.instances()
            .get(key)
            .map(|i| i.status.clone())
            .unwrap_or(InstanceStatus::Stopped)
    }

    pub fn pid(&self, key: &str) -> Option<u32> {
        self.instances().get(key).and_then(|i| i.pid)
    }

    pub fn is_running(&self, key: &str) -> bool {
        self.status(key) == InstanceStatus::Running
    }

    /// Port of a running instance.
    pub fn running_port(&self, key: &str) -> Option<u16> {
        if !self.is_running(key) {
            return None;
        }
        self.spec(key).ok().map(|s| s.port)
    }

    pub fn restart_attempts(&self, key: &str) -> u32 {
        self.restarts().get_attempts(key)
    }

    pub fn reset_restarts(&self, key: &str) {
        let mut restarts = self.restarts();
        restarts.reset(key);
        self.persist_restarts(&restarts);
    }

    /// Start an instance and wait for its liveness marker.
    ///
    /// No-op if it is already running; joins an in-flight start.
    pub async fn start_mind(&self, key: &str) -> Result<()> {
        self.start_inner(key, StartKind::Explicit).await
    }

    async fn start_inner(&self, key: &str, kind: StartKind) -> Result<()> {
        let spec = self.spec(key)?;

        let begin = {
            let mut instances = self.instances();
            let inst = instances
                .entry(key.to_string())
                .or_insert_with(Instance::stopped);

            match inst.status.clone() {
                InstanceStatus::Running => Begin::AlreadyRunning,
                InstanceStatus::Starting => Begin::Join,
                status => {
                    if kind == StartKind::Explicit && matches!(status, InstanceStatus::Failed { .. }) {
                        let mut restarts = self.restarts();
                        restarts.reset(key);
                        self.persist_restarts(&restarts);
                    }
                    inst.generation += 1;
                    inst.status = InstanceStatus::Starting;
                    inst.kill_reason = None;
                    inst.start_kind = kind;
                    Begin::Spawn(inst.generation)
                }
            }
        };

        let generation = match begin {
            Begin::AlreadyRunning => return Ok(()),
            Begin::Join => return self.join_start(key).await,
            Begin::Spawn(generation) => generation,
        };

        tracing::info!(mind = %key, port = spec.port, "starting mind");

        let spawned = match self.inner.launcher.spawn(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(mind = %key, "spawn failed: {}", e);
                if kind == StartKind::Restart {
                    self.record_failed_start(key, generation);
                } else {
                    self.set_status_if(key, generation, InstanceStatus::Stopped);
                }
                return Err(e);
            }
        };

        let SpawnedMind {
            pid,
            control,
            liveness,
            exit,
        } = spawned;

        let (exited_tx, exited_rx) = watch::channel(false);
        let installed = {
            let mut instances = self.instances();
            match instances.get_mut(key) {
                Some(inst) if inst.generation == generation => {
                    inst.pid = pid;
                    inst.control = Some(Arc::clone(&control));
                    inst.exited = Some(exited_rx);
                    true
                }
                _ => false,
            }
        };
        if !installed {
            // Stopped while the spawn was in flight.
            if let Err(e) = control.signal_group(StopSignal::Kill) {
                tracing::warn!(mind = %key, "failed to kill superseded process: {}", e);
            }
            return Err(Error::Process(format!("start of '{}' was cancelled", key)));
        }

        if let Some(pid) = pid {
            if let Err(e) = process::write_pid_file(&spec.pid_path(), pid) {
                tracing::warn!(mind = %key, "failed to write pid file: {}", e);
            }
        }

        let supervisor = self.clone();
        let monitor_key = key.to_string();
        tokio::spawn(async move {
            let outcome = exit.await.unwrap_or(ExitOutcome {
                code: None,
                signal: None,
            });
            supervisor.handle_exit(&monitor_key, generation, outcome);
            let _ = exited_tx.send(true);
        });

        match tokio::time::timeout(self.inner.startup_timeout, liveness).await {
            Ok(Ok(())) => {
                if !self.set_status_if(key, generation, InstanceStatus::Running) {
                    return Err(Error::Process(format!("'{}' exited during startup", key)));
                }
                tracing::info!(mind = %key, pid = ?pid, "mind is live");
                self.observer().on_started(key);
                Ok(())
            }
            Ok(Err(_)) => Err(Error::Process(format!(
                "'{}' exited before reporting liveness",
                key
            ))),
            Err(_) => {
                tracing::error!(
                    mind = %key,
                    timeout_ms = self.inner.startup_timeout.as_millis() as u64,
                    "mind did not report liveness; killing"
                );
                {
                    let mut instances = self.instances();
                    if let Some(inst) = instances.get_mut(key).filter(|i| i.generation == generation) {
                        inst.kill_reason = Some(KillReason::StartupTimeout(kind));
                    }
                }
                if let Err(e) = control.signal_group(StopSignal::Kill) {
                    tracing::warn!(mind = %key, "failed to kill unresponsive process: {}", e);
                }
                Err(Error::StartupTimeout {
                    mind: key.to_string(),
                    timeout_ms: self.inner.startup_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Wait for another caller's start to settle.
    async fn join_start(&self, key: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.inner.startup_timeout + KILL_WAIT;
        loop {
            match self.status(key) {
                InstanceStatus::Running => return Ok(()),
                InstanceStatus::Starting if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                InstanceStatus::Starting => {
                    return Err(Error::StartupTimeout {
                        mind: key.to_string(),
                        timeout_ms: self.inner.startup_timeout.as_millis() as u64,
                    })
                }
                other => {
                    return Err(Error::Process(format!(
                        "concurrent start of '{}' ended in {:?}",
                        key, other
                    )))
                }
            }
        }
    }

    /// Terminate the process group, escalating to SIGKILL after the grace period.
    pub async fn stop_mind(&self, key: &str) -> Result<StopOutcome> {
        let (control, mut exited) = {
            let mut instances = self.instances();
            let Some(inst) = instances.get_mut(key) else {
                return Ok(StopOutcome::NotRunning);
            };

            match (&inst.control, &inst.exited) {
                (Some(control), Some(exited))
                    if matches!(inst.status, InstanceStatus::Running | InstanceStatus::Starting) =>
                {
                    inst.kill_reason = Some(KillReason::Stop);
                    (Arc::clone(control), exited.clone())
                }
                _ => {
                    // Cancels an in-flight spawn or a pending restart timer.
                    inst.generation += 1;
                    inst.status = InstanceStatus::Stopped;
                    inst.kill_reason = None;
                    return Ok(StopOutcome::NotRunning);
                }
            }
        };

        tracing::info!(mind = %key, "stopping mind");
        if let Err(e) = control.signal_group(StopSignal::Terminate) {
            tracing::warn!(mind = %key, "SIGTERM failed: {}", e);
        }

        if wait_exited(&mut exited, self.inner.stop_grace).await {
            return Ok(StopOutcome::Graceful);
        }

        tracing::warn!(
            mind = %key,
            grace_ms = self.inner.stop_grace.as_millis() as u64,
            "mind ignored SIGTERM; sending SIGKILL"
        );
        control.signal_group(StopSignal::Kill)?;

        if wait_exited(&mut exited, KILL_WAIT).await {
            Ok(StopOutcome::Killed)
        } else {
            Err(Error::StopTimeout(key.to_string()))
        }
    }

    /// Stop every instance that has a process, concurrently.
    pub async fn stop_all(&self) {
        let keys: Vec<String> = self.instances().keys().cloned().collect();
        let mut set = tokio::task::JoinSet::new();
        for key in keys {
            let supervisor = self.clone();
            set.spawn(async move {
                if let Err(e) = supervisor.stop_mind(&key).await {
                    tracing::error!(mind = %key, "failed to stop: {}", e);
                }
            });
        }
        while set.join_next().await.is_some() {}
    }

    fn handle_exit(&self, key: &str, generation: u64, outcome: ExitOutcome) {
        let spec = self.spec(key).ok();

        let report = {
            let mut instances = self.instances();
            let Some(inst) = instances.get_mut(key).filter(|i| i.generation == generation) else {
                tracing::debug!(mind = %key, %outcome, "ignoring exit of superseded process");
                return;
            };
            inst.pid = None;
            inst.control = None;

            if let Some(spec) = &spec {
                process::remove_pid_file(&spec.pid_path());
            }
            let restart_requested = spec
                .as_ref()
                .is_some_and(|s| process::take_restart_signal(&s.restart_signal_path()));

            match inst.kill_reason.take() {
                Some(KillReason::Stop) | Some(KillReason::StartupTimeout(StartKind::Explicit)) => {
                    inst.status = InstanceStatus::Stopped;
                    ExitReport::Stopped
                }
                // An explicit start that dies before liveness failed; the caller gets the error.
                None if inst.status == InstanceStatus::Starting
                    && inst.start_kind == StartKind::Explicit =>
                {
                    inst.status = InstanceStatus::Stopped;
                    ExitReport::Stopped
                }
                _ if restart_requested => {
                    inst.status = InstanceStatus::Restarting {
                        attempt: 0,
                        delay_ms: 0,
                    };
                    ExitReport::RestartRequested
                }
                None if outcome.is_clean() => {
                    let mut restarts = self.restarts();
                    restarts.reset(key);
                    self.persist_restarts(&restarts);
                    inst.status = InstanceStatus::Stopped;
                    ExitReport::Clean
                }
                _ => self.crash_locked(key, inst),
            }
        };

        match &report {
            ExitReport::Stopped | ExitReport::Clean => {
                tracing::info!(mind = %key, %outcome, "mind exited")
            }
            ExitReport::RestartRequested => {
                tracing::info!(mind = %key, "mind requested restart");
                self.schedule_restart(key, generation, Duration::ZERO);
            }
            ExitReport::Crashed { attempt, delay_ms } => {
                tracing::warn!(mind = %key, %outcome, attempt, delay_ms, "mind crashed; restarting");
                self.schedule_restart(key, generation, Duration::from_millis(*delay_ms));
            }
            ExitReport::Exhausted { attempts } => {
                let err = Error::CrashExhausted {
                    mind: key.to_string(),
                    attempts: *attempts,
                };
                tracing::error!(mind = %key, %outcome, "{}", err);
            }
        }

        self.observer().on_exit(key, &report);
    }

    /// A restart whose spawn failed counts as another crash.
    fn record_failed_start(&self, key: &str, generation: u64) {
        let report = {
            let mut instances = self.instances();
            let Some(inst) = instances.get_mut(key).filter(|i| i.generation == generation) else {
                return;
            };
            self.crash_locked(key, inst)
        };
        match &report {
            ExitReport::Crashed { delay_ms, .. } => {
                self.schedule_restart(key, generation, Duration::from_millis(*delay_ms))
            }
            ExitReport::Exhausted { attempts } => tracing::error!(
                mind = %key,
                "{}",
                Error::CrashExhausted {
                    mind: key.to_string(),
                    attempts: *attempts
                }
            ),
            _ => {}
        }
        self.observer().on_exit(key, &report);
    }

    fn crash_locked(&self, key: &str, inst: &mut Instance) -> ExitReport {
        let mut restarts = self.restarts();
        let decision = restarts.record_crash(key);
        self.persist_restarts(&restarts);

        if decision.should_restart {
            let delay_ms = decision.delay.as_millis() as u64;
            inst.status = InstanceStatus::Restarting {
                attempt: decision.attempt,
                delay_ms,
            };
            ExitReport::Crashed {
                attempt: decision.attempt,
                delay_ms,
            }
        } else {
            inst.status = InstanceStatus::Failed {
                attempts: decision.attempt,
            };
            ExitReport::Exhausted {
                attempts: decision.attempt,
            }
        }
    }

    fn schedule_restart(&self, key: &str, generation: u64, delay: Duration) {
        let supervisor = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let due = supervisor
                .instances()
                .get(&key)
                .is_some_and(|i| {
                    i.generation == generation
                        && matches!(i.status, InstanceStatus::Restarting { .. })
                });
            if !due {
                tracing::debug!(mind = %key, "restart cancelled");
                return;
            }
            if let Err(e) = supervisor.start_inner(&key, StartKind::Restart).await {
                tracing::error!(mind = %key, "restart failed: {}", e);
            }
        });
    }

    fn set_status_if(&self, key: &str, generation: u64, status: InstanceStatus) -> bool {
        let mut instances = self.instances();
        match instances.get_mut(key) {
            Some(inst) if inst.generation == generation && inst.status == InstanceStatus::Starting => {
                inst.status = status;
                true
            }
            _ => false,
        }
    }

    fn persist_restarts(&self, restarts: &RestartTracker) {
        if let Some(path) = &self.inner.state_path {
            if let Err(e) = restarts.save_to(path) {
                tracing::warn!("Failed to save restart state to {}: {}", path.display(), e);
            }
        }
    }

    fn instances(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instance>> {
        self.inner.instances.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn restarts(&self) -> std::sync::MutexGuard<'_, RestartTracker> {
        self.inner.restarts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn observer(&self) -> Arc<dyn SupervisorObserver> {
        Arc::clone(&self.inner.observer.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    matches!(
        tokio::time::timeout(limit, exited.wait_for(|done| *done)).await,
        Ok(Ok(_))
    )
}
