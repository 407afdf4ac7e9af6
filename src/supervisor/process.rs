//! OS-process boundary for mind instances.
//!
//! The supervisor only talks to [`ProcessLauncher`] and [`ProcessControl`], so its
//! state machine can be driven by a fake in tests. [`UnixLauncher`] is the real
//! implementation: each mind gets its own process group, its output goes to
//! `mind.log`, and liveness is the first "listening on :<port>" line in that log.

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::config::MindConfig;
use crate::core::MindRef;
use crate::error::{Error, Result};

pub const ENV_MIND_NAME: &str = "MIND_NAME";
pub const ENV_MIND_BASE: &str = "MIND_BASE";
pub const ENV_MIND_VARIANT: &str = "MIND_VARIANT";
pub const ENV_MIND_PORT: &str = "MIND_PORT";
pub const ENV_DAEMON_URL: &str = "MIND_DAEMON_URL";
pub const ENV_RESTART_SIGNAL_FILE: &str = "MIND_RESTART_SIGNAL_FILE";

/// Everything needed to spawn one mind instance.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub mind: MindRef,
    pub port: u16,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// `<home>/minds/<key>`: pid file, log, restart signal.
    pub run_dir: PathBuf,
    pub daemon_url: String,
}

impl LaunchSpec {
    /// Specs for a configured mind and each of its variants.
    pub fn for_mind(home: &Path, name: &str, config: &MindConfig, daemon_url: &str) -> Vec<Self> {
        let base = Self {
            mind: MindRef::base(name),
            port: config.port,
            program: config.command.clone(),
            args: config.args.clone(),
            working_dir: config.working_directory.clone(),
            env: config.env.clone(),
            run_dir: home.join("minds").join(name),
            daemon_url: daemon_url.to_string(),
        };

        let mut specs = vec![base.clone()];
        for (variant, vcfg) in &config.variants {
            let mind = MindRef {
                base: name.to_string(),
                variant: Some(variant.clone()),
            };
            specs.push(Self {
                run_dir: home.join("minds").join(mind.key()),
                mind,
                port: vcfg.port,
                working_dir: vcfg.working_directory.clone().or_else(|| base.working_dir.clone()),
                ..base.clone()
            });
        }
        specs
    }

    pub fn key(&self) -> String {
        self.mind.key()
    }

    pub fn log_path(&self) -> PathBuf {
        self.run_dir.join("mind.log")
    }

    pub fn pid_path(&self) -> PathBuf {
        self.run_dir.join("mind.pid")
    }

    pub fn restart_signal_path(&self) -> PathBuf {
        self.run_dir.join("restart.signal")
    }

    /// Variables identifying the instance to the child.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push((ENV_MIND_NAME.to_string(), self.key()));
        env.push((ENV_MIND_BASE.to_string(), self.mind.base.clone()));
        if let Some(variant) = &self.mind.variant {
            env.push((ENV_MIND_VARIANT.to_string(), variant.clone()));
        }
        env.push((ENV_MIND_PORT.to_string(), self.port.to_string()));
        env.push((ENV_DAEMON_URL.to_string(), self.daemon_url.clone()));
        env.push((
            ENV_RESTART_SIGNAL_FILE.to_string(),
            self.restart_signal_path().to_string_lossy().to_string(),
        ));
        env
    }
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitOutcome {
    pub fn clean() -> Self {
        Self {
            code: Some(0),
            signal: None,
        }
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ExitOutcome {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "signal {}", sig),
            (None, None) => write!(f, "unknown exit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

/// Signals a running instance and all of its descendants.
pub trait ProcessControl: Send + Sync {
    fn signal_group(&self, signal: StopSignal) -> Result<()>;
}

/// A freshly spawned instance.
pub struct SpawnedMind {
    pub pid: Option<u32>,
    pub control: Arc<dyn ProcessControl>,
    /// Fires once the liveness marker is seen; dropped without firing if the
    /// process exits first.
    pub liveness: oneshot::Receiver<()>,
    pub exit: oneshot::Receiver<ExitOutcome>,
}

#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedMind>;
}

/// Write `<run_dir>/mind.pid` for external tooling.
pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", pid))?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("Failed to remove pid file {}: {}", path.display(), e);
        }
    }
}

/// Consume the restart signal left by a child; true if one was present.
pub fn take_restart_signal(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            tracing::warn!("Failed to consume restart signal {}: {}", path.display(), e);
            path.exists()
        }
    }
}

/// Pattern matching the liveness line a mind prints once its server is up.
pub fn liveness_marker(port: u16) -> Result<Regex> {
    Regex::new(&format!(r"(?i)listening on\b.*:{}\b", port))
        .map_err(|e| Error::Other(format!("liveness marker: {}", e)))
}

struct GroupControl {
    pgid: Pid,
}

impl ProcessControl for GroupControl {
    fn signal_group(&self, signal: StopSignal) -> Result<()> {
        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        match killpg(self.pgid, sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Spawns real child processes.
pub struct UnixLauncher {
    poll: Duration,
}

impl UnixLauncher {
    pub fn new(poll: Duration) -> Self {
        Self { poll }
    }
}

#[async_trait]
impl ProcessLauncher for UnixLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedMind> {
        std::fs::create_dir_all(&spec.run_dir)?;

        let log_path = spec.log_path();
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let offset = log.metadata()?.len();
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .arg("--port")
            .arg(spec.port.to_string())
            .envs(spec.child_env())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::Process(format!("spawn {}: {}", spec.program, e)))?;
        let pid = child.id();
        let pgid = pid
            .and_then(|p| i32::try_from(p).ok())
            .map(Pid::from_raw)
            .ok_or_else(|| Error::Process(format!("{} exited during spawn", spec.key())))?;

        let exited = Arc::new(AtomicBool::new(false));
        let (exit_tx, exit_rx) = oneshot::channel();
        let (live_tx, live_rx) = oneshot::channel();

        let exit_flag = Arc::clone(&exited);
        let key = spec.key();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => ExitOutcome::from(status),
                Err(e) => {
                    tracing::warn!(mind = %key, "wait failed: {}", e);
                    ExitOutcome {
                        code: None,
                        signal: None,
                    }
                }
            };
            exit_flag.store(true, Ordering::SeqCst);
            let _ = exit_tx.send(outcome);
        });

        let marker = liveness_marker(spec.port)?;
        tokio::spawn(watch_for_marker(log_path, offset, marker, self.poll, exited, live_tx));

        Ok(SpawnedMind {
            pid,
            control: Arc::new(GroupControl { pgid }),
            liveness: live_rx,
            exit: exit_rx,
        })
    }
}

async fn watch_for_marker(
    path: PathBuf,
    mut offset: u64,
    marker: Regex,
    poll: Duration,
    exited: Arc<AtomicBool>,
    tx: oneshot::Sender<()>,
) {
    let mut buffer = String::new();

    loop {
        if tx.is_closed() {
            return;
        }
        // Read once more after exit so a marker printed just before dying still counts.
        let done = exited.load(Ordering::SeqCst);

        if let Ok(mut file) = tokio::fs::File::open(&path).await {
            if file.seek(std::io::SeekFrom::Start(offset)).await.is_ok() {
                let mut bytes = Vec::new();
                if let Ok(n) = file.read_to_end(&mut bytes).await {
                    offset += n as u64;
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                }
            }
        }

        if marker.is_match(&buffer) {
            let _ = tx.send(());
            return;
        }
        if done {
            return;
        }

        // Only the unfinished last line can still complete a match.
        if let Some(idx) = buffer.rfind('\n') {
            buffer.drain(..=idx);
        }

        tokio::time::sleep(poll).await;
    }
}
