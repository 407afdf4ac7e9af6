//! Configuration loading for mindfleet.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::sleep::WakeTrigger;

/// Environment variable overriding the home directory.
pub const HOME_ENV: &str = "MINDFLEET_HOME";

/// Get the mindfleet home directory (`$MINDFLEET_HOME` or `~/.mindfleet`).
pub fn get_home_dir() -> Result<PathBuf> {
    if let Ok(raw) = std::env::var(HOME_ENV) {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            return Ok(PathBuf::from(trimmed));
        }
    }

    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".mindfleet"))
}

/// Get the settings file path.
pub fn get_settings_path(home: &Path) -> PathBuf {
    home.join("settings.json")
}

/// Load settings from `<home>/settings.json`.
pub fn load_settings(home: &Path) -> Result<Settings> {
    let path = get_settings_path(home);

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default(home: &Path) -> Settings {
    load_settings(home).unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

fn validate_settings(settings: &Settings) -> Result<()> {
    let mut ports: HashMap<u16, String> = HashMap::new();

    for (name, mind) in &settings.minds {
        if name.is_empty() || name.contains('@') {
            return Err(Error::Config(format!(
                "invalid mind name '{}': must be non-empty and must not contain '@'",
                name
            )));
        }

        let instances = std::iter::once((name.clone(), mind.port)).chain(
            mind.variants
                .iter()
                .map(|(variant, cfg)| (format!("{}@{}", name, variant), cfg.port)),
        );
        for (key, port) in instances {
            if let Some(other) = ports.insert(port, key.clone()) {
                return Err(Error::Config(format!(
                    "port {} is used by both '{}' and '{}'",
                    port, other, key
                )));
            }
        }
    }

    if settings.minds.values().any(|m| m.port == settings.daemon.port) {
        return Err(Error::Config(format!(
            "daemon port {} collides with a mind port",
            settings.daemon.port
        )));
    }

    Ok(())
}

/// Daemon process configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_inbox_poll_ms")]
    pub inbox_poll_ms: u64,
    /// Failed deliveries before a spooled message is moved to `inbox/rejected/`
    #[serde(default = "default_inbox_max_attempts")]
    pub inbox_max_attempts: u32,
    #[serde(default = "default_inbox_retry_base_ms")]
    pub inbox_retry_base_ms: u64,
    #[serde(default = "default_inbox_retry_max_ms")]
    pub inbox_retry_max_ms: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_daemon_port() -> u16 {
    7777
}

fn default_inbox_poll_ms() -> u64 {
    500
}

fn default_inbox_max_attempts() -> u32 {
    10
}

fn default_inbox_retry_base_ms() -> u64 {
    1000
}

fn default_inbox_retry_max_ms() -> u64 {
    60_000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_daemon_port(),
            inbox_poll_ms: default_inbox_poll_ms(),
            inbox_max_attempts: default_inbox_max_attempts(),
            inbox_retry_base_ms: default_inbox_retry_base_ms(),
            inbox_retry_max_ms: default_inbox_retry_max_ms(),
        }
    }
}

impl DaemonConfig {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Process supervision configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SupervisorConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_liveness_poll_ms")]
    pub liveness_poll_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    3000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_startup_timeout_ms() -> u64 {
    30_000
}

fn default_stop_grace_ms() -> u64 {
    10_000
}

fn default_liveness_poll_ms() -> u64 {
    250
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            startup_timeout_ms: default_startup_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            liveness_poll_ms: default_liveness_poll_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Message delivery configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeliveryConfig {
    #[serde(default = "default_delivery_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_queue_retry_attempts")]
    pub queue_retry_attempts: u32,
    #[serde(default = "default_queue_retry_delay_ms")]
    pub queue_retry_delay_ms: u64,
}

fn default_delivery_timeout_ms() -> u64 {
    120_000
}

fn default_queue_retry_attempts() -> u32 {
    3
}

fn default_queue_retry_delay_ms() -> u64 {
    1000
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_delivery_timeout_ms(),
            queue_retry_attempts: default_queue_retry_attempts(),
            queue_retry_delay_ms: default_queue_retry_delay_ms(),
        }
    }
}

/// Activity tracking configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ActivityConfig {
    #[serde(default = "default_idle_after_ms")]
    pub idle_after_ms: u64,
    #[serde(default = "default_recent_events")]
    pub recent_events: usize,
}

fn default_idle_after_ms() -> u64 {
    120_000
}

fn default_recent_events() -> usize {
    50
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            idle_after_ms: default_idle_after_ms(),
            recent_events: default_recent_events(),
        }
    }
}

/// Variant instance of a mind.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct VariantConfig {
    pub port: u16,
    pub working_directory: Option<PathBuf>,
}

/// Mind configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MindConfig {
    pub port: u16,
    /// Executable for the mind server; receives `--port <port>`.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub autostart: bool,
    #[serde(default)]
    pub wake_trigger: WakeTrigger,
    #[serde(default)]
    pub variants: BTreeMap<String, VariantConfig>,
}

/// mindfleet settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub activity: ActivityConfig,

    #[serde(default)]
    pub minds: BTreeMap<String, MindConfig>,
}
