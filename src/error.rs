//! Error types for mindfleet.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Unknown mind: {0}")]
    UnknownMind(String),

    /// The instance did not print its liveness marker in time.
    #[error("Mind '{mind}' did not report liveness within {timeout_ms}ms")]
    StartupTimeout { mind: String, timeout_ms: u64 },

    /// Automatic restarts are exhausted; only an explicit start revives the mind.
    #[error("Mind '{mind}' crashed {attempts} times, giving up")]
    CrashExhausted { mind: String, attempts: u32 },

    #[error("Delivery to '{mind}' failed: {reason}")]
    DeliveryFailed { mind: String, reason: String },

    #[error("Malformed queued message: {0}")]
    MalformedQueuedMessage(String),

    #[error("Subscriber failed: {0}")]
    SubscriberFailure(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Mind '{0}' did not exit after SIGKILL")]
    StopTimeout(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(e: nix::Error) -> Self {
        Error::Process(e.to_string())
    }
}
