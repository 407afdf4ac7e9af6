//! File-spooled inbox for messages that arrive while the daemon cannot take them
//! directly (CLI while the daemon is down, external relays).
//!
//! Layout:
//! - inbox/             : one `<ulid>.json` per pending message
//! - inbox/processing/  : entries claimed by the poller, until acked or released
//! - inbox/rejected/    : malformed or undeliverable entries moved aside for inspection

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::payload::{Content, DeliveryPayload};
use crate::config::DaemonConfig;
use crate::error::{Error, Result};

pub const INBOX_DIR: &str = "inbox";
pub const PROCESSING_DIR: &str = "processing";
pub const REJECTED_DIR: &str = "rejected";

/// Spooled message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InboxEntry {
    /// Unique ID (ULID)
    pub id: String,

    /// Target mind (`name` or `name@variant`)
    pub mind: String,

    pub payload: DeliveryPayload,

    /// When created (unix millis)
    pub created_at: i64,

    /// Failed delivery attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Not retried before this time (unix millis)
    #[serde(default)]
    pub not_before: i64,
}

impl InboxEntry {
    pub fn new(mind: &str, payload: DeliveryPayload) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            mind: mind.to_string(),
            payload,
            created_at: chrono::Utc::now().timestamp_millis(),
            attempts: 0,
            not_before: 0,
        }
    }
}

/// An entry moved into `processing/`. Must be acked or released.
#[derive(Debug)]
pub struct ClaimedEntry {
    pub entry: InboxEntry,
    path: PathBuf,
}

/// What `release` did with an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Requeued { attempts: u32 },
    Rejected,
}

/// Retry policy for entries whose delivery did not go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl InboxRetry {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            max_attempts: config.inbox_max_attempts,
            base_delay: Duration::from_millis(config.inbox_retry_base_ms),
            max_delay: Duration::from_millis(config.inbox_retry_max_ms),
        }
    }

    /// Delay after the `attempts`-th failure.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 1u32.checked_shl(attempts.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Validate a queued payload field by field so the warning names what is missing.
pub fn parse_queued_payload(value: &serde_json::Value) -> Result<DeliveryPayload> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::MalformedQueuedMessage("payload is not an object".to_string()))?;

    let channel = obj
        .get("channel")
        .and_then(|c| c.as_str())
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| Error::MalformedQueuedMessage("missing channel".to_string()))?;

    let content = obj
        .get("content")
        .filter(|c| !c.is_null())
        .ok_or_else(|| Error::MalformedQueuedMessage("missing content".to_string()))?;
    let content: Content = serde_json::from_value(content.clone())
        .map_err(|e| Error::MalformedQueuedMessage(format!("bad content: {}", e)))?;

    let sender = match obj.get("sender") {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(_) => {
            return Err(Error::MalformedQueuedMessage(
                "sender is not a string".to_string(),
            ))
        }
    };

    let conversation_id = obj
        .get("conversation_id")
        .and_then(|c| c.as_str())
        .map(str::to_string);

    Ok(DeliveryPayload {
        channel: channel.to_string(),
        sender,
        content,
        conversation_id,
    })
}

fn parse_entry(value: &serde_json::Value) -> Result<InboxEntry> {
    let mind = value
        .get("mind")
        .and_then(|m| m.as_str())
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| Error::MalformedQueuedMessage("missing mind".to_string()))?;
    let payload = value
        .get("payload")
        .ok_or_else(|| Error::MalformedQueuedMessage("missing payload".to_string()))?;

    Ok(InboxEntry {
        id: value
            .get("id")
            .and_then(|i| i.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| ulid::Ulid::new().to_string()),
        mind: mind.to_string(),
        payload: parse_queued_payload(payload)?,
        created_at: value.get("created_at").and_then(|t| t.as_i64()).unwrap_or(0),
        attempts: value
            .get("attempts")
            .and_then(|a| a.as_u64())
            .map_or(0, |a| a.min(u32::MAX as u64) as u32),
        not_before: value.get("not_before").and_then(|t| t.as_i64()).unwrap_or(0),
    })
}

fn read_entry(path: &Path) -> Result<InboxEntry> {
    let raw = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    parse_entry(&value)
}

fn is_json(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|ext| ext == "json")
}

/// Write via a dot-prefixed temp file and rename, so readers never see a partial file.
fn write_atomic(dir: &Path, file_name: &str, entry: &InboxEntry) -> Result<()> {
    let tmp_path = dir.join(format!(".{}.tmp", file_name));
    fs::write(&tmp_path, serde_json::to_string_pretty(entry)?)?;
    fs::rename(&tmp_path, dir.join(file_name))?;
    Ok(())
}

/// Inbox spool rooted at `<home>/inbox`.
#[derive(Clone, Debug)]
pub struct Inbox {
    dir: PathBuf,
}

impl Inbox {
    pub fn new(home: &Path) -> Self {
        Self {
            dir: home.join(INBOX_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn processing_dir(&self) -> PathBuf {
        self.dir.join(PROCESSING_DIR)
    }

    fn rejected_dir(&self) -> PathBuf {
        self.dir.join(REJECTED_DIR)
    }

    fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.processing_dir())?;
        fs::create_dir_all(self.rejected_dir())?;
        Ok(())
    }

    /// Spool a message for later delivery.
    pub fn enqueue(&self, mind: &str, payload: DeliveryPayload) -> Result<String> {
        self.ensure_dirs()?;

        let entry = InboxEntry::new(mind, payload);
        write_atomic(&self.dir, &format!("{}.json", entry.id), &entry)?;

        tracing::debug!("Spooled message {} for {}", entry.id, mind);
        Ok(entry.id)
    }

    /// Move every due entry into `processing/` and return them oldest first.
    /// Entries still backing off stay put; malformed ones go to `rejected/`.
    pub fn claim(&self) -> Result<Vec<ClaimedEntry>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        self.ensure_dirs()?;

        let now = chrono::Utc::now().timestamp_millis();
        let mut claimed = Vec::new();

        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if !is_json(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().map(|n| n.to_owned()) else {
                continue;
            };

            let entry = match read_entry(&path) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping inbox file {}: {}", path.display(), e);
                    fs::rename(&path, self.rejected_dir().join(&file_name))?;
                    continue;
                }
            };
            if entry.not_before > now {
                continue;
            }

            let processing_path = self.processing_dir().join(&file_name);
            fs::rename(&path, &processing_path)?;
            claimed.push(ClaimedEntry {
                entry,
                path: processing_path,
            });
        }

        claimed.sort_by(|a, b| {
            a.entry
                .created_at
                .cmp(&b.entry.created_at)
                .then_with(|| a.entry.id.cmp(&b.entry.id))
        });
        Ok(claimed)
    }

    /// The entry was handed over; forget it.
    pub fn ack(&self, claimed: ClaimedEntry) -> Result<()> {
        fs::remove_file(&claimed.path)?;
        Ok(())
    }

    /// Delivery did not go through: put the entry back with a backoff, or move
    /// it to `rejected/` once `retry.max_attempts` is reached.
    pub fn release(&self, claimed: ClaimedEntry, retry: &InboxRetry) -> Result<Release> {
        let ClaimedEntry { mut entry, path } = claimed;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}.json", entry.id));

        entry.attempts += 1;
        if entry.attempts >= retry.max_attempts {
            tracing::error!(
                id = %entry.id,
                mind = %entry.mind,
                attempts = entry.attempts,
                "giving up on spooled message"
            );
            write_atomic(&self.rejected_dir(), &file_name, &entry)?;
            fs::remove_file(&path)?;
            return Ok(Release::Rejected);
        }

        let delay = retry.delay_for(entry.attempts);
        entry.not_before = chrono::Utc::now().timestamp_millis() + delay.as_millis() as i64;
        write_atomic(&self.dir, &file_name, &entry)?;
        fs::remove_file(&path)?;
        tracing::debug!(
            id = %entry.id,
            mind = %entry.mind,
            attempts = entry.attempts,
            delay_ms = delay.as_millis() as u64,
            "requeued spooled message"
        );
        Ok(Release::Requeued {
            attempts: entry.attempts,
        })
    }

    /// Return entries left in `processing/` by a daemon that died mid-delivery.
    pub fn recover_orphaned(&self) -> Result<usize> {
        let processing_dir = self.processing_dir();
        if !processing_dir.exists() {
            return Ok(0);
        }

        let mut recovered = 0;
        for dir_entry in fs::read_dir(&processing_dir)? {
            let path = dir_entry?.path();
            if !is_json(&path) {
                continue;
            }
            if let Some(name) = path.file_name() {
                fs::rename(&path, self.dir.join(name))?;
                tracing::info!("Recovered orphaned inbox entry {}", path.display());
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Number of spooled messages waiting for delivery.
    pub fn len(&self) -> usize {
        fs::read_dir(&self.dir)
            .map(|rd| rd.filter_map(|e| e.ok()).filter(|e| is_json(&e.path())).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
