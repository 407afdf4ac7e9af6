//! Crash bookkeeping with exponential backoff.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use crate::config::SupervisorConfig;
use crate::error::Result;

/// Outcome of [`RestartTracker::record_crash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDecision {
    pub should_restart: bool,
    /// Crash count for the key after this crash.
    pub attempt: u32,
    pub delay: Duration,
}

/// Serialized attempt table.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct RestartSnapshot {
    pub attempts: BTreeMap<String, u32>,
}

#[derive(Debug, Clone)]
pub struct RestartTracker {
    attempts: HashMap<String, u32>,
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for RestartTracker {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

impl RestartTracker {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            attempts: HashMap::new(),
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn record_crash(&mut self, key: &str) -> RestartDecision {
        let count = self.attempts.entry(key.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        let attempt = *count;

        RestartDecision {
            should_restart: attempt <= self.max_attempts,
            attempt,
            delay: self.delay_for(attempt),
        }
    }

    /// `min(base * 2^(attempt - 1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    pub fn reset(&mut self, key: &str) {
        self.attempts.remove(key);
    }

    pub fn get_attempts(&self, key: &str) -> u32 {
        self.attempts.get(key).copied().unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }

    pub fn save(&self) -> RestartSnapshot {
        RestartSnapshot {
            attempts: self
                .attempts
                .iter()
                .filter(|(_, n)| **n > 0)
                .map(|(k, n)| (k.clone(), *n))
                .collect(),
        }
    }

    /// Replace the table with `snapshot`.
    pub fn load(&mut self, snapshot: RestartSnapshot) {
        self.attempts = snapshot.attempts.into_iter().collect();
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&self.save())?)?;
        Ok(())
    }

    /// Load from disk; a missing file leaves the table empty.
    pub fn load_from(&mut self, path: &Path) -> Result<()> {
        if !path.exists() {
            self.clear();
            return Ok(());
        }
        let content = std::fs::read_to_string(path)?;
        self.load(serde_json::from_str(&content)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_delay_sequence_caps_at_max() {
        let mut tracker = RestartTracker::new(ms(1000), ms(16_000), 10);
        let delays: Vec<u64> = (0..7)
            .map(|_| tracker.record_crash("scout").delay.as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16_000, 16_000, 16_000]);
    }

    #[test]
    fn test_attempts_increase_by_one() {
        let mut tracker = RestartTracker::default();
        for expected in 1..=8 {
            assert_eq!(tracker.record_crash("scout").attempt, expected);
            assert_eq!(tracker.get_attempts("scout"), expected);
        }
        assert_eq!(tracker.get_attempts("other"), 0);
    }

    #[test]
    fn test_exhaustion_and_reset() {
        let mut tracker = RestartTracker::default();
        for _ in 0..5 {
            assert!(tracker.record_crash("scout").should_restart);
        }
        let sixth = tracker.record_crash("scout");
        assert!(!sixth.should_restart);
        assert_eq!(sixth.attempt, 6);

        tracker.reset("scout");
        let fresh = tracker.record_crash("scout");
        assert!(fresh.should_restart);
        assert_eq!(fresh.attempt, 1);
        assert_eq!(fresh.delay, ms(3000));
    }

    #[test]
    fn test_huge_attempt_counts_do_not_overflow() {
        let tracker = RestartTracker::new(ms(3000), ms(60_000), 5);
        assert_eq!(tracker.delay_for(64), ms(60_000));
        assert_eq!(tracker.delay_for(u32::MAX), ms(60_000));
        assert_eq!(tracker.delay_for(0), ms(3000));
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut tracker = RestartTracker::default();
        tracker.record_crash("scout");
        tracker.record_crash("scout");
        tracker.record_crash("scout@exp");

        let mut fresh = RestartTracker::default();
        fresh.load(tracker.save());
        assert_eq!(fresh.get_attempts("scout"), 2);
        assert_eq!(fresh.get_attempts("scout@exp"), 1);
        assert_eq!(fresh.save(), tracker.save());

        fresh.clear();
        assert_eq!(fresh.get_attempts("scout"), 0);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("restart-state.json");

        let mut tracker = RestartTracker::default();
        tracker.record_crash("scout");
        tracker.save_to(&path).unwrap();

        let mut fresh = RestartTracker::default();
        fresh.load_from(&path).unwrap();
        assert_eq!(fresh.get_attempts("scout"), 1);

        let mut empty = RestartTracker::default();
        empty.load_from(&dir.path().join("missing.json")).unwrap();
        assert_eq!(empty.get_attempts("scout"), 0);
    }
}
