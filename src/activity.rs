//! Active/idle presence derived from mind events.
//!
//! An inbound message makes a mind active. A finished turn arms a debounce
//! timer; if nothing else arrives before it fires, the mind goes idle. At most
//! one idle timer is pending per mind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::events::{ActivityEvent, ActivityKind, EventHub, MindEvent};

#[derive(Default)]
struct ActivityState {
    active: bool,
    idle_timer: Option<AbortHandle>,
    timer_generation: u64,
    channel: Option<String>,
}

impl ActivityState {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
        self.timer_generation += 1;
    }
}

/// Tracks which minds are mid-conversation. Cloning shares state.
///
/// Activity events are published while the tracker's lock is held so they keep
/// the order of the events that caused them; activity subscribers must not call
/// back into the tracker.
#[derive(Clone)]
pub struct ActivityTracker {
    minds: Arc<Mutex<HashMap<String, ActivityState>>>,
    hub: EventHub,
    idle_after: Duration,
}

impl ActivityTracker {
    pub fn new(hub: EventHub, idle_after: Duration) -> Self {
        Self {
            minds: Arc::new(Mutex::new(HashMap::new())),
            hub,
            idle_after,
        }
    }

    pub fn on_mind_event(&self, name: &str, event: &MindEvent) {
        match event {
            MindEvent::Inbound { channel, .. } => self.on_inbound(name, channel),
            MindEvent::Done { .. } => self.arm_idle_timer(name),
            _ => {}
        }
    }

    fn on_inbound(&self, name: &str, channel: &str) {
        let mut minds = self.lock();
        let state = minds.entry(name.to_string()).or_default();
        state.cancel_timer();
        state.channel = Some(channel.to_string());

        if !state.active {
            state.active = true;
            self.hub.publish_activity(ActivityEvent::new(
                name,
                ActivityKind::MindActive {
                    channel: state.channel.clone(),
                },
            ));
        }
    }

    fn arm_idle_timer(&self, name: &str) {
        let mut minds = self.lock();
        let Some(state) = minds.get_mut(name).filter(|s| s.active) else {
            return;
        };
        state.cancel_timer();
        let generation = state.timer_generation;

        let tracker = self.clone();
        let key = name.to_string();
        let idle_after = self.idle_after;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle_after).await;
            tracker.fire_idle(&key, generation);
        });
        state.idle_timer = Some(handle.abort_handle());
    }

    fn fire_idle(&self, name: &str, generation: u64) {
        let mut minds = self.lock();
        let Some(state) = minds.get_mut(name) else {
            return;
        };
        if state.timer_generation != generation || !state.active {
            return;
        }
        state.active = false;
        state.idle_timer = None;
        self.hub
            .publish_activity(ActivityEvent::new(name, ActivityKind::MindIdle));
    }

    /// Go idle now and forget the mind; used when its process stops or crashes.
    pub fn mark_idle(&self, name: &str) {
        let mut minds = self.lock();
        if let Some(mut state) = minds.remove(name) {
            state.cancel_timer();
            if state.active {
                self.hub
                    .publish_activity(ActivityEvent::new(name, ActivityKind::MindIdle));
            }
        }
    }

    /// Cancel every pending idle timer.
    pub fn stop_all(&self) {
        for state in self.lock().values_mut() {
            state.cancel_timer();
        }
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.lock().get(name).is_some_and(|s| s.active)
    }

    /// Channel of the last inbound message that kept `name` active.
    pub fn last_channel(&self, name: &str) -> Option<String> {
        self.lock().get(name).and_then(|s| s.channel.clone())
    }

    pub fn active_minds(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActivityState>> {
        self.minds.lock().unwrap_or_else(|e| e.into_inner())
    }
}
