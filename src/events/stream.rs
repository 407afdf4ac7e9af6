//! Reconnect-safe event streams: every outgoing event gets a strictly increasing
//! id, and every (re)connect starts with a full snapshot followed by the live tail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{Stream, StreamExt};

use super::bus::Subscription;
use super::types::{ActivityEvent, ConversationEvent, EventHub, GlobalTopic};
use crate::core::history::ConversationSummary;

/// A recently modified page published by a mind.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PageSummary {
    pub path: String,
    pub modified: DateTime<Utc>,
}

/// Full current state sent first on every connection.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub conversations: Vec<ConversationSummary>,
    pub recent_activity: Vec<ActivityEvent>,
    pub active_minds: Vec<String>,
    pub recent_pages: Vec<PageSummary>,
}

/// Provides the snapshot a new stream starts with.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> Snapshot;
}

/// Envelope of everything a stream can emit.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Snapshot(Snapshot),
    Activity(ActivityEvent),
    Conversation {
        conversation_id: String,
        event: ConversationEvent,
    },
}

impl StreamEvent {
    /// SSE `event:` name.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Snapshot(_) => "snapshot",
            StreamEvent::Activity(_) => "activity",
            StreamEvent::Conversation { .. } => "conversation",
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct SequencedEvent {
    pub id: u64,
    pub data: StreamEvent,
}

/// Source of stream ids, shared by every stream of the daemon.
#[derive(Debug)]
pub struct EventSequencer {
    next: AtomicU64,
}

impl EventSequencer {
    /// Seeded from wall-clock microseconds so ids keep growing across daemon restarts.
    pub fn new() -> Self {
        let seed = Utc::now().timestamp_micros().max(1) as u64;
        Self::starting_at(seed)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for EventSequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded log of the latest activity events, fed from the activity bus.
#[derive(Clone)]
pub struct ActivityLog {
    events: Arc<Mutex<VecDeque<ActivityEvent>>>,
    capacity: usize,
}

impl ActivityLog {
    pub fn attach(hub: &EventHub, capacity: usize) -> Self {
        let log = Self {
            events: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        };
        let sink = log.clone();
        hub.activity
            .subscribe(GlobalTopic, move |e: &ActivityEvent| {
                sink.push(e.clone());
                Ok(())
            })
            .detach();
        log
    }

    fn push(&self, event: ActivityEvent) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if self.capacity == 0 {
            return;
        }
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Oldest first.
    pub fn recent(&self) -> Vec<ActivityEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// One client connection: a snapshot, then live activity and conversation events.
pub struct EventStream {
    snapshot: Option<StreamEvent>,
    live: mpsc::UnboundedReceiver<StreamEvent>,
    sequencer: Arc<EventSequencer>,
    subscriptions: Vec<Subscription>,
}

impl EventStream {
    /// Open a stream. `last_event_id` is accepted from reconnecting clients, but
    /// the daemon keeps no replay buffer, so every connection restarts from a snapshot.
    pub fn open(
        hub: &EventHub,
        sequencer: Arc<EventSequencer>,
        source: &dyn SnapshotSource,
        conversations: &[String],
        last_event_id: Option<u64>,
    ) -> Self {
        if let Some(last) = last_event_id {
            tracing::debug!(last_event_id = last, "client resumed; sending fresh snapshot");
        }

        let (tx, live) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::with_capacity(conversations.len() + 1);

        // Subscribe before taking the snapshot so nothing falls between the two;
        // an event may then appear in both, which clients tolerate.
        let activity_tx = tx.clone();
        subscriptions.push(hub.activity.subscribe(GlobalTopic, move |e: &ActivityEvent| {
            activity_tx
                .send(StreamEvent::Activity(e.clone()))
                .map_err(|_| crate::error::Error::Other("stream closed".to_string()))
        }));

        for conversation_id in conversations {
            let conv_tx = tx.clone();
            let id = conversation_id.clone();
            subscriptions.push(hub.conversation.subscribe(
                conversation_id.clone(),
                move |e: &ConversationEvent| {
                    conv_tx
                        .send(StreamEvent::Conversation {
                            conversation_id: id.clone(),
                            event: e.clone(),
                        })
                        .map_err(|_| crate::error::Error::Other("stream closed".to_string()))
                },
            ));
        }

        Self {
            snapshot: Some(StreamEvent::Snapshot(source.snapshot())),
            live,
            sequencer,
            subscriptions,
        }
    }

    /// Next event, or `None` once every publisher is gone.
    pub async fn next(&mut self) -> Option<SequencedEvent> {
        let data = match self.snapshot.take() {
            Some(snapshot) => snapshot,
            None => self.live.recv().await?,
        };
        Some(SequencedEvent {
            id: self.sequencer.next_id(),
            data,
        })
    }

    /// Adapt into a `Stream`; subscriptions end when the stream is dropped.
    pub fn into_stream(self) -> impl Stream<Item = SequencedEvent> + Send {
        let EventStream {
            snapshot,
            live,
            sequencer,
            subscriptions,
        } = self;

        tokio_stream::iter(snapshot)
            .chain(UnboundedReceiverStream::new(live))
            .map(move |data| {
                let _held = &subscriptions;
                SequencedEvent {
                    id: sequencer.next_id(),
                    data,
                }
            })
    }
}
