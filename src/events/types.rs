//! Event families carried on the buses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bus::EventBus;
use crate::core::Content;

/// Something that happened to or inside one mind instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MindEvent {
    /// A payload was accepted for the mind (published before network delivery).
    Inbound {
        channel: String,
        #[serde(default)]
        sender: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
        content: Content,
    },
    /// The mind produced a reply.
    Outbound {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
        content: Content,
    },
    /// The mind invoked a tool during a turn.
    ToolUse {
        tool: String,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// The mind finished a turn.
    Done {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        conversation_id: Option<String>,
    },
    /// Process lifecycle transition observed by the daemon.
    Lifecycle { state: LifecycleState },
}

impl MindEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            MindEvent::Inbound { .. } => "inbound",
            MindEvent::Outbound { .. } => "outbound",
            MindEvent::ToolUse { .. } => "tool_use",
            MindEvent::Done { .. } => "done",
            MindEvent::Lifecycle { .. } => "lifecycle",
        }
    }

    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            MindEvent::Inbound { conversation_id, .. }
            | MindEvent::Outbound { conversation_id, .. }
            | MindEvent::ToolUse { conversation_id, .. }
            | MindEvent::Done { conversation_id, .. } => conversation_id.as_deref(),
            MindEvent::Lifecycle { .. } => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Started,
    Stopped,
    Crashed,
    Sleeping,
    Waking,
}

/// Fleet-wide presence and lifecycle signal, published on the global topic.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ActivityEvent {
    pub mind: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: ActivityKind,
}

impl ActivityEvent {
    pub fn new(mind: &str, kind: ActivityKind) -> Self {
        Self {
            mind: mind.to_string(),
            at: Utc::now(),
            kind,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityKind {
    MindActive {
        #[serde(default)]
        channel: Option<String>,
    },
    MindIdle,
    MindStarted,
    MindStopped,
    MindSleeping,
    MindWaking {
        /// Number of queued messages delivered on wake.
        delivered: usize,
    },
    MindCrashed {
        attempt: u32,
        /// Backoff before the next start; `None` when restarts are exhausted.
        restart_in_ms: Option<u64>,
    },
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Mind,
}

/// A conversation-scoped event, published under the conversation id.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConversationEvent {
    Message {
        mind: String,
        role: Role,
        channel: Option<String>,
        sender: Option<String>,
        content: Content,
        at: DateTime<Utc>,
    },
    ToolUse {
        mind: String,
        tool: String,
        at: DateTime<Utc>,
    },
    TurnDone {
        mind: String,
        at: DateTime<Utc>,
    },
}

/// Key of the unscoped activity topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalTopic;

/// The three buses the daemon publishes on. Cloning shares them.
#[derive(Clone, Default)]
pub struct EventHub {
    /// Keyed by mind instance key.
    pub mind: EventBus<String, MindEvent>,
    pub activity: EventBus<GlobalTopic, ActivityEvent>,
    /// Keyed by conversation id.
    pub conversation: EventBus<String, ConversationEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish_activity(&self, event: ActivityEvent) {
        tracing::debug!(mind = %event.mind, kind = ?event.kind, "activity event");
        self.activity.publish(&GlobalTopic, &event);
    }
}
