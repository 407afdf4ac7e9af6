//! Routing inbound payloads to running mind instances.
//!
//! `route_and_deliver` never fails: the payload is persisted and announced
//! before the network attempt, and a failed attempt is logged and reported in
//! the returned status only. Retrying is up to queued-message callers.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::activity::ActivityTracker;
use crate::core::{DeliveryPayload, HistoryRecord, HistoryStore, MindRef};
use crate::error::{Error, Result};
use crate::events::{ConversationEvent, EventHub, MindEvent, Role};
use crate::supervisor::ProcessSupervisor;

/// Sends one payload to a mind listening on a loopback port.
#[async_trait]
pub trait MindTransport: Send + Sync {
    async fn send(&self, port: u16, payload: &DeliveryPayload) -> Result<()>;
}

/// `POST http://127.0.0.1:<port>/message`; any 2xx is success.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MindTransport for HttpTransport {
    async fn send(&self, port: u16, payload: &DeliveryPayload) -> Result<()> {
        let url = format!("http://127.0.0.1:{}/message", port);
        let response = self
            .client
            .post(&url)
            .json(&payload.message_body())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http(format!("{} returned {}", url, status)));
        }
        Ok(())
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    NotRunning,
    Failed,
}

/// Persists, announces and forwards inbound payloads. Cloning shares state.
#[derive(Clone)]
pub struct DeliveryManager {
    supervisor: ProcessSupervisor,
    activity: ActivityTracker,
    hub: EventHub,
    history: Arc<dyn HistoryStore>,
    transport: Arc<dyn MindTransport>,
}

impl DeliveryManager {
    pub fn new(
        supervisor: ProcessSupervisor,
        activity: ActivityTracker,
        hub: EventHub,
        history: Arc<dyn HistoryStore>,
        transport: Arc<dyn MindTransport>,
    ) -> Self {
        Self {
            supervisor,
            activity,
            hub,
            history,
            transport,
        }
    }

    pub async fn route_and_deliver(&self, name: &str, payload: &DeliveryPayload) -> DeliveryStatus {
        let mind = match MindRef::parse(name) {
            Ok(mind) => mind,
            Err(e) => {
                tracing::warn!("Dropping message for '{}': {}", name, e);
                return DeliveryStatus::Failed;
            }
        };
        let key = mind.key();

        if let Err(e) = self.history.record(&HistoryRecord::inbound(&key, payload)) {
            tracing::warn!(mind = %key, "Failed to record inbound message: {}", e);
        }

        self.publish_mind_event(
            &key,
            &MindEvent::Inbound {
                channel: payload.channel.clone(),
                sender: payload.sender.clone(),
                conversation_id: payload.conversation_id.clone(),
                content: payload.content.clone(),
            },
        );

        match self.forward(&key, payload).await {
            Ok(()) => DeliveryStatus::Delivered,
            Err(Error::DeliveryFailed { reason, .. }) if reason == NOT_RUNNING => {
                tracing::warn!(mind = %key, channel = %payload.channel, "mind is not running; message not delivered");
                DeliveryStatus::NotRunning
            }
            Err(e) => {
                tracing::error!(mind = %key, channel = %payload.channel, "{}", e);
                DeliveryStatus::Failed
            }
        }
    }

    /// Network step only: no history, no events. Used for retries.
    pub async fn forward(&self, key: &str, payload: &DeliveryPayload) -> Result<()> {
        let port = self
            .supervisor
            .running_port(key)
            .ok_or_else(|| Error::DeliveryFailed {
                mind: key.to_string(),
                reason: NOT_RUNNING.to_string(),
            })?;

        self.transport
            .send(port, payload)
            .await
            .map_err(|e| Error::DeliveryFailed {
                mind: key.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(mind = %key, port, channel = %payload.channel, "delivered message");
        Ok(())
    }

    /// Record an event reported by the mind itself (outbound reply, tool use, turn done).
    pub fn report(&self, key: &str, event: &MindEvent) {
        if let MindEvent::Outbound {
            channel,
            conversation_id,
            content,
        } = event
        {
            let record =
                HistoryRecord::outbound(key, channel.as_deref(), conversation_id.as_deref(), content);
            if let Err(e) = self.history.record(&record) {
                tracing::warn!(mind = %key, "Failed to record outbound message: {}", e);
            }
        }
        self.publish_mind_event(key, event);
    }

    /// Fan a mind event out to the activity tracker, the mind bus and, when it
    /// belongs to a conversation, the conversation bus.
    pub fn publish_mind_event(&self, key: &str, event: &MindEvent) {
        self.activity.on_mind_event(key, event);
        self.hub.mind.publish(&key.to_string(), event);

        let Some(conversation_id) = event.conversation_id() else {
            return;
        };
        let at = Utc::now();
        let conversation_event = match event {
            MindEvent::Inbound {
                channel,
                sender,
                content,
                ..
            } => ConversationEvent::Message {
                mind: key.to_string(),
                role: Role::User,
                channel: Some(channel.clone()),
                sender: sender.clone(),
                content: content.clone(),
                at,
            },
            MindEvent::Outbound {
                channel, content, ..
            } => ConversationEvent::Message {
                mind: key.to_string(),
                role: Role::Mind,
                channel: channel.clone(),
                sender: Some(key.to_string()),
                content: content.clone(),
                at,
            },
            MindEvent::ToolUse { tool, .. } => ConversationEvent::ToolUse {
                mind: key.to_string(),
                tool: tool.clone(),
                at,
            },
            MindEvent::Done { .. } => ConversationEvent::TurnDone {
                mind: key.to_string(),
                at,
            },
            MindEvent::Lifecycle { .. } => return,
        };
        self.hub
            .conversation
            .publish(&conversation_id.to_string(), &conversation_event);
    }
}

const NOT_RUNNING: &str = "not running";
