//! Inbound payloads and mind instance addressing.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Opaque message content: plain text or a list of structured content blocks.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<serde_json::Value>),
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Content::Text(text.into())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(t) => t.trim().is_empty(),
            Content::Blocks(b) => b.is_empty(),
        }
    }

    /// Short human-readable preview for logs and the CLI.
    pub fn preview(&self, max_chars: usize) -> String {
        let full = match self {
            Content::Text(t) => t.clone(),
            Content::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join(" "),
        };
        if full.chars().count() > max_chars {
            let cut: String = full.chars().take(max_chars).collect();
            format!("{}...", cut)
        } else {
            full
        }
    }
}

/// A message addressed to a mind. Immutable once created.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeliveryPayload {
    /// Source channel (e.g. "dm", "discord", "cli").
    pub channel: String,

    /// Sender name, if the channel knows one.
    #[serde(default)]
    pub sender: Option<String>,

    pub content: Content,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

impl DeliveryPayload {
    pub fn new(channel: &str, sender: Option<&str>, content: Content) -> Self {
        Self {
            channel: channel.to_string(),
            sender: sender.map(str::to_string),
            content,
            conversation_id: None,
        }
    }

    pub fn with_conversation(mut self, conversation_id: &str) -> Self {
        self.conversation_id = Some(conversation_id.to_string());
        self
    }

    /// Body posted to the mind's `/message` endpoint.
    pub fn message_body(&self) -> serde_json::Value {
        serde_json::json!({
            "content": self.content,
            "channel": self.channel,
            "sender": self.sender,
        })
    }
}

/// Address of one mind instance: a base name with an optional variant.
///
/// ```
/// use mindfleet::core::MindRef;
///
/// let r = MindRef::parse("scout@experiment").unwrap();
/// assert_eq!(r.base, "scout");
/// assert_eq!(r.variant.as_deref(), Some("experiment"));
/// assert_eq!(r.key(), "scout@experiment");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MindRef {
    pub base: String,
    pub variant: Option<String>,
}

impl MindRef {
    pub fn parse(target: &str) -> Result<Self> {
        let target = target.trim();
        let (base, variant) = match target.split_once('@') {
            Some((base, variant)) => (base, Some(variant)),
            None => (target, None),
        };

        if base.is_empty() || variant.is_some_and(|v| v.is_empty() || v.contains('@')) {
            return Err(Error::UnknownMind(target.to_string()));
        }

        Ok(Self {
            base: base.to_string(),
            variant: variant.map(str::to_string),
        })
    }

    pub fn base(name: &str) -> Self {
        Self {
            base: name.to_string(),
            variant: None,
        }
    }

    /// Instance key used by the supervisor and the event buses.
    pub fn key(&self) -> String {
        match &self.variant {
            Some(v) => format!("{}@{}", self.base, v),
            None => self.base.clone(),
        }
    }
}

impl fmt::Display for MindRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}
