//! Core data: payloads and addressing, message history, and the inbox spool.

pub mod history;
pub mod inbox;
pub mod payload;

pub use history::{HistoryRecord, HistoryStore, InMemoryHistory, SqliteHistory};
pub use inbox::{Inbox, InboxEntry, InboxRetry};
pub use payload::{Content, DeliveryPayload, MindRef};
