//! Message history: the read/write contract plus SQLite and in-memory backends.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::payload::{Content, DeliveryPayload};
use crate::error::{Error, Result};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// One persisted message.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HistoryRecord {
    pub id: String,
    pub ts: i64,
    pub mind: String,
    pub direction: Direction,
    pub channel: String,
    pub sender: Option<String>,
    pub conversation_id: Option<String>,
    pub content: Content,
}

impl HistoryRecord {
    pub fn inbound(mind: &str, payload: &DeliveryPayload) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            mind: mind.to_string(),
            direction: Direction::Inbound,
            channel: payload.channel.clone(),
            sender: payload.sender.clone(),
            conversation_id: payload.conversation_id.clone(),
            content: payload.content.clone(),
        }
    }

    pub fn outbound(
        mind: &str,
        channel: Option<&str>,
        conversation_id: Option<&str>,
        content: &Content,
    ) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            mind: mind.to_string(),
            direction: Direction::Outbound,
            channel: channel.unwrap_or("unknown").to_string(),
            sender: Some(mind.to_string()),
            conversation_id: conversation_id.map(str::to_string),
            content: content.clone(),
        }
    }
}

/// Latest state of one conversation, used for stream snapshots.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: String,
    pub mind: String,
    pub channel: String,
    pub message_count: usize,
    pub last_ts: i64,
    pub last_preview: String,
}

/// Storage contract used by the delivery layer.
pub trait HistoryStore: Send + Sync {
    fn record(&self, record: &HistoryRecord) -> Result<()>;

    /// Most recently active conversations, newest first.
    fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>>;
}

/// SQLite-backed history at `<home>/state/history.db`.
pub struct SqliteHistory {
    path: PathBuf,
}

impl SqliteHistory {
    pub fn open(path: &Path) -> Result<Self> {
        let history = Self {
            path: path.to_path_buf(),
        };
        // Create the schema eagerly so a bad path fails at startup.
        history.connect()?;
        Ok(history)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)
            .map_err(|e| Error::Storage(format!("sqlite open: {}", e)))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                ts INTEGER NOT NULL,
                mind TEXT NOT NULL,
                direction TEXT NOT NULL,
                channel TEXT NOT NULL,
                sender TEXT,
                conversation_id TEXT,
                content TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_mind ON messages(mind, ts);
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, ts);
            "#,
        )
        .map_err(|e| Error::Storage(format!("sqlite init: {}", e)))?;
        Ok(conn)
    }
}

impl HistoryStore for SqliteHistory {
    fn record(&self, record: &HistoryRecord) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO messages (id, ts, mind, direction, channel, sender, conversation_id, content) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.ts,
                record.mind,
                record.direction.as_str(),
                record.channel,
                record.sender,
                record.conversation_id,
                serde_json::to_string(&record.content)?,
            ],
        )
        .map_err(|e| Error::Storage(format!("sqlite insert message: {}", e)))?;
        Ok(())
    }

    fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let conn = self.connect()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT m.conversation_id, m.mind, m.channel, c.n, m.ts, m.content
                FROM messages m
                JOIN (
                    SELECT conversation_id, COUNT(*) AS n, MAX(ts) AS last_ts
                    FROM messages
                    WHERE conversation_id IS NOT NULL
                    GROUP BY conversation_id
                ) c ON c.conversation_id = m.conversation_id AND c.last_ts = m.ts
                ORDER BY m.ts DESC
                LIMIT ?1
                "#,
            )
            .map_err(|e| Error::Storage(format!("sqlite prepare conversations: {}", e)))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| Error::Storage(format!("sqlite query conversations: {}", e)))?;

        let mut out: Vec<ConversationSummary> = Vec::new();
        for row in rows {
            let (conversation_id, mind, channel, n, ts, content) =
                row.map_err(|e| Error::Storage(format!("sqlite read conversation: {}", e)))?;
            // Two messages sharing the newest timestamp would duplicate the row.
            if out.iter().any(|c| c.conversation_id == conversation_id) {
                continue;
            }
            let preview = serde_json::from_str::<Content>(&content)
                .map(|c| c.preview(120))
                .unwrap_or_default();
            out.push(ConversationSummary {
                conversation_id,
                mind,
                channel,
                message_count: n as usize,
                last_ts: ts,
                last_preview: preview,
            });
        }
        Ok(out)
    }
}

/// In-memory history for tests and ephemeral daemons.
#[derive(Default)]
pub struct InMemoryHistory {
    records: Mutex<Vec<HistoryRecord>>,
}

impl InMemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl HistoryStore for InMemoryHistory {
    fn record(&self, record: &HistoryRecord) -> Result<()> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record.clone());
        Ok(())
    }

    fn recent_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ConversationSummary> = Vec::new();

        for record in records.iter() {
            let Some(conversation_id) = record.conversation_id.as_deref() else {
                continue;
            };
            match out.iter_mut().find(|c| c.conversation_id == conversation_id) {
                Some(summary) => {
                    summary.message_count += 1;
                    if record.ts >= summary.last_ts {
                        summary.last_ts = record.ts;
                        summary.mind = record.mind.clone();
                        summary.channel = record.channel.clone();
                        summary.last_preview = record.content.preview(120);
                    }
                }
                None => out.push(ConversationSummary {
                    conversation_id: conversation_id.to_string(),
                    mind: record.mind.clone(),
                    channel: record.channel.clone(),
                    message_count: 1,
                    last_ts: record.ts,
                    last_preview: record.content.preview(120),
                }),
            }
        }

        out.sort_by(|a, b| b.last_ts.cmp(&a.last_ts));
        out.truncate(limit);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(conversation: Option<&str>, text: &str) -> DeliveryPayload {
        let p = DeliveryPayload::new("dm", Some("ada"), Content::text(text));
        match conversation {
            Some(c) => p.with_conversation(c),
            None => p,
        }
    }

    #[test]
    fn test_sqlite_records_and_summarizes() {
        let dir = tempfile::tempdir().unwrap();
        let history = SqliteHistory::open(&dir.path().join("state").join("history.db")).unwrap();

        let mut first = HistoryRecord::inbound("scout", &payload(Some("c1"), "hello"));
        first.ts = 1_000;
        let mut reply = HistoryRecord::outbound("scout", Some("dm"), Some("c1"), &Content::text("hi ada"));
        reply.ts = 2_000;
        let mut other = HistoryRecord::inbound("scout", &payload(Some("c2"), "later"));
        other.ts = 3_000;
        let mut loose = HistoryRecord::inbound("scout", &payload(None, "no conversation"));
        loose.ts = 4_000;

        for r in [&first, &reply, &other, &loose] {
            history.record(r).unwrap();
        }

        let convs = history.recent_conversations(10).unwrap();
        assert_eq!(convs.len(), 2);
        assert_eq!(convs[0].conversation_id, "c2");
        assert_eq!(convs[1].conversation_id, "c1");
        assert_eq!(convs[1].message_count, 2);
        assert_eq!(convs[1].last_preview, "hi ada");

        let limited = history.recent_conversations(1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_in_memory_matches_sqlite_ordering() {
        let history = InMemoryHistory::new();
        let mut a = HistoryRecord::inbound("scout", &payload(Some("c1"), "a"));
        a.ts = 10;
        let mut b = HistoryRecord::inbound("scout", &payload(Some("c2"), "b"));
        b.ts = 20;
        history.record(&a).unwrap();
        history.record(&b).unwrap();

        let convs = history.recent_conversations(10).unwrap();
        assert_eq!(convs[0].conversation_id, "c2");
        assert_eq!(history.records().len(), 2);
    }
}
