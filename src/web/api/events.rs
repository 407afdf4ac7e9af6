//! Server-sent event streams: a snapshot first, then the live tail.

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Deserialize;
use std::convert::Infallible;
use tokio_stream::{Stream, StreamExt};

use crate::events::{EventStream, SequencedEvent};
use crate::web::AppState;

#[derive(Deserialize, Default)]
pub struct StreamQuery {
    /// Comma-separated conversation ids to follow.
    #[serde(default)]
    pub conversations: Option<String>,
}

/// Activity for the whole fleet plus any requested conversations.
pub async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let conversations: Vec<String> = query
        .conversations
        .as_deref()
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    open_stream(&state, &conversations, last_event_id(&headers))
}

pub async fn conversation_events(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    open_stream(&state, &[conversation_id], last_event_id(&headers))
}

fn open_stream(
    state: &AppState,
    conversations: &[String],
    last_event_id: Option<u64>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = EventStream::open(
        &state.hub,
        state.sequencer.clone(),
        state.snapshots.as_ref(),
        conversations,
        last_event_id,
    )
    .into_stream()
    .map(|event| Ok::<_, Infallible>(to_sse(&event)));

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

pub fn to_sse(event: &SequencedEvent) -> Event {
    let data = serde_json::to_value(&event.data)
        .ok()
        .and_then(|mut v| v.get_mut("data").map(serde_json::Value::take))
        .unwrap_or(serde_json::Value::Null);

    Event::default()
        .id(event.id.to_string())
        .event(event.data.name())
        .data(data.to_string())
}
