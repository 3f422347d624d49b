use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{
        sse::{Event as SseEvent, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::db::models::{EventKind, TaskEvent};
use crate::error::{AppError, AppResult};
use crate::services::events::{EventFilter, StreamItem};
use crate::services::notifications::PollResponse;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(poll_events))
        .route("/stream", get(sse_stream))
        .route("/ws", get(ws_stream))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub task_id: Option<String>,
    /// Comma-separated event kinds; omitted means all.
    pub kinds: Option<String>,
    pub since_seq: Option<i64>,
    pub limit: Option<i64>,
}

impl EventsQuery {
    fn filter(&self) -> AppResult<EventFilter> {
        let kinds = match self.kinds.as_deref() {
            Some(raw) => {
                let mut kinds = Vec::new();
                for part in raw.split(',') {
                    let part = part.trim();
                    if part.is_empty() {
                        continue;
                    }
                    match EventKind::parse(part) {
                        Some(kind) => kinds.push(kind),
                        None => {
                            return Err(AppError::BadRequest(format!(
                                "unknown event kind: {}",
                                part
                            )))
                        }
                    }
                }
                Some(kinds)
            }
            None => None,
        };
        Ok(EventFilter {
            task_id: self.task_id.clone(),
            kinds,
        })
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Catch-up poll over the ring buffer, falling back to the persistent
/// log (with a resume-gap marker) when the caller has fallen behind.
async fn poll_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<PollResponse>> {
    let response = state
        .hub
        .poll_since(
            query.task_id.as_deref(),
            query.since_seq.unwrap_or(0),
            query.limit.unwrap_or(100),
        )
        .await?;
    Ok(Json(response))
}

fn sse_event(event: &TaskEvent) -> SseEvent {
    SseEvent::default()
        .id(event.seq.to_string())
        .event(event.kind.as_str())
        .data(event.to_wire().to_string())
}

/// Server-push stream. Honors `Last-Event-ID` for task-scoped streams by
/// replaying from the persistent log; a position outside the retained log
/// produces a `resume-gap` sentinel first. An application-level heartbeat
/// keeps intermediaries open and lets clients detect half-open sockets.
async fn sse_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> AppResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let filter = query.filter()?;

    let mut prelude: Vec<SseEvent> = Vec::new();
    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok());
    if let (Some(task_id), Some(last_seq)) = (query.task_id.as_deref(), last_event_id) {
        let replay = state.hub.replay(task_id, last_seq, 10_000).await?;
        if replay.resume_gap {
            prelude.push(SseEvent::default().event("resume-gap").data("{}"));
        }
        for event in &replay.events {
            prelude.push(sse_event(event));
        }
    }

    let mut stream = state.hub.subscribe(filter);
    let heartbeat_interval = state.hub.heartbeat_interval();

    let (tx, rx) = mpsc::channel::<Result<SseEvent, Infallible>>(64);
    tokio::spawn(async move {
        for item in prelude {
            if tx.send(Ok(item)).await.is_err() {
                return;
            }
        }
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;
        loop {
            let sse = tokio::select! {
                item = stream.recv() => match item {
                    StreamItem::Event(event) => sse_event(&event),
                    StreamItem::Gap => SseEvent::default().event("gap").data("{}"),
                },
                _ = heartbeat.tick() => SseEvent::default().event("heartbeat").data("{}"),
            };
            if tx.send(Ok(sse)).await.is_err() {
                break;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)))
}

/// Bidirectional socket carrying the same wire events as the SSE stream.
async fn ws_stream(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Response {
    let filter = match query.filter() {
        Ok(filter) => filter,
        Err(e) => return e.into_response(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, filter))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, filter: EventFilter) {
    let mut stream = state.hub.subscribe(filter);
    let mut heartbeat = tokio::time::interval(state.hub.heartbeat_interval());
    heartbeat.tick().await;

    loop {
        tokio::select! {
            item = stream.recv() => {
                let payload = match item {
                    StreamItem::Event(event) => event.to_wire().to_string(),
                    StreamItem::Gap => serde_json::json!({"kind": "gap"}).to_string(),
                };
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                let payload = serde_json::json!({"kind": "heartbeat"}).to_string();
                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    // Half-open or closed socket: tear the subscription down.
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}
