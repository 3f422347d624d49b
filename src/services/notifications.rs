//! Notification hub.
//!
//! The read side of the event bus: push-stream subscriptions for SSE and
//! WebSocket connections (bounded buffers, application-level heartbeats,
//! Last-Event-Id replay), webhook registration (delegated to the
//! dispatcher), and the polling catch-up API backed by the ring buffer
//! with the persistent log as fallback.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use crate::config::NotificationsConfig;
use crate::db::models::TaskEvent;
use crate::db::repository::EventRepository;
use crate::error::AppResult;
use crate::services::events::{EventBus, EventFilter, EventStream};

/// Catch-up response. `resume_gap` tells the client the requested range
/// had already left the ring and was (re)served from the persistent log;
/// a client holding only the ring contract should restart from the
/// returned events.
#[derive(Debug, serde::Serialize)]
pub struct PollResponse {
    pub events: Vec<serde_json::Value>,
    pub resume_gap: bool,
    /// Highest seq in `events`, for the next `since_seq`.
    pub last_seq: Option<i64>,
}

/// Replay outcome for Last-Event-Id style resumption.
pub struct Replay {
    pub events: Vec<TaskEvent>,
    /// The requested seq is no longer retained; the client receives a
    /// resume-gap sentinel before the live stream.
    pub resume_gap: bool,
}

pub struct NotificationHub {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    config: NotificationsConfig,
}

impl NotificationHub {
    pub fn new(pool: SqlitePool, bus: Arc<EventBus>, config: NotificationsConfig) -> Self {
        Self { pool, bus, config }
    }

    /// Open a push stream with the configured per-connection buffer.
    pub fn subscribe(&self, filter: EventFilter) -> EventStream {
        self.bus
            .subscribe_with_capacity(filter, self.config.push_buffer_size)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.config.push_heartbeat_interval_seconds.max(1))
    }

    /// Total events published on the bus since startup.
    pub fn events_published(&self) -> u64 {
        self.bus.published_count()
    }

    /// Events with seq > since_seq, ascending, up to limit. Ring first;
    /// the persistent log answers when the caller has fallen behind.
    pub async fn poll_since(
        &self,
        task_id: Option<&str>,
        since_seq: i64,
        limit: i64,
    ) -> AppResult<PollResponse> {
        let limit = limit.clamp(1, 1000);
        let ring = self.bus.poll_since(task_id, since_seq, limit as usize);

        if !ring.resume_gap {
            let events: Vec<serde_json::Value> =
                ring.events.iter().map(|e| e.to_wire()).collect();
            let last_seq = ring.events.last().map(|e| e.seq);
            return Ok(PollResponse {
                events,
                resume_gap: false,
                last_seq,
            });
        }

        // Fallen behind the ring: authoritative answer from the log.
        let task_id = task_id.expect("ring gaps are only flagged for task-scoped polls");
        let rows = EventRepository::list_since(&self.pool, task_id, since_seq, limit).await?;
        let last_seq = rows.last().map(|e| e.seq);
        Ok(PollResponse {
            events: rows.iter().map(|e| e.to_wire()).collect(),
            resume_gap: true,
            last_seq,
        })
    }

    /// Replay persisted events after `last_seq` for a reconnecting push
    /// client. When the requested position precedes the retained log the
    /// caller must be told to resynchronize instead.
    pub async fn replay(&self, task_id: &str, last_seq: i64, limit: i64) -> AppResult<Replay> {
        let events =
            EventRepository::list_since(&self.pool, task_id, last_seq, limit.clamp(1, 10_000))
                .await?;
        // The execution log is contiguous from 1; a hole right after
        // last_seq means the position is ahead of or outside the log.
        let resume_gap = events
            .first()
            .map(|e| e.seq != last_seq + 1)
            .unwrap_or_else(|| last_seq < 0);
        Ok(Replay { events, resume_gap })
    }
}
