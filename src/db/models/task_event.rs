use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::TaskErrorRecord;

/// Wire-visible event kinds. The set is stable: push-stream clients,
/// webhook receivers and the polling API all key off these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventKind {
    StatusChange,
    Progress,
    Log,
    Resource,
    Error,
    Heartbeat,
    Completed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::StatusChange => "status_change",
            EventKind::Progress => "progress",
            EventKind::Log => "log",
            EventKind::Resource => "resource",
            EventKind::Error => "error",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "status_change" => Some(EventKind::StatusChange),
            "progress" => Some(EventKind::Progress),
            "log" => Some(EventKind::Log),
            "resource" => Some(EventKind::Resource),
            "error" => Some(EventKind::Error),
            "heartbeat" => Some(EventKind::Heartbeat),
            "completed" => Some(EventKind::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the append-only execution history.
///
/// `seq` is a per-task counter assigned by the event repository at insert
/// time; for each task the emitted values form a contiguous sequence
/// starting at 1.
#[derive(Debug, Clone, FromRow)]
pub struct TaskEvent {
    pub task_id: String,
    pub seq: i64,
    pub occurred_at: NaiveDateTime,
    pub kind: EventKind,
    pub payload_json: String,
}

impl TaskEvent {
    /// Parsed event payload. Falls back to null for rows whose payload
    /// cannot be parsed (should not happen for rows we wrote).
    pub fn data(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload_json).unwrap_or(serde_json::Value::Null)
    }

    /// The wire shape `{task_id, seq, occurred_at, kind, data}` delivered
    /// to push streams, webhooks and the polling API.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "task_id": self.task_id,
            "seq": self.seq,
            "occurred_at": self.occurred_at.and_utc().to_rfc3339(),
            "kind": self.kind,
            "data": self.data(),
        })
    }
}

/// `kind=status_change` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangeData {
    pub from: super::TaskStatus,
    pub to: super::TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `kind=progress` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressData {
    pub percent: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `kind=log` payload. `stream` is "stdout" or "stderr".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogData {
    pub stream: String,
    pub line: String,
}

/// `kind=error` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<TaskErrorRecord> for ErrorData {
    fn from(e: TaskErrorRecord) -> Self {
        Self {
            code: e.code,
            message: e.message,
            retryable: e.retryable,
        }
    }
}

/// `kind=completed` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}
