use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Copy of a task's final state at the moment it exhausted retries or
/// failed non-retryably. Never re-executed automatically.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub task_id: String,
    pub task_type: String,
    pub priority: i64,
    pub payload: String,
    pub config_json: String,

    /// Total execution attempts made before dead-lettering.
    pub attempt_count: i64,

    /// Serialized `TaskErrorRecord` for the final failure.
    pub final_error: String,

    /// JSON array: the tail of the execution-event log at dead-letter
    /// time, for post-mortem without joining task_events.
    pub events_tail_json: String,

    pub created_at: NaiveDateTime,
    pub dead_lettered_at: NaiveDateTime,
}
