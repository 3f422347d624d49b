use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{EventKind, TaskEvent};
use crate::error::{AppError, AppResult};

/// Repository for the append-only execution-history log.
///
/// `seq` is assigned inside the INSERT with a `COALESCE(MAX(seq),0)+1`
/// subselect so the counter stays contiguous per task without a separate
/// sequence table or a long-lived transaction.
pub struct EventRepository;

impl EventRepository {
    /// Append an event and return the stored row (with its assigned seq).
    pub async fn append(
        pool: &SqlitePool,
        task_id: &str,
        kind: EventKind,
        payload: &serde_json::Value,
    ) -> AppResult<TaskEvent> {
        let now = Utc::now().naive_utc();
        let payload_json = payload.to_string();

        let row = sqlx::query_as::<_, TaskEvent>(
            r#"
            INSERT INTO task_events (task_id, seq, occurred_at, kind, payload_json)
            VALUES (
                ?,
                (SELECT COALESCE(MAX(seq), 0) + 1 FROM task_events WHERE task_id = ?),
                ?, ?, ?
            )
            RETURNING task_id, seq, occurred_at, kind, payload_json
            "#,
        )
        .bind(task_id)
        .bind(task_id)
        .bind(now)
        .bind(kind)
        .bind(payload_json)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Events for one task with seq > since_seq, ascending, up to limit.
    /// Backs Last-Event-Id resumption and the polling fallback.
    pub async fn list_since(
        pool: &SqlitePool,
        task_id: &str,
        since_seq: i64,
        limit: i64,
    ) -> AppResult<Vec<TaskEvent>> {
        let rows = sqlx::query_as::<_, TaskEvent>(
            r#"
            SELECT task_id, seq, occurred_at, kind, payload_json
            FROM task_events
            WHERE task_id = ? AND seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(since_seq)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// The trailing `limit` events for a task, ascending. Used to snapshot
    /// the event tail into dead-letter records.
    pub async fn tail(pool: &SqlitePool, task_id: &str, limit: i64) -> AppResult<Vec<TaskEvent>> {
        let mut rows = sqlx::query_as::<_, TaskEvent>(
            r#"
            SELECT task_id, seq, occurred_at, kind, payload_json
            FROM task_events
            WHERE task_id = ?
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        rows.reverse();
        Ok(rows)
    }

    /// Highest seq assigned for a task, 0 when none.
    pub async fn last_seq(pool: &SqlitePool, task_id: &str) -> AppResult<i64> {
        let seq: (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(seq), 0) FROM task_events WHERE task_id = ?")
                .bind(task_id)
                .fetch_one(pool)
                .await
                .map_err(AppError::Database)?;
        Ok(seq.0)
    }
}
