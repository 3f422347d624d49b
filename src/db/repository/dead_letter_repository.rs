use chrono::Utc;
use sqlx::SqlitePool;

use crate::db::models::{DeadLetterRecord, Task, TaskErrorRecord, TaskEvent};
use crate::error::{AppError, AppResult};

/// Repository for the terminal dead-letter table.
pub struct DeadLetterRepository;

impl DeadLetterRepository {
    /// Copy a task's final state, its final error and the tail of its
    /// event log into the dead-letter table.
    pub async fn insert(
        pool: &SqlitePool,
        task: &Task,
        final_error: &TaskErrorRecord,
        events_tail: &[TaskEvent],
    ) -> AppResult<DeadLetterRecord> {
        let now = Utc::now().naive_utc();
        let final_error_json = serde_json::to_string(final_error)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        let events_tail_json = serde_json::to_string(
            &events_tail.iter().map(|e| e.to_wire()).collect::<Vec<_>>(),
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let row = sqlx::query_as::<_, DeadLetterRecord>(
            r#"
            INSERT INTO tasks_dead_letter (
                task_id, task_type, priority, payload, config_json,
                attempt_count, final_error, events_tail_json,
                created_at, dead_lettered_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING task_id, task_type, priority, payload, config_json,
                      attempt_count, final_error, events_tail_json,
                      created_at, dead_lettered_at
            "#,
        )
        .bind(&task.id)
        .bind(&task.task_type)
        .bind(task.priority)
        .bind(&task.payload)
        .bind(&task.config_json)
        .bind(task.attempt)
        .bind(final_error_json)
        .bind(events_tail_json)
        .bind(task.created_at)
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_task_id(
        pool: &SqlitePool,
        task_id: &str,
    ) -> AppResult<Option<DeadLetterRecord>> {
        let row = sqlx::query_as::<_, DeadLetterRecord>(
            r#"
            SELECT task_id, task_type, priority, payload, config_json,
                   attempt_count, final_error, events_tail_json,
                   created_at, dead_lettered_at
            FROM tasks_dead_letter
            WHERE task_id = ?
            "#,
        )
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn list(pool: &SqlitePool, limit: i64) -> AppResult<Vec<DeadLetterRecord>> {
        let rows = sqlx::query_as::<_, DeadLetterRecord>(
            r#"
            SELECT task_id, task_type, priority, payload, config_json,
                   attempt_count, final_error, events_tail_json,
                   created_at, dead_lettered_at
            FROM tasks_dead_letter
            ORDER BY dead_lettered_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }
}
