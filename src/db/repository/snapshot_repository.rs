use sqlx::SqlitePool;

use crate::db::models::ResourceSnapshot;
use crate::error::{AppError, AppResult};

/// Repository for append-only resource samples. The monitor is the only
/// writer.
pub struct SnapshotRepository;

impl SnapshotRepository {
    pub async fn insert(pool: &SqlitePool, snapshot: &ResourceSnapshot) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO task_resource_snapshots (
                task_id, sampled_at, cpu_percent, memory_bytes,
                io_read_bytes, io_write_bytes, net_rx_bytes, net_tx_bytes,
                fd_count, thread_count, process_state
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&snapshot.task_id)
        .bind(snapshot.sampled_at)
        .bind(snapshot.cpu_percent)
        .bind(snapshot.memory_bytes)
        .bind(snapshot.io_read_bytes)
        .bind(snapshot.io_write_bytes)
        .bind(snapshot.net_rx_bytes)
        .bind(snapshot.net_tx_bytes)
        .bind(snapshot.fd_count)
        .bind(snapshot.thread_count)
        .bind(&snapshot.process_state)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(())
    }

    /// Trailing `limit` snapshots for a task, newest first.
    pub async fn latest(
        pool: &SqlitePool,
        task_id: &str,
        limit: i64,
    ) -> AppResult<Vec<ResourceSnapshot>> {
        let rows = sqlx::query_as::<_, ResourceSnapshot>(
            r#"
            SELECT task_id, sampled_at, cpu_percent, memory_bytes,
                   io_read_bytes, io_write_bytes, net_rx_bytes, net_tx_bytes,
                   fd_count, thread_count, process_state
            FROM task_resource_snapshots
            WHERE task_id = ?
            ORDER BY sampled_at DESC
            LIMIT ?
            "#,
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Drop all but the newest `keep` rows for a task.
    pub async fn prune(pool: &SqlitePool, task_id: &str, keep: i64) -> AppResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM task_resource_snapshots
            WHERE task_id = ?
              AND id NOT IN (
                  SELECT id FROM task_resource_snapshots
                  WHERE task_id = ?
                  ORDER BY sampled_at DESC
                  LIMIT ?
              )
            "#,
        )
        .bind(task_id)
        .bind(task_id)
        .bind(keep)
        .execute(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(result.rows_affected())
    }
}
