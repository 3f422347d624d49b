use chrono::{Duration, NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateTask, Task, TaskConfig, TaskStatus};
use crate::error::{AppError, AppResult};

/// Column list shared by every query that returns task rows.
const TASK_COLUMNS: &str = "\
    id, task_type, status, priority, payload, config_json, \
    progress, progress_message, attempt, last_heartbeat, claimed_by, \
    visibility_deadline, scheduled_at, required_cpu_cores, \
    required_memory_bytes, result_json, error_json, created_at, updated_at";

/// Outcome of a heartbeat attempt.
#[derive(Debug)]
pub enum HeartbeatOutcome {
    /// Lease extended; the refreshed row is returned.
    Extended(Task),
    /// The task was reaped or reassigned. The worker must abort
    /// execution without updating queue state.
    Lost,
}

/// Queue statistics: counts by status and by priority.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub by_status: Vec<StatusCount>,
    pub by_priority: Vec<PriorityCount>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StatusCount {
    pub status: TaskStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PriorityCount {
    pub priority: i64,
    pub count: i64,
}

/// Repository for the durable task table.
///
/// Implementation notes:
/// - Claiming uses an atomic single-statement UPDATE with a subselect:
///   `UPDATE ... WHERE id = (SELECT id FROM ... LIMIT 1) RETURNING ...`
///   This avoids a long-lived transaction and reduces contention on SQLite.
/// - Every transition that a worker performs is gated on `claimed_by` so a
///   reaped lease can never overwrite state written by the new owner.
pub struct TaskRepository;

impl TaskRepository {
    /// Insert a new task in `queued` state. Identity fields are assigned
    /// here; policy defaults are applied for omitted config.
    pub async fn create(pool: &SqlitePool, task: CreateTask) -> AppResult<Task> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let scheduled_at = task.scheduled_at.unwrap_or(now);
        let config = task.config.unwrap_or_default();
        let config_json = serde_json::to_string(&config)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let sql = format!(
            "INSERT INTO tasks (
                id, task_type, status, priority, payload, config_json,
                progress, attempt, scheduled_at, required_cpu_cores,
                required_memory_bytes, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, 0, 0, ?, ?, ?, ?, ?)
            RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .bind(task.task_type)
            .bind(TaskStatus::Queued)
            .bind(task.priority.unwrap_or(0))
            .bind(task.payload)
            .bind(config_json)
            .bind(scheduled_at)
            .bind(task.required_cpu_cores.unwrap_or(0.0))
            .bind(task.required_memory_bytes.unwrap_or(0))
            .bind(now)
            .bind(now)
            .fetch_one(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn find_by_id(pool: &SqlitePool, id: &str) -> AppResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn list(
        pool: &SqlitePool,
        status: Option<TaskStatus>,
        limit: i64,
    ) -> AppResult<Vec<Task>> {
        let rows = match status {
            Some(status) => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?
                     ORDER BY created_at DESC LIMIT ?"
                );
                sqlx::query_as::<_, Task>(&sql)
                    .bind(status)
                    .bind(limit)
                    .fetch_all(pool)
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC LIMIT ?"
                );
                sqlx::query_as::<_, Task>(&sql).bind(limit).fetch_all(pool).await
            }
        }
        .map_err(AppError::Database)?;
        Ok(rows)
    }

    /// Atomically claim the best eligible task for `worker_id`.
    ///
    /// Eligibility: status queued or pending, scheduled_at due, and
    /// resource requirements within the caller's remaining host budget.
    /// Ordering: priority DESC, then created_at ASC, then id ASC — a
    /// deterministic FIFO within each priority.
    pub async fn claim(
        pool: &SqlitePool,
        worker_id: &str,
        visibility: Duration,
        budget_cpu_cores: f64,
        budget_memory_bytes: i64,
    ) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let deadline = now + visibility;

        let sql = format!(
            "UPDATE tasks
             SET status = 'running',
                 claimed_by = ?,
                 visibility_deadline = ?,
                 attempt = attempt + 1,
                 last_heartbeat = ?,
                 updated_at = ?
             WHERE id = (
                 SELECT id FROM tasks
                 WHERE status IN ('queued', 'pending')
                   AND scheduled_at <= ?
                   AND required_cpu_cores <= ?
                   AND required_memory_bytes <= ?
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT 1
             )
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(worker_id)
            .bind(deadline)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(budget_cpu_cores)
            .bind(budget_memory_bytes)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(row)
    }

    /// Refresh the lease: bump `last_heartbeat` and extend the visibility
    /// deadline by `lease`. Gated on ownership; a non-owner heartbeat
    /// returns `Lost` and never mutates the row.
    pub async fn heartbeat(
        pool: &SqlitePool,
        id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> AppResult<HeartbeatOutcome> {
        let now = Utc::now().naive_utc();
        let deadline = now + lease;

        // 'stuck' keeps the lease alive while the owning worker finishes
        // the cancel-and-fail sequence.
        let sql = format!(
            "UPDATE tasks
             SET last_heartbeat = ?, visibility_deadline = ?, updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status IN ('running', 'stuck')
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(deadline)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;

        Ok(match row {
            Some(task) => HeartbeatOutcome::Extended(task),
            None => HeartbeatOutcome::Lost,
        })
    }

    /// Record task progress. Owner-gated like heartbeat.
    pub async fn update_progress(
        pool: &SqlitePool,
        id: &str,
        worker_id: &str,
        percent: i64,
        message: Option<String>,
    ) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET progress = ?, progress_message = ?, updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status IN ('running', 'paused')
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(percent.clamp(0, 100))
            .bind(message)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Cooperative release: running back to queued, claim fields cleared,
    /// attempt retained.
    pub async fn release(
        pool: &SqlitePool,
        id: &str,
        worker_id: &str,
    ) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = 'queued', claimed_by = NULL,
                 visibility_deadline = NULL, updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status IN ('running', 'paused')
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Terminal success. Clears the claim and pins progress at 100.
    pub async fn complete(
        pool: &SqlitePool,
        id: &str,
        worker_id: &str,
        result_json: Option<String>,
    ) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = 'completed', result_json = ?, progress = 100,
                 claimed_by = NULL, visibility_deadline = NULL, updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status = 'running'
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(result_json)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Retryable failure: back to queued with a deferred `scheduled_at`
    /// computed by the caller's backoff curve. Attempt is retained (it
    /// counts claims, not completions).
    pub async fn fail_retry(
        pool: &SqlitePool,
        id: &str,
        worker_id: &str,
        scheduled_at: NaiveDateTime,
        error_json: String,
    ) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = 'queued', scheduled_at = ?, error_json = ?,
                 claimed_by = NULL, visibility_deadline = NULL, updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status IN ('running', 'stuck')
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(scheduled_at)
            .bind(error_json)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Terminal failure without dead-letter (used for user-cancelled
    /// executions reported by the worker, and timeouts on endless tasks).
    pub async fn mark_failed(
        pool: &SqlitePool,
        id: &str,
        worker_id: &str,
        status: TaskStatus,
        error_json: String,
    ) -> AppResult<Option<Task>> {
        debug_assert!(matches!(status, TaskStatus::Failed | TaskStatus::Cancelled));
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = ?, error_json = ?, claimed_by = NULL,
                 visibility_deadline = NULL, updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status IN ('running', 'stuck', 'paused')
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(status)
            .bind(error_json)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Move a worker-owned task to `dead_letter` after the caller copied
    /// the row into the dead-letter table.
    pub async fn mark_dead_letter(
        pool: &SqlitePool,
        id: &str,
        worker_id: &str,
        error_json: String,
    ) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = 'dead_letter', error_json = ?, claimed_by = NULL,
                 visibility_deadline = NULL, updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status IN ('running', 'stuck')
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(error_json)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Detector-confirmed stuckness. The lease is retained so the owning
    /// worker can finish the cancel-and-fail sequence.
    pub async fn mark_stuck(
        pool: &SqlitePool,
        id: &str,
        worker_id: &str,
    ) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = 'stuck', updated_at = ?
             WHERE id = ? AND claimed_by = ? AND status = 'running'
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(id)
            .bind(worker_id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Pause suspends the lease clock: visibility_deadline is cleared but
    /// the claim is retained. Permitted only from running.
    pub async fn mark_paused(pool: &SqlitePool, id: &str) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = 'paused', visibility_deadline = NULL, updated_at = ?
             WHERE id = ? AND status = 'running'
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Resume re-enters the queue rather than restoring the in-flight
    /// lease; the worker that held it is expected to have released.
    pub async fn mark_resumed(pool: &SqlitePool, id: &str) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = 'queued', claimed_by = NULL,
                 visibility_deadline = NULL, updated_at = ?
             WHERE id = ? AND status = 'paused'
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Direct terminal cancellation for tasks not currently executing.
    /// Running tasks go through the cooperative path instead: the worker
    /// is signalled and acknowledges via `mark_failed(.., Cancelled, ..)`.
    pub async fn mark_cancelled(pool: &SqlitePool, id: &str) -> AppResult<Option<Task>> {
        let now = Utc::now().naive_utc();
        let sql = format!(
            "UPDATE tasks
             SET status = 'cancelled', claimed_by = NULL,
                 visibility_deadline = NULL, updated_at = ?
             WHERE id = ? AND status IN ('pending', 'queued', 'paused')
             RETURNING {TASK_COLUMNS}"
        );

        let row = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(row)
    }

    /// Return every expired lease to the queue. Attempt is left unchanged;
    /// this is what makes execution at-least-once under worker crashes.
    pub async fn reap(pool: &SqlitePool, now: NaiveDateTime) -> AppResult<Vec<Task>> {
        // 'stuck' rows are reaped too: a worker that died mid-way through
        // the stuck cancel sequence must not strand its task.
        let sql = format!(
            "UPDATE tasks
             SET status = 'queued', claimed_by = NULL,
                 visibility_deadline = NULL, updated_at = ?
             WHERE status IN ('running', 'stuck') AND visibility_deadline < ?
             RETURNING {TASK_COLUMNS}"
        );

        let rows = sqlx::query_as::<_, Task>(&sql)
            .bind(now)
            .bind(now)
            .fetch_all(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(rows)
    }

    pub async fn stats(pool: &SqlitePool) -> AppResult<QueueStats> {
        let by_status = sqlx::query_as::<_, StatusCount>(
            "SELECT status, COUNT(*) as count FROM tasks GROUP BY status",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        let by_priority = sqlx::query_as::<_, PriorityCount>(
            "SELECT priority, COUNT(*) as count FROM tasks GROUP BY priority ORDER BY priority DESC",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(QueueStats {
            by_status,
            by_priority,
        })
    }

    /// Effective retry limit for a task (its own config, defaulting per
    /// service config when absent from the stored json).
    pub fn max_retries(task: &Task, default: u32) -> u32 {
        let config: TaskConfig = serde_json::from_str(&task.config_json).unwrap_or(TaskConfig {
            max_retries: default,
            ..Default::default()
        });
        config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::test_support::test_pool;

    fn new_task(task_type: &str) -> CreateTask {
        CreateTask {
            task_type: task_type.to_string(),
            payload: "echo hi".to_string(),
            priority: None,
            config: None,
            scheduled_at: None,
            required_cpu_cores: None,
            required_memory_bytes: None,
        }
    }

    #[tokio::test]
    async fn identical_enqueues_produce_distinct_claimable_tasks() {
        let pool = test_pool().await;
        let a = TaskRepository::create(&pool, new_task("echo")).await.unwrap();
        let b = TaskRepository::create(&pool, new_task("echo")).await.unwrap();
        assert_ne!(a.id, b.id);

        let first = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();
        let second = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(first.status, TaskStatus::Running);
        assert_eq!(first.attempt, 1);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_fifo() {
        let pool = test_pool().await;
        let low = TaskRepository::create(
            &pool,
            CreateTask {
                priority: Some(-10),
                ..new_task("low")
            },
        )
        .await
        .unwrap();
        let critical = TaskRepository::create(
            &pool,
            CreateTask {
                priority: Some(100),
                ..new_task("critical")
            },
        )
        .await
        .unwrap();

        let first = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, critical.id);

        let second = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn claim_skips_deferred_and_over_budget_tasks() {
        let pool = test_pool().await;
        TaskRepository::create(
            &pool,
            CreateTask {
                scheduled_at: Some(Utc::now().naive_utc() + Duration::hours(1)),
                ..new_task("deferred")
            },
        )
        .await
        .unwrap();
        TaskRepository::create(
            &pool,
            CreateTask {
                required_cpu_cores: Some(32.0),
                required_memory_bytes: Some(1 << 40),
                ..new_task("huge")
            },
        )
        .await
        .unwrap();

        // Budget below every queued task's requirement returns none even
        // though queued tasks exist.
        let claimed = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 2.0, 1 << 30)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn heartbeat_is_owner_gated_and_idempotent() {
        let pool = test_pool().await;
        TaskRepository::create(&pool, new_task("hb")).await.unwrap();
        let claimed = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();

        for _ in 0..3 {
            match TaskRepository::heartbeat(&pool, &claimed.id, "w1", Duration::seconds(60))
                .await
                .unwrap()
            {
                HeartbeatOutcome::Extended(task) => {
                    assert!(task.visibility_deadline.is_some());
                }
                HeartbeatOutcome::Lost => panic!("owner heartbeat must not be lost"),
            }
        }

        // A non-owner heartbeat returns lost and never updates state.
        let before = TaskRepository::find_by_id(&pool, &claimed.id)
            .await
            .unwrap()
            .unwrap();
        match TaskRepository::heartbeat(&pool, &claimed.id, "w2", Duration::seconds(600))
            .await
            .unwrap()
        {
            HeartbeatOutcome::Lost => {}
            HeartbeatOutcome::Extended(_) => panic!("non-owner heartbeat must be lost"),
        }
        let after = TaskRepository::find_by_id(&pool, &claimed.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.visibility_deadline, after.visibility_deadline);
        assert_eq!(after.claimed_by.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn reap_returns_expired_leases_with_attempt_retained() {
        let pool = test_pool().await;
        TaskRepository::create(&pool, new_task("crash")).await.unwrap();
        let claimed =
            TaskRepository::claim(&pool, "w1", Duration::milliseconds(-1), 100.0, i64::MAX)
                .await
                .unwrap()
                .unwrap();
        assert_eq!(claimed.attempt, 1);

        let reaped = TaskRepository::reap(&pool, Utc::now().naive_utc())
            .await
            .unwrap();
        assert_eq!(reaped.len(), 1);
        let task = &reaped[0];
        assert_eq!(task.status, TaskStatus::Queued);
        assert_eq!(task.attempt, 1);
        assert!(task.claimed_by.is_none());
        assert!(task.visibility_deadline.is_none());

        // Reclaim bumps attempt: the crash-retry scenario ends with
        // attempt 2 on the successful run.
        let reclaimed = TaskRepository::claim(&pool, "w2", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempt, 2);
        let done = TaskRepository::complete(&pool, &reclaimed.id, "w2", None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn claim_invariants_hold_across_transitions() {
        let pool = test_pool().await;
        TaskRepository::create(&pool, new_task("inv")).await.unwrap();
        let claimed = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();
        // running: claimed_by and visibility_deadline both set
        assert!(claimed.claimed_by.is_some());
        assert!(claimed.visibility_deadline.is_some());

        // paused: claim retained, lease clock suspended
        let paused = TaskRepository::mark_paused(&pool, &claimed.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paused.status, TaskStatus::Paused);
        assert!(paused.claimed_by.is_some());
        assert!(paused.visibility_deadline.is_none());

        // resumed: back to queued with claim cleared
        let resumed = TaskRepository::mark_resumed(&pool, &paused.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resumed.status, TaskStatus::Queued);
        assert!(resumed.claimed_by.is_none());

        // queued: direct cancel is terminal
        let cancelled = TaskRepository::mark_cancelled(&pool, &resumed.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.claimed_by.is_none());
        assert!(cancelled.visibility_deadline.is_none());
    }

    #[tokio::test]
    async fn fail_retry_requeues_with_deferred_schedule() {
        let pool = test_pool().await;
        TaskRepository::create(&pool, new_task("flaky")).await.unwrap();
        let claimed = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();

        let later = Utc::now().naive_utc() + Duration::seconds(30);
        let requeued = TaskRepository::fail_retry(
            &pool,
            &claimed.id,
            "w1",
            later,
            r#"{"code":"exit_1","message":"exit 1","retryable":true}"#.to_string(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.attempt, 1);
        assert_eq!(requeued.scheduled_at, later);

        // Not claimable until the backoff elapses.
        let claimed = TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn stats_counts_by_status_and_priority() {
        let pool = test_pool().await;
        TaskRepository::create(&pool, new_task("a")).await.unwrap();
        TaskRepository::create(
            &pool,
            CreateTask {
                priority: Some(5),
                ..new_task("b")
            },
        )
        .await
        .unwrap();
        TaskRepository::claim(&pool, "w1", Duration::seconds(60), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();

        let stats = TaskRepository::stats(&pool).await.unwrap();
        let queued = stats
            .by_status
            .iter()
            .find(|c| c.status == TaskStatus::Queued)
            .map(|c| c.count)
            .unwrap_or(0);
        let running = stats
            .by_status
            .iter()
            .find(|c| c.status == TaskStatus::Running)
            .map(|c| c.count)
            .unwrap_or(0);
        assert_eq!(queued, 1);
        assert_eq!(running, 1);
        assert_eq!(stats.by_priority.len(), 2);
    }
}
