//! Queue service: owns every task status transition.
//!
//! Thin orchestration over `TaskRepository`: validates at enqueue,
//! computes retry backoff, moves exhausted tasks to the dead-letter
//! table, runs the reaper, and emits the corresponding lifecycle events
//! on the bus. No other component mutates task status.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::Rng;
use sqlx::SqlitePool;

use crate::config::QueueConfig;
use crate::db::models::{
    CompletedData, CreateTask, ErrorData, EventKind, StatusChangeData, Task, TaskErrorRecord,
    TaskStatus,
};
use crate::db::repository::{
    DeadLetterRepository, EventRepository, HeartbeatOutcome, QueueStats, TaskRepository,
};
use crate::error::{AppError, AppResult};
use crate::services::events::EventBus;

/// Number of trailing events copied into a dead-letter record.
const DEAD_LETTER_EVENT_TAIL: i64 = 50;

/// Upper bound on accepted payload size at enqueue.
const MAX_PAYLOAD_BYTES: usize = 1 << 20;

/// Exponential backoff with a cap and a symmetric jitter fraction.
///
/// The delay before re-running attempt `attempt + 1` is
/// `min(cap, base * 2^(attempt-1))`, jittered by ±`jitter` of itself.
pub fn retry_backoff(attempt: i64, base_seconds: u64, cap_seconds: u64, jitter: f64) -> Duration {
    let exp = (attempt - 1).clamp(0, 30) as u32;
    let raw = base_seconds
        .saturating_mul(1u64 << exp)
        .min(cap_seconds.max(1));
    let span = raw as f64 * jitter.clamp(0.0, 1.0);
    let offset = if span > 0.0 {
        rand::thread_rng().gen_range(-span..=span)
    } else {
        0.0
    };
    let millis = ((raw as f64 + offset).max(0.0) * 1000.0) as i64;
    Duration::milliseconds(millis)
}

/// Outcome of a cancel request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// The task was not executing; it is now terminally cancelled.
    Cancelled(Task),
    /// The task is executing. The caller must signal the owning worker
    /// through its cooperative cancellation channel; status moves to
    /// cancelled only after the worker acknowledges or the lease expires.
    SignalRunning(Task),
    /// Already in an absorbing state; nothing to do.
    AlreadyTerminal(Task),
    NotFound,
}

pub struct QueueService {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    config: QueueConfig,
}

impl QueueService {
    pub fn new(pool: SqlitePool, bus: Arc<EventBus>, config: QueueConfig) -> Self {
        Self { pool, bus, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    fn validate(&self, task: &CreateTask) -> AppResult<()> {
        if task.task_type.trim().is_empty() {
            return Err(AppError::Validation("task_type must not be empty".to_string()));
        }
        if task.payload.len() > MAX_PAYLOAD_BYTES {
            return Err(AppError::Validation(format!(
                "payload exceeds {} bytes",
                MAX_PAYLOAD_BYTES
            )));
        }
        if task.required_cpu_cores.unwrap_or(0.0) < 0.0 {
            return Err(AppError::Validation(
                "required_cpu_cores must be >= 0".to_string(),
            ));
        }
        if task.required_memory_bytes.unwrap_or(0) < 0 {
            return Err(AppError::Validation(
                "required_memory_bytes must be >= 0".to_string(),
            ));
        }
        if let Some(ref config) = task.config {
            if config.grace_termination_seconds == 0 {
                return Err(AppError::Validation(
                    "grace_termination_seconds must be > 0".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Validate and store a new task, then announce pending -> queued.
    /// Identical payloads are deliberately not deduplicated.
    pub async fn enqueue(&self, task: CreateTask) -> AppResult<Task> {
        self.validate(&task)?;

        let row = self
            .with_store_retry(|| TaskRepository::create(&self.pool, task.clone()))
            .await?;

        self.publish_status(&row.id, TaskStatus::Pending, TaskStatus::Queued, None)
            .await;
        tracing::info!(
            task_id = %row.id,
            task_type = %row.task_type,
            priority = row.priority,
            "task enqueued"
        );
        Ok(row)
    }

    /// Claim the best eligible task within the worker's remaining host
    /// budget. Emits queued -> running on success.
    pub async fn claim(
        &self,
        worker_id: &str,
        budget_cpu_cores: f64,
        budget_memory_bytes: i64,
    ) -> AppResult<Option<Task>> {
        let visibility = Duration::seconds(self.config.visibility_timeout_seconds as i64);
        let claimed = self
            .with_store_retry(|| {
                TaskRepository::claim(
                    &self.pool,
                    worker_id,
                    visibility,
                    budget_cpu_cores,
                    budget_memory_bytes,
                )
            })
            .await?;

        if let Some(ref task) = claimed {
            self.publish_status(
                &task.id,
                TaskStatus::Queued,
                TaskStatus::Running,
                Some(format!("claimed by {}", worker_id)),
            )
            .await;
        }
        Ok(claimed)
    }

    /// Extend the lease, optionally piggybacking a progress update. The
    /// returned outcome tells the worker whether it still owns the task;
    /// `Lost` means abort without queue writes.
    pub async fn heartbeat(
        &self,
        id: &str,
        worker_id: &str,
        progress: Option<(i64, Option<String>)>,
    ) -> AppResult<HeartbeatOutcome> {
        let lease = Duration::seconds(self.config.visibility_timeout_seconds as i64);
        let outcome = TaskRepository::heartbeat(&self.pool, id, worker_id, lease).await?;
        if matches!(outcome, HeartbeatOutcome::Extended(_)) {
            self.publish(id, EventKind::Heartbeat, serde_json::json!({})).await;
            if let Some((percent, message)) = progress {
                self.progress(id, worker_id, percent, message).await?;
            }
        }
        Ok(outcome)
    }

    pub async fn progress(
        &self,
        id: &str,
        worker_id: &str,
        percent: i64,
        message: Option<String>,
    ) -> AppResult<()> {
        let updated =
            TaskRepository::update_progress(&self.pool, id, worker_id, percent, message.clone())
                .await?;
        if updated.is_some() {
            self.publish(
                id,
                EventKind::Progress,
                serde_json::json!({ "percent": percent.clamp(0, 100), "message": message }),
            )
            .await;
        }
        Ok(())
    }

    pub async fn log_line(&self, id: &str, stream: &str, line: String) {
        self.publish(
            id,
            EventKind::Log,
            serde_json::json!({ "stream": stream, "line": line }),
        )
        .await;
    }

    /// Cooperative release back to the queue (shutdown, resume handoff).
    pub async fn release(&self, id: &str, worker_id: &str, reason: &str) -> AppResult<()> {
        if TaskRepository::release(&self.pool, id, worker_id).await?.is_some() {
            self.publish_status(
                id,
                TaskStatus::Running,
                TaskStatus::Queued,
                Some(reason.to_string()),
            )
            .await;
        }
        Ok(())
    }

    /// Terminal success.
    pub async fn complete(
        &self,
        id: &str,
        worker_id: &str,
        result: Option<serde_json::Value>,
    ) -> AppResult<Task> {
        let result_json = result.as_ref().map(|v| v.to_string());
        let task = TaskRepository::complete(&self.pool, id, worker_id, result_json)
            .await?
            .ok_or(AppError::ClaimLost)?;

        self.publish_status(id, TaskStatus::Running, TaskStatus::Completed, None)
            .await;
        let data = CompletedData {
            result,
            error: None,
        };
        self.publish(
            id,
            EventKind::Completed,
            serde_json::to_value(&data).unwrap_or_default(),
        )
        .await;
        tracing::info!(task_id = %id, attempt = task.attempt, "task completed");
        Ok(task)
    }

    /// Record a failed execution. Retryable failures with attempts left
    /// re-enter the queue on the backoff curve; everything else is copied
    /// to the dead-letter table.
    pub async fn fail(
        &self,
        id: &str,
        worker_id: &str,
        error: TaskErrorRecord,
    ) -> AppResult<Task> {
        let task = TaskRepository::find_by_id(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {}", id)))?;
        let max_retries = TaskRepository::max_retries(&task, self.config.max_retries) as i64;

        if error.retryable && task.attempt <= max_retries {
            let delay = retry_backoff(
                task.attempt,
                self.config.retry_backoff_base_seconds,
                self.config.retry_backoff_cap_seconds,
                self.config.jitter,
            );
            let scheduled_at = Utc::now().naive_utc() + delay;
            let error_json = serde_json::to_string(&error)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

            let requeued =
                TaskRepository::fail_retry(&self.pool, id, worker_id, scheduled_at, error_json)
                    .await?
                    .ok_or(AppError::ClaimLost)?;

            self.publish(
                id,
                EventKind::Error,
                serde_json::to_value(ErrorData::from(error.clone())).unwrap_or_default(),
            )
            .await;
            self.publish_status(
                id,
                TaskStatus::Running,
                TaskStatus::Queued,
                Some(format!("retry {}/{} in {}s", task.attempt, max_retries, delay.num_seconds())),
            )
            .await;
            tracing::warn!(
                task_id = %id,
                attempt = task.attempt,
                delay_seconds = delay.num_seconds(),
                "task failed, retry scheduled"
            );
            return Ok(requeued);
        }

        self.dead_letter(task, worker_id, error).await
    }

    async fn dead_letter(
        &self,
        task: Task,
        worker_id: &str,
        error: TaskErrorRecord,
    ) -> AppResult<Task> {
        // The terminal record always carries retryable=false: whatever the
        // original classification, this task will not run again.
        let final_error = TaskErrorRecord {
            retryable: false,
            ..error
        };
        let error_json = serde_json::to_string(&final_error)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let tail = EventRepository::tail(&self.pool, &task.id, DEAD_LETTER_EVENT_TAIL).await?;
        DeadLetterRepository::insert(&self.pool, &task, &final_error, &tail).await?;

        let updated =
            TaskRepository::mark_dead_letter(&self.pool, &task.id, worker_id, error_json)
                .await?
                .ok_or(AppError::ClaimLost)?;

        self.publish(
            &task.id,
            EventKind::Error,
            serde_json::to_value(ErrorData::from(final_error.clone())).unwrap_or_default(),
        )
        .await;
        self.publish_status(&task.id, task.status, TaskStatus::Failed, None)
            .await;
        self.publish_status(
            &task.id,
            TaskStatus::Failed,
            TaskStatus::DeadLetter,
            Some(format!("attempt {} exhausted", task.attempt)),
        )
        .await;
        self.publish(
            &task.id,
            EventKind::Completed,
            serde_json::to_value(CompletedData {
                result: None,
                error: Some(final_error.into()),
            })
            .unwrap_or_default(),
        )
        .await;

        tracing::error!(task_id = %task.id, attempt = task.attempt, "task dead-lettered");
        Ok(updated)
    }

    /// Worker acknowledgement of a user cancellation: terminal.
    pub async fn cancel_ack(
        &self,
        id: &str,
        worker_id: &str,
        reason: &str,
    ) -> AppResult<Task> {
        let error = TaskErrorRecord {
            code: "cancelled".to_string(),
            message: reason.to_string(),
            retryable: false,
        };
        let error_json = serde_json::to_string(&error)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        let task =
            TaskRepository::mark_failed(&self.pool, id, worker_id, TaskStatus::Cancelled, error_json)
                .await?
                .ok_or(AppError::ClaimLost)?;

        self.publish_status(
            id,
            TaskStatus::Running,
            TaskStatus::Cancelled,
            Some(reason.to_string()),
        )
        .await;
        self.publish(
            id,
            EventKind::Completed,
            serde_json::to_value(CompletedData {
                result: None,
                error: Some(error.into()),
            })
            .unwrap_or_default(),
        )
        .await;
        Ok(task)
    }

    /// Detector-confirmed stuckness, reported by the owning worker.
    pub async fn mark_stuck(&self, id: &str, worker_id: &str, reason: &str) -> AppResult<()> {
        if TaskRepository::mark_stuck(&self.pool, id, worker_id).await?.is_some() {
            self.publish_status(
                id,
                TaskStatus::Running,
                TaskStatus::Stuck,
                Some(reason.to_string()),
            )
            .await;
        }
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> AppResult<Task> {
        let task = TaskRepository::mark_paused(&self.pool, id)
            .await?
            .ok_or_else(|| {
                AppError::Conflict("pause is only permitted from running".to_string())
            })?;
        self.publish_status(id, TaskStatus::Running, TaskStatus::Paused, None)
            .await;
        Ok(task)
    }

    pub async fn resume(&self, id: &str) -> AppResult<Task> {
        let task = TaskRepository::mark_resumed(&self.pool, id)
            .await?
            .ok_or_else(|| {
                AppError::Conflict("resume is only permitted from paused".to_string())
            })?;
        self.publish_status(id, TaskStatus::Paused, TaskStatus::Queued, None)
            .await;
        Ok(task)
    }

    /// Cancel from any non-terminal status. Running tasks are signalled
    /// through the worker's cancellation channel by the caller.
    pub async fn cancel(&self, id: &str) -> AppResult<CancelOutcome> {
        let Some(task) = TaskRepository::find_by_id(&self.pool, id).await? else {
            return Ok(CancelOutcome::NotFound);
        };
        if task.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(task));
        }
        if matches!(task.status, TaskStatus::Running | TaskStatus::Stuck) {
            return Ok(CancelOutcome::SignalRunning(task));
        }

        let from = task.status;
        match TaskRepository::mark_cancelled(&self.pool, id).await? {
            Some(cancelled) => {
                self.publish_status(id, from, TaskStatus::Cancelled, Some("user cancel".to_string()))
                    .await;
                Ok(CancelOutcome::Cancelled(cancelled))
            }
            // Raced with a claim; the task is executing now.
            None => match TaskRepository::find_by_id(&self.pool, id).await? {
                Some(task) => Ok(CancelOutcome::SignalRunning(task)),
                None => Ok(CancelOutcome::NotFound),
            },
        }
    }

    /// One reaper pass: return expired leases to the queue.
    pub async fn reap_expired(&self) -> AppResult<Vec<Task>> {
        let reaped = TaskRepository::reap(&self.pool, Utc::now().naive_utc()).await?;
        for task in &reaped {
            tracing::warn!(
                task_id = %task.id,
                attempt = task.attempt,
                "lease expired, task returned to queue"
            );
            self.publish_status(
                &task.id,
                TaskStatus::Running,
                TaskStatus::Queued,
                Some("lease expired".to_string()),
            )
            .await;
        }
        Ok(reaped)
    }

    pub async fn stats(&self) -> AppResult<QueueStats> {
        TaskRepository::stats(&self.pool).await
    }

    pub async fn get(&self, id: &str) -> AppResult<Option<Task>> {
        TaskRepository::find_by_id(&self.pool, id).await
    }

    pub async fn list(&self, status: Option<TaskStatus>, limit: i64) -> AppResult<Vec<Task>> {
        TaskRepository::list(&self.pool, status, limit).await
    }

    /// Run the reaper until shutdown. The first pass runs immediately so
    /// leases that expired while the process was down are recovered on
    /// boot.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let interval = std::time::Duration::from_secs(self.config.reap_interval_seconds);
        loop {
            if let Err(e) = self.reap_expired().await {
                tracing::warn!("reaper pass failed: {:?}", e);
            }
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("reaper shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Bounded retry for store write failures; a persistent outage
    /// surfaces as StoreUnavailable and halts the caller without
    /// corrupting state.
    async fn with_store_retry<T, F, Fut>(&self, mut op: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = AppResult<T>>,
    {
        let mut attempts = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(AppError::Database(e)) => {
                    attempts += 1;
                    if attempts >= self.config.store_retry_attempts.max(1) {
                        return Err(AppError::StoreUnavailable(e.to_string()));
                    }
                    tracing::warn!(attempt = attempts, "store write failed, retrying: {:?}", e);
                    tokio::time::sleep(std::time::Duration::from_millis(
                        100 * u64::from(attempts),
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn publish_status(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        reason: Option<String>,
    ) {
        let data = StatusChangeData { from, to, reason };
        self.publish(
            task_id,
            EventKind::StatusChange,
            serde_json::to_value(&data).unwrap_or_default(),
        )
        .await;
    }

    /// Event emission must never fail task execution; bus errors are
    /// logged and swallowed here.
    async fn publish(&self, task_id: &str, kind: EventKind, data: serde_json::Value) {
        if let Err(e) = self.bus.publish(task_id, kind, data).await {
            tracing::warn!(task_id = %task_id, kind = %kind, "event publish failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::test_support::test_pool;
    use crate::services::events::EventFilter;

    async fn service() -> (Arc<QueueService>, Arc<EventBus>, SqlitePool) {
        let pool = test_pool().await;
        let bus = Arc::new(EventBus::new(pool.clone(), 1024, 256));
        let config = QueueConfig {
            poll_interval_seconds: 1,
            visibility_timeout_seconds: 60,
            max_retries: 2,
            retry_backoff_base_seconds: 30,
            retry_backoff_cap_seconds: 3600,
            jitter: 0.0,
            reap_interval_seconds: 10,
            store_retry_attempts: 3,
        };
        (
            Arc::new(QueueService::new(pool.clone(), bus.clone(), config)),
            bus,
            pool,
        )
    }

    fn new_task() -> CreateTask {
        CreateTask {
            task_type: "echo".to_string(),
            payload: "echo hi".to_string(),
            priority: None,
            config: None,
            scheduled_at: None,
            required_cpu_cores: None,
            required_memory_bytes: None,
        }
    }

    #[test]
    fn backoff_follows_capped_exponential_curve() {
        assert_eq!(retry_backoff(1, 30, 3600, 0.0).num_seconds(), 30);
        assert_eq!(retry_backoff(2, 30, 3600, 0.0).num_seconds(), 60);
        assert_eq!(retry_backoff(3, 30, 3600, 0.0).num_seconds(), 120);
        // Cap bounds the curve.
        assert_eq!(retry_backoff(20, 30, 3600, 0.0).num_seconds(), 3600);
    }

    #[test]
    fn backoff_jitter_stays_within_fraction() {
        for attempt in 1..6 {
            let raw = 30u64 * (1 << (attempt - 1)) as u64;
            for _ in 0..50 {
                let delay = retry_backoff(attempt as i64, 30, 3600, 0.25);
                let millis = delay.num_milliseconds() as f64;
                assert!(millis >= raw as f64 * 750.0, "attempt {}: {}", attempt, millis);
                assert!(millis <= raw as f64 * 1250.0, "attempt {}: {}", attempt, millis);
            }
        }
    }

    #[tokio::test]
    async fn enqueue_rejects_malformed_tasks_without_storing() {
        let (service, _bus, pool) = service().await;
        let result = service
            .enqueue(CreateTask {
                task_type: "  ".to_string(),
                ..new_task()
            })
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));

        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn happy_path_emits_contiguous_lifecycle_events() {
        let (service, bus, _pool) = service().await;
        let task = service.enqueue(new_task()).await.unwrap();
        let mut stream = bus.subscribe(EventFilter::for_task(task.id.clone()));

        let claimed = service.claim("w1", 100.0, i64::MAX).await.unwrap().unwrap();
        assert_eq!(claimed.id, task.id);
        service.progress(&task.id, "w1", 50, None).await.unwrap();
        service.progress(&task.id, "w1", 100, None).await.unwrap();
        service.complete(&task.id, "w1", None).await.unwrap();

        let events = EventRepository::list_since(&service.pool, &task.id, 0, 100)
            .await
            .unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::StatusChange, // pending -> queued
                EventKind::StatusChange, // queued -> running
                EventKind::Progress,
                EventKind::Progress,
                EventKind::StatusChange, // running -> completed
                EventKind::Completed,
            ]
        );
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=6).collect::<Vec<i64>>());

        // The live subscriber saw the post-subscription slice in order.
        let mut live = Vec::new();
        while let Some(item) = stream.try_recv() {
            if let crate::services::events::StreamItem::Event(e) = item {
                live.push(e.seq);
            }
        }
        assert_eq!(live, (2..=6).collect::<Vec<i64>>());

        let done = service.get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.progress, 100);
    }

    #[tokio::test]
    async fn retry_exhaustion_dead_letters_with_terminal_error() {
        let (service, _bus, pool) = service().await;
        let task = service
            .enqueue(CreateTask {
                config: Some(crate::db::models::TaskConfig {
                    max_retries: 2,
                    ..Default::default()
                }),
                ..new_task()
            })
            .await
            .unwrap();

        let error = TaskErrorRecord {
            code: "exit_1".to_string(),
            message: "process exited with status 1".to_string(),
            retryable: true,
        };

        // Attempts 1 and 2 requeue on the backoff curve.
        for expected_attempt in 1..=2 {
            // Make the task immediately claimable for the test.
            sqlx::query("UPDATE tasks SET scheduled_at = ? WHERE id = ?")
                .bind(Utc::now().naive_utc())
                .bind(&task.id)
                .execute(&pool)
                .await
                .unwrap();
            let claimed = service.claim("w1", 100.0, i64::MAX).await.unwrap().unwrap();
            assert_eq!(claimed.attempt, expected_attempt);
            let failed = service.fail(&task.id, "w1", error.clone()).await.unwrap();
            assert_eq!(failed.status, TaskStatus::Queued);
            assert!(failed.scheduled_at > Utc::now().naive_utc());
        }

        // Attempt 3 exhausts max_retries=2.
        sqlx::query("UPDATE tasks SET scheduled_at = ? WHERE id = ?")
            .bind(Utc::now().naive_utc())
            .bind(&task.id)
            .execute(&pool)
            .await
            .unwrap();
        let claimed = service.claim("w1", 100.0, i64::MAX).await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 3);
        let dead = service.fail(&task.id, "w1", error).await.unwrap();
        assert_eq!(dead.status, TaskStatus::DeadLetter);

        let record = DeadLetterRepository::find_by_task_id(&pool, &task.id)
            .await
            .unwrap()
            .expect("dead letter row");
        assert_eq!(record.attempt_count, 3);
        let final_error: TaskErrorRecord = serde_json::from_str(&record.final_error).unwrap();
        assert!(!final_error.retryable);

        // The last error event on the log is terminal.
        let events = EventRepository::list_since(&pool, &task.id, 0, 200).await.unwrap();
        let last_error = events
            .iter()
            .rev()
            .find(|e| e.kind == EventKind::Error)
            .unwrap();
        assert_eq!(last_error.data()["retryable"], false);
    }

    #[tokio::test]
    async fn non_retryable_failure_dead_letters_immediately() {
        let (service, _bus, pool) = service().await;
        let task = service.enqueue(new_task()).await.unwrap();
        service.claim("w1", 100.0, i64::MAX).await.unwrap().unwrap();

        let dead = service
            .fail(
                &task.id,
                "w1",
                TaskErrorRecord {
                    code: "spawn_failed".to_string(),
                    message: "no such command".to_string(),
                    retryable: false,
                },
            )
            .await
            .unwrap();
        assert_eq!(dead.status, TaskStatus::DeadLetter);
        assert!(DeadLetterRepository::find_by_task_id(&pool, &task.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn cancel_routes_by_status() {
        let (service, _bus, _pool) = service().await;
        let queued = service.enqueue(new_task()).await.unwrap();
        match service.cancel(&queued.id).await.unwrap() {
            CancelOutcome::Cancelled(task) => assert_eq!(task.status, TaskStatus::Cancelled),
            other => panic!("expected direct cancel, got {:?}", other),
        }
        // Cancel of a terminal task is a no-op.
        match service.cancel(&queued.id).await.unwrap() {
            CancelOutcome::AlreadyTerminal(_) => {}
            other => panic!("expected terminal, got {:?}", other),
        }

        let running = service.enqueue(new_task()).await.unwrap();
        service.claim("w1", 100.0, i64::MAX).await.unwrap().unwrap();
        match service.cancel(&running.id).await.unwrap() {
            CancelOutcome::SignalRunning(task) => assert_eq!(task.status, TaskStatus::Running),
            other => panic!("expected signal, got {:?}", other),
        }
        // Worker acknowledgement finishes the cooperative path.
        let cancelled = service
            .cancel_ack(&running.id, "w1", "user cancel")
            .await
            .unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn reap_then_reclaim_matches_direct_execution_trail() {
        let (service, _bus, pool) = service().await;
        let task = service.enqueue(new_task()).await.unwrap();

        // Simulate a crashed worker: claim with an already-expired lease.
        TaskRepository::claim(&pool, "w1", Duration::milliseconds(-1), 100.0, i64::MAX)
            .await
            .unwrap()
            .unwrap();
        let reaped = service.reap_expired().await.unwrap();
        assert_eq!(reaped.len(), 1);

        let reclaimed = service.claim("w2", 100.0, i64::MAX).await.unwrap().unwrap();
        assert_eq!(reclaimed.attempt, 2);
        service.complete(&task.id, "w2", None).await.unwrap();

        let done = service.get(&task.id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.attempt, 2);

        // The trail ends the same way a direct claim -> complete does.
        let events = EventRepository::list_since(&pool, &task.id, 0, 100).await.unwrap();
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            &kinds[kinds.len() - 2..],
            &[EventKind::StatusChange, EventKind::Completed]
        );
    }
}
