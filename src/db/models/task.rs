use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle states of a task.
///
/// Terminal states (`Completed`, `Failed`, `Cancelled`, `DeadLetter`) are
/// absorbing: once reached, the row is never mutated again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Stuck,
    Cancelled,
    DeadLetter,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Failed
                | TaskStatus::Cancelled
                | TaskStatus::DeadLetter
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stuck => "stuck",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-task execution policy, stored serialized in `tasks.config_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Retries permitted before the task is dead-lettered.
    pub max_retries: u32,

    /// Soft deadline in seconds. `None` means no deadline.
    pub timeout_seconds: Option<u64>,

    /// Upper bound in seconds after which the executor is hard-killed
    /// regardless of cooperative cancellation progress.
    pub hard_kill_after_seconds: Option<u64>,

    /// Seconds to wait between the termination signal and a hard kill.
    pub grace_termination_seconds: u64,

    /// Endless tasks are expected to run indefinitely. They stay subject
    /// to heartbeat timeouts but are exempt from cpu-freeze and
    /// io-starvation stuckness signals.
    pub endless: bool,

    /// Whether the task type is declared io-bound. Only io-bound tasks
    /// participate in the io_starvation signal.
    pub io_bound: bool,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout_seconds: Some(3600),
            hard_kill_after_seconds: Some(7200),
            grace_termination_seconds: 10,
            endless: false,
            io_bound: false,
        }
    }
}

/// Structured error recorded on a failed task (`tasks.error_json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskErrorRecord {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// A persisted task row.
///
/// Immutable identity: `id`, `task_type`, `created_at`. Everything else is
/// mutated exclusively through `TaskRepository` so that the claim/lease
/// invariants hold:
/// - `claimed_by` is non-null iff status is `running` or `paused`
/// - `visibility_deadline` is non-null iff status is `running`
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Task {
    /// Primary key (UUID)
    pub id: String,

    /// Free-form type tag (e.g. 'transcode', 'report')
    pub task_type: String,

    pub status: TaskStatus,

    /// Integer weight; higher claims first.
    pub priority: i64,

    /// Opaque payload handed to the executor.
    pub payload: String,

    /// Serialized `TaskConfig`.
    pub config_json: String,

    /// Completion percentage, 0-100.
    pub progress: i64,

    pub progress_message: Option<String>,

    /// Execution attempts started so far. Incremented on claim.
    pub attempt: i64,

    /// Monotonic non-decreasing while running.
    pub last_heartbeat: Option<NaiveDateTime>,

    /// Worker id holding the lease, if any.
    pub claimed_by: Option<String>,

    /// Lease expiry; past it the reaper returns the task to the queue.
    pub visibility_deadline: Option<NaiveDateTime>,

    /// Earliest time the task may be claimed (>= created_at). Retry
    /// backoff pushes this forward.
    pub scheduled_at: NaiveDateTime,

    pub required_cpu_cores: f64,
    pub required_memory_bytes: i64,

    /// Serialized result blob, set on completion.
    pub result_json: Option<String>,

    /// Serialized `TaskErrorRecord`, set on failure.
    pub error_json: Option<String>,

    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Task {
    pub fn config(&self) -> TaskConfig {
        serde_json::from_str(&self.config_json).unwrap_or_default()
    }

    pub fn error(&self) -> Option<TaskErrorRecord> {
        self.error_json
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
    }
}

/// Data required to enqueue a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTask {
    pub task_type: String,
    pub payload: String,

    /// Integer weight; defaults to 0 (normal).
    pub priority: Option<i64>,

    /// Execution policy; defaults applied when omitted.
    pub config: Option<TaskConfig>,

    /// Defer execution until this time; defaults to now.
    pub scheduled_at: Option<NaiveDateTime>,

    pub required_cpu_cores: Option<f64>,
    pub required_memory_bytes: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_absorbing_set() {
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::DeadLetter,
        ] {
            assert!(status.is_terminal());
        }
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Stuck,
        ] {
            assert!(!status.is_terminal());
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::DeadLetter).unwrap();
        assert_eq!(json, "\"dead_letter\"");
        assert_eq!(TaskStatus::DeadLetter.as_str(), "dead_letter");
    }

    #[test]
    fn config_roundtrip_defaults() {
        let cfg = TaskConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: TaskConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_retries, 3);
        assert!(!back.endless);
    }
}
