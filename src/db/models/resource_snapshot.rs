use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One per-process resource sample.
///
/// CPU percent is computed from the process CPU-time delta over the
/// wall-clock delta since the previous sample (0 on the first sample).
/// IO and network counters are cumulative since process start.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub task_id: String,
    pub sampled_at: NaiveDateTime,
    pub cpu_percent: f64,
    pub memory_bytes: i64,
    pub io_read_bytes: i64,
    pub io_write_bytes: i64,
    pub net_rx_bytes: i64,
    pub net_tx_bytes: i64,
    pub fd_count: i64,
    pub thread_count: i64,
    /// 'running', 'sleeping', ... or 'gone' when the process vanished
    /// mid-sample.
    pub process_state: String,
}

impl ResourceSnapshot {
    pub fn is_gone(&self) -> bool {
        self.process_state == "gone"
    }
}
