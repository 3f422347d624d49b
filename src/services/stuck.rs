//! Stuck-task detector.
//!
//! Periodically classifies every running task as alive, suspicious or
//! stuck from its heartbeat age and the trailing resource samples. The
//! detector never mutates the queue: a stuck classification is sent as a
//! candidate message to the worker pool, and the worker owning the lease
//! decides whether to cancel and fail the task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::mpsc;

use crate::config::StuckConfig;
use crate::db::models::{ResourceSnapshot, Task, TaskStatus};
use crate::db::repository::TaskRepository;
use crate::services::monitor::ResourceMonitor;

/// Control message consumed by the worker pool.
#[derive(Debug, Clone)]
pub struct StuckCandidate {
    pub task_id: String,
    pub worker_id: Option<String>,
    pub signals: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Suspicious(Vec<String>),
    Stuck(Vec<String>),
}

/// All samples in the window below the CPU floor.
fn cpu_frozen(history: &[ResourceSnapshot], floor_percent: f64, window: usize) -> bool {
    history.len() >= window && history.iter().all(|s| s.cpu_percent < floor_percent)
}

/// Monotonic RSS growth whose average per-sample slope exceeds the
/// threshold.
fn memory_runaway(history: &[ResourceSnapshot], slope_bytes: i64, window: usize) -> bool {
    if history.len() < window || history.len() < 2 {
        return false;
    }
    let monotonic = history
        .windows(2)
        .all(|pair| pair[1].memory_bytes >= pair[0].memory_bytes);
    if !monotonic {
        return false;
    }
    let growth = history[history.len() - 1].memory_bytes - history[0].memory_bytes;
    growth / (history.len() as i64 - 1) > slope_bytes
}

/// Zero read+write delta across the whole window.
fn io_starved(history: &[ResourceSnapshot], window: usize) -> bool {
    if history.len() < window || history.len() < 2 {
        return false;
    }
    let first = &history[0];
    let last = &history[history.len() - 1];
    (last.io_read_bytes + last.io_write_bytes) - (first.io_read_bytes + first.io_write_bytes) == 0
}

/// Classify one running task.
///
/// `heartbeat_timeout` alone is sufficient; otherwise any two secondary
/// signals firing together mean stuck. Endless tasks are exempt from the
/// cpu-freeze and io-starvation signals but still heartbeat-bound.
#[allow(clippy::too_many_arguments)]
pub fn classify(
    now: NaiveDateTime,
    last_heartbeat: Option<NaiveDateTime>,
    endless: bool,
    io_bound: bool,
    progress_stalled: bool,
    history: &[ResourceSnapshot],
    config: &StuckConfig,
) -> Liveness {
    if let Some(heartbeat) = last_heartbeat {
        let age = (now - heartbeat).num_seconds();
        if age > config.heartbeat_timeout_seconds as i64 {
            return Liveness::Stuck(vec![format!("heartbeat_timeout({}s)", age)]);
        }
    }

    let window = config.io_window.max(2);
    let mut signals = Vec::new();
    if !endless && progress_stalled && cpu_frozen(history, config.cpu_floor_percent, window) {
        signals.push("cpu_freeze".to_string());
    }
    if memory_runaway(history, config.mem_slope_bytes, window) {
        signals.push("memory_runaway".to_string());
    }
    if !endless && io_bound && io_starved(history, window) {
        signals.push("io_starvation".to_string());
    }

    match signals.len() {
        0 => Liveness::Alive,
        1 => Liveness::Suspicious(signals),
        _ => Liveness::Stuck(signals),
    }
}

pub struct StuckDetector {
    pool: SqlitePool,
    monitor: Arc<ResourceMonitor>,
    config: StuckConfig,
    /// Seconds without a progress change before cpu_freeze may fire.
    progress_window_seconds: i64,
    candidates: mpsc::Sender<StuckCandidate>,
    /// Last observed progress per task, for the "no progress update in
    /// window" half of the cpu-freeze signal.
    progress_seen: Mutex<HashMap<String, (i64, NaiveDateTime)>>,
}

impl StuckDetector {
    pub fn new(
        pool: SqlitePool,
        monitor: Arc<ResourceMonitor>,
        config: StuckConfig,
        sample_interval_seconds: u64,
        candidates: mpsc::Sender<StuckCandidate>,
    ) -> Self {
        let progress_window_seconds =
            (config.io_window.max(2) as u64 * sample_interval_seconds.max(1)) as i64;
        Self {
            pool,
            monitor,
            config,
            progress_window_seconds,
            candidates,
            progress_seen: Mutex::new(HashMap::new()),
        }
    }

    fn progress_stalled(&self, task: &Task, now: NaiveDateTime) -> bool {
        let mut seen = self.progress_seen.lock().expect("progress_seen poisoned");
        match seen.get(&task.id).copied() {
            Some((progress, since)) if progress == task.progress => {
                (now - since).num_seconds() >= self.progress_window_seconds
            }
            _ => {
                seen.insert(task.id.clone(), (task.progress, now));
                false
            }
        }
    }

    /// One detector pass over every running task.
    pub async fn check_once(&self) {
        let running = match TaskRepository::list(&self.pool, Some(TaskStatus::Running), 1000).await
        {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::warn!("stuck detector could not list running tasks: {:?}", e);
                return;
            }
        };

        let now = Utc::now().naive_utc();
        let mut live_ids = Vec::with_capacity(running.len());
        for task in running {
            live_ids.push(task.id.clone());
            let config = task.config();
            let history = self.monitor.history(&task.id, self.config.io_window.max(2));
            let stalled = self.progress_stalled(&task, now);

            match classify(
                now,
                task.last_heartbeat,
                config.endless,
                config.io_bound,
                stalled,
                &history,
                &self.config,
            ) {
                Liveness::Alive => {}
                Liveness::Suspicious(signals) => {
                    tracing::debug!(task_id = %task.id, signals = ?signals, "task suspicious");
                }
                Liveness::Stuck(signals) => {
                    tracing::warn!(task_id = %task.id, signals = ?signals, "stuck candidate");
                    let candidate = StuckCandidate {
                        task_id: task.id.clone(),
                        worker_id: task.claimed_by.clone(),
                        signals,
                    };
                    if self.candidates.send(candidate).await.is_err() {
                        tracing::warn!("worker pool control channel closed");
                        return;
                    }
                }
            }
        }

        // Forget tasks no longer running.
        self.progress_seen
            .lock()
            .expect("progress_seen poisoned")
            .retain(|id, _| live_ids.contains(id));
    }

    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let interval = std::time::Duration::from_secs(self.config.check_interval_seconds.max(1));
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("stuck detector shutting down");
                    break;
                }
                _ = tokio::time::sleep(interval) => {}
            }
            self.check_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn config() -> StuckConfig {
        StuckConfig {
            heartbeat_timeout_seconds: 5,
            check_interval_seconds: 1,
            cpu_floor_percent: 1.0,
            mem_slope_bytes: 1_000_000,
            io_window: 3,
        }
    }

    fn snapshot(cpu: f64, mem: i64, io: i64) -> ResourceSnapshot {
        ResourceSnapshot {
            task_id: "t".to_string(),
            sampled_at: Utc::now().naive_utc(),
            cpu_percent: cpu,
            memory_bytes: mem,
            io_read_bytes: io,
            io_write_bytes: 0,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
            fd_count: 4,
            thread_count: 1,
            process_state: "running".to_string(),
        }
    }

    #[test]
    fn heartbeat_timeout_alone_is_stuck() {
        let now = Utc::now().naive_utc();
        let stale = now - Duration::seconds(10);
        let verdict = classify(now, Some(stale), false, false, false, &[], &config());
        match verdict {
            Liveness::Stuck(signals) => assert!(signals[0].starts_with("heartbeat_timeout")),
            other => panic!("expected stuck, got {:?}", other),
        }
    }

    #[test]
    fn endless_tasks_stay_heartbeat_bound_but_signal_exempt() {
        let now = Utc::now().naive_utc();
        let stale = now - Duration::seconds(10);
        // Endless + stale heartbeat: still stuck.
        assert!(matches!(
            classify(now, Some(stale), true, true, true, &[], &config()),
            Liveness::Stuck(_)
        ));

        // Endless + fresh heartbeat: frozen cpu and starved io are ignored.
        let fresh = now - Duration::seconds(1);
        let history = vec![snapshot(0.0, 100, 0), snapshot(0.0, 100, 0), snapshot(0.0, 100, 0)];
        assert_eq!(
            classify(now, Some(fresh), true, true, true, &history, &config()),
            Liveness::Alive
        );
    }

    #[test]
    fn single_secondary_signal_is_only_suspicious() {
        let now = Utc::now().naive_utc();
        let fresh = now - Duration::seconds(1);
        let history = vec![snapshot(0.0, 100, 0), snapshot(0.0, 100, 5), snapshot(0.0, 100, 9)];
        // cpu frozen + stalled progress, but io is moving and memory flat.
        let verdict = classify(now, Some(fresh), false, true, true, &history, &config());
        assert_eq!(verdict, Liveness::Suspicious(vec!["cpu_freeze".to_string()]));
    }

    #[test]
    fn two_secondary_signals_are_stuck() {
        let now = Utc::now().naive_utc();
        let fresh = now - Duration::seconds(1);
        // Frozen cpu and zero io delta on an io-bound task.
        let history = vec![snapshot(0.0, 100, 7), snapshot(0.0, 100, 7), snapshot(0.0, 100, 7)];
        let verdict = classify(now, Some(fresh), false, true, true, &history, &config());
        match verdict {
            Liveness::Stuck(signals) => {
                assert!(signals.contains(&"cpu_freeze".to_string()));
                assert!(signals.contains(&"io_starvation".to_string()));
            }
            other => panic!("expected stuck, got {:?}", other),
        }
    }

    #[test]
    fn memory_runaway_requires_monotonic_fast_growth() {
        let window = 3;
        // 2 MB per sample, monotonic.
        let runaway = vec![
            snapshot(50.0, 10_000_000, 0),
            snapshot(50.0, 12_000_000, 0),
            snapshot(50.0, 14_000_000, 0),
        ];
        assert!(memory_runaway(&runaway, 1_000_000, window));

        // Fast but non-monotonic.
        let sawtooth = vec![
            snapshot(50.0, 10_000_000, 0),
            snapshot(50.0, 30_000_000, 0),
            snapshot(50.0, 9_000_000, 0),
        ];
        assert!(!memory_runaway(&sawtooth, 1_000_000, window));

        // Monotonic but slow.
        let slow = vec![
            snapshot(50.0, 10_000_000, 0),
            snapshot(50.0, 10_000_100, 0),
            snapshot(50.0, 10_000_200, 0),
        ];
        assert!(!memory_runaway(&slow, 1_000_000, window));
    }

    #[test]
    fn short_history_never_fires_secondary_signals() {
        let history = vec![snapshot(0.0, 100, 0)];
        assert!(!cpu_frozen(&history, 1.0, 3));
        assert!(!memory_runaway(&history, 1, 3));
        assert!(!io_starved(&history, 3));
    }
}
