//! Per-process resource monitor.
//!
//! Samples CPU, RSS, IO, fd and thread counts for every attached task
//! process at a fixed cadence, keeps a short in-memory history per task,
//! persists downsampled snapshots, and publishes every sample to the
//! event bus as a `resource` event. A process vanishing mid-sample yields
//! a final `gone` snapshot and detaches the task.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use sysinfo::{Pid, System};

use crate::db::models::{EventKind, ResourceSnapshot};
use crate::db::repository::SnapshotRepository;
use crate::services::events::EventBus;

/// Host-level sample used for admission and scaling decisions.
#[derive(Debug, Clone, Copy)]
pub struct HostSample {
    pub cpu_percent: f64,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub cores: usize,
}

impl HostSample {
    pub fn mem_used_percent(&self) -> f64 {
        if self.mem_total_bytes == 0 {
            return 0.0;
        }
        self.mem_used_bytes as f64 / self.mem_total_bytes as f64 * 100.0
    }
}

struct Attached {
    pid: u32,
    history: VecDeque<ResourceSnapshot>,
    samples_since_persist: u32,
}

pub struct ResourceMonitor {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    sample_interval: Duration,
    /// Persist one of every N samples.
    persist_every: u32,
    snapshot_keep: i64,
    history_len: usize,
    attached: Mutex<HashMap<String, Attached>>,
    system: Mutex<System>,
    host: Mutex<HostSample>,
}

impl ResourceMonitor {
    pub fn new(
        pool: SqlitePool,
        bus: Arc<EventBus>,
        sample_interval_seconds: u64,
        persist_interval_seconds: u64,
        snapshot_keep: i64,
        history_len: usize,
    ) -> Self {
        let sample = sample_interval_seconds.max(1);
        let persist_every = (persist_interval_seconds.max(sample) / sample).max(1) as u32;
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        let host = HostSample {
            cpu_percent: 0.0,
            mem_used_bytes: system.used_memory(),
            mem_total_bytes: system.total_memory(),
            cores: system.cpus().len().max(1),
        };
        Self {
            pool,
            bus,
            sample_interval: Duration::from_secs(sample),
            persist_every,
            snapshot_keep,
            history_len: history_len.max(8),
            attached: Mutex::new(HashMap::new()),
            system: Mutex::new(system),
            host: Mutex::new(host),
        }
    }

    /// Begin sampling the given process for a task.
    pub fn attach(&self, task_id: &str, pid: u32) {
        tracing::debug!(task_id = %task_id, pid = pid, "monitor attach");
        self.attached.lock().expect("attached poisoned").insert(
            task_id.to_string(),
            Attached {
                pid,
                history: VecDeque::new(),
                samples_since_persist: 0,
            },
        );
    }

    pub fn detach(&self, task_id: &str) {
        tracing::debug!(task_id = %task_id, "monitor detach");
        self.attached
            .lock()
            .expect("attached poisoned")
            .remove(task_id);
    }

    /// Most recent in-memory sample for a task.
    pub fn latest(&self, task_id: &str) -> Option<ResourceSnapshot> {
        self.attached
            .lock()
            .expect("attached poisoned")
            .get(task_id)
            .and_then(|a| a.history.back().cloned())
    }

    /// Trailing samples (oldest first), up to `n`.
    pub fn history(&self, task_id: &str, n: usize) -> Vec<ResourceSnapshot> {
        self.attached
            .lock()
            .expect("attached poisoned")
            .get(task_id)
            .map(|a| {
                a.history
                    .iter()
                    .rev()
                    .take(n)
                    .rev()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default()
    }

    pub fn host(&self) -> HostSample {
        *self.host.lock().expect("host poisoned")
    }

    /// Remaining host budget under the configured ceilings, mapped to
    /// (cores, bytes). Negative headroom clamps to zero, which makes
    /// claiming wait.
    pub fn host_budget(&self, cpu_ceiling_percent: f64, mem_ceiling_percent: f64) -> (f64, i64) {
        let host = self.host();
        let cpu_headroom_pct = (cpu_ceiling_percent - host.cpu_percent).max(0.0);
        let cores = host.cores as f64 * cpu_headroom_pct / 100.0;

        let mem_cap = host.mem_total_bytes as f64 * mem_ceiling_percent / 100.0;
        let mem = (mem_cap - host.mem_used_bytes as f64).max(0.0) as i64;
        (cores, mem)
    }

    /// Take one immediate sample of a single attached task, recording it
    /// in the in-memory history. Returns none when the task is not
    /// attached.
    pub fn sample(&self, task_id: &str) -> Option<ResourceSnapshot> {
        let pid = self
            .attached
            .lock()
            .expect("attached poisoned")
            .get(task_id)?
            .pid;
        let snapshot = {
            let mut system = self.system.lock().expect("system poisoned");
            snapshot_process(&mut system, task_id, pid)
        };
        let mut attached = self.attached.lock().expect("attached poisoned");
        if let Some(entry) = attached.get_mut(task_id) {
            entry.history.push_back(snapshot.clone());
            while entry.history.len() > self.history_len {
                entry.history.pop_front();
            }
        }
        Some(snapshot)
    }

    /// One sampling pass over the host and every attached process.
    pub async fn sample_once(&self) {
        struct Pending {
            snapshot: ResourceSnapshot,
            persist: bool,
            gone: bool,
        }

        let mut pending: Vec<Pending> = Vec::new();
        {
            let mut system = self.system.lock().expect("system poisoned");
            system.refresh_cpu();
            system.refresh_memory();
            {
                let mut host = self.host.lock().expect("host poisoned");
                *host = HostSample {
                    cpu_percent: system.global_cpu_info().cpu_usage() as f64,
                    mem_used_bytes: system.used_memory(),
                    mem_total_bytes: system.total_memory(),
                    cores: system.cpus().len().max(1),
                };
            }

            let mut attached = self.attached.lock().expect("attached poisoned");
            for (task_id, entry) in attached.iter_mut() {
                let snapshot = snapshot_process(&mut system, task_id, entry.pid);
                let gone = snapshot.is_gone();
                entry.history.push_back(snapshot.clone());
                while entry.history.len() > self.history_len {
                    entry.history.pop_front();
                }
                entry.samples_since_persist += 1;
                let persist = gone || entry.samples_since_persist >= self.persist_every;
                if persist {
                    entry.samples_since_persist = 0;
                }
                pending.push(Pending {
                    snapshot,
                    persist,
                    gone,
                });
            }

            attached.retain(|_, entry| {
                !entry
                    .history
                    .back()
                    .map(|s| s.is_gone())
                    .unwrap_or(false)
            });
        }

        // Locks released; now do the async writes and publishes.
        for item in pending {
            let snapshot = item.snapshot;
            if item.persist {
                if let Err(e) = SnapshotRepository::insert(&self.pool, &snapshot).await {
                    tracing::warn!(task_id = %snapshot.task_id, "snapshot persist failed: {:?}", e);
                } else if let Err(e) =
                    SnapshotRepository::prune(&self.pool, &snapshot.task_id, self.snapshot_keep)
                        .await
                {
                    tracing::warn!(task_id = %snapshot.task_id, "snapshot prune failed: {:?}", e);
                }
            }
            if item.gone {
                tracing::debug!(task_id = %snapshot.task_id, "process gone, detached");
            }
            let data = serde_json::to_value(&snapshot).unwrap_or_default();
            if let Err(e) = self
                .bus
                .publish(&snapshot.task_id, EventKind::Resource, data)
                .await
            {
                tracing::warn!(task_id = %snapshot.task_id, "resource event publish failed: {:?}", e);
            }
        }
    }

    /// Sampling loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            self.sample_once().await;
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("resource monitor shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.sample_interval) => {}
            }
        }
    }
}

/// Build one snapshot for an attached process, tolerating the process
/// vanishing mid-sample (`process_state = "gone"`).
fn snapshot_process(system: &mut System, task_id: &str, pid: u32) -> ResourceSnapshot {
    let spid = Pid::from_u32(pid);
    let alive = system.refresh_process(spid);
    let now = Utc::now().naive_utc();
    match (alive, system.process(spid)) {
        (true, Some(process)) => ResourceSnapshot {
            task_id: task_id.to_string(),
            sampled_at: now,
            cpu_percent: process.cpu_usage() as f64,
            memory_bytes: process.memory() as i64,
            io_read_bytes: process.disk_usage().total_read_bytes as i64,
            io_write_bytes: process.disk_usage().total_written_bytes as i64,
            // Per-process network accounting is not exposed by the
            // sampler backend.
            net_rx_bytes: 0,
            net_tx_bytes: 0,
            fd_count: fd_count(pid),
            thread_count: thread_count(pid),
            process_state: process.status().to_string().to_lowercase(),
        },
        _ => ResourceSnapshot {
            task_id: task_id.to_string(),
            sampled_at: now,
            cpu_percent: 0.0,
            memory_bytes: 0,
            io_read_bytes: 0,
            io_write_bytes: 0,
            net_rx_bytes: 0,
            net_tx_bytes: 0,
            fd_count: 0,
            thread_count: 0,
            process_state: "gone".to_string(),
        },
    }
}

#[cfg(target_os = "linux")]
fn fd_count(pid: u32) -> i64 {
    std::fs::read_dir(format!("/proc/{}/fd", pid))
        .map(|entries| entries.count() as i64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn fd_count(_pid: u32) -> i64 {
    0
}

#[cfg(target_os = "linux")]
fn thread_count(pid: u32) -> i64 {
    std::fs::read_dir(format!("/proc/{}/task", pid))
        .map(|entries| entries.count() as i64)
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn thread_count(_pid: u32) -> i64 {
    0
}
