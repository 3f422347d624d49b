//! Startup helpers:
//! - task store open + migrations + restart-depth report
//! - background component spawn helpers (reaper, monitor, detector)
//!
//! This module centralizes bits that would otherwise live in `main.rs`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::db::models::TaskStatus;
use crate::db::repository::TaskRepository;
use crate::services::monitor::ResourceMonitor;
use crate::services::queue::QueueService;
use crate::services::stuck::{StuckCandidate, StuckDetector};

/// File path behind a task-store URL. SQLite URLs are plain paths with a
/// scheme prefix; there is no userinfo or host component to handle.
fn store_path(db_url: &str) -> PathBuf {
    PathBuf::from(db_url.strip_prefix("sqlite://").unwrap_or(db_url))
}

/// Open (or create) the task store and bring its schema current.
///
/// Workers, the reaper and the event log all write through one pool, so
/// the store runs in WAL mode with a busy timeout instead of failing
/// fast on writer contention. After migrating, the surviving queue depth
/// is logged: every queued or running row in it predates this boot and
/// will be picked up again by the claim path or the reaper's first pass.
pub async fn init_store(config: &Config) -> Result<sqlx::SqlitePool> {
    let path = store_path(&config.database.url);
    tracing::info!(store = %path.display(), "opening task store");

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating task store directory {}", parent.display()))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(&path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("opening task store at {}", path.display()))?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("migrating task store")?;

    let stats = TaskRepository::stats(&pool)
        .await
        .context("reading task store depth")?;
    let count_of = |status: TaskStatus| {
        stats
            .by_status
            .iter()
            .find(|c| c.status == status)
            .map(|c| c.count)
            .unwrap_or(0)
    };
    tracing::info!(
        queued = count_of(TaskStatus::Queued),
        running = count_of(TaskStatus::Running),
        dead_letter = count_of(TaskStatus::DeadLetter),
        "task store ready"
    );

    Ok(pool)
}

/// Spawn the periodic background components:
/// - the lease reaper (runs one pass immediately for boot recovery)
/// - the resource-monitor sampling loop
/// - the stuck detector
///
/// Each component listens for shutdown via the broadcast sender and the
/// returned handles let callers await wind-down. The detector's candidate
/// channel receiver is returned for the worker pool to consume.
pub fn spawn_background_services(
    queue: Arc<QueueService>,
    monitor: Arc<ResourceMonitor>,
    detector: Arc<StuckDetector>,
    shutdown: tokio::sync::broadcast::Sender<()>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(tokio::spawn(queue.run_reaper(shutdown.subscribe())));
    handles.push(tokio::spawn(monitor.run(shutdown.subscribe())));
    handles.push(tokio::spawn(detector.run(shutdown.subscribe())));

    handles
}

/// Channel carrying stuck-candidate control messages from the detector to
/// the worker pool.
pub fn candidate_channel() -> (mpsc::Sender<StuckCandidate>, mpsc::Receiver<StuckCandidate>) {
    mpsc::channel(64)
}
