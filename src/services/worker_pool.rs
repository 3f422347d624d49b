//! Adaptive worker pool.
//!
//! Workers are long-lived cooperative tasks cycling Idle -> Claiming ->
//! Executing -> Idle. The pool polls the queue (no direct task API),
//! feeds the resource monitor, emits progress through the queue service,
//! and finalizes task state. A scaling loop grows the pool under load
//! (bounded by host ceilings) and retires long-idle workers.
//!
//! Cancellation is message passing end to end: user cancels, pause
//! requests, stuck candidates from the detector and shutdown all arrive
//! on the owning worker's control channel; the worker signals its
//! executor and finalizes according to the reason.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::WorkerPoolConfig;
use crate::db::models::{Task, TaskErrorRecord};
use crate::error::AppError;
use crate::services::executor::{
    ExecutionContext, ExecutorExit, ExecutorUpdate, TaskExecutor,
};
use crate::services::monitor::ResourceMonitor;
use crate::services::queue::QueueService;
use crate::services::stuck::StuckCandidate;

/// Why a running task is being asked to stop.
#[derive(Debug, Clone)]
pub enum CancelReason {
    User,
    Stuck(Vec<String>),
    Pause,
    Shutdown,
    /// Soft deadline reached (worker-internal).
    Deadline,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub current_workers: usize,
    pub active_workers: usize,
    pub scaling_events: u64,
    pub claims_lost: u64,
}

struct RunningTask {
    worker_id: String,
    cancel: watch::Sender<Option<CancelReason>>,
}

struct WorkerSlot {
    busy: Arc<AtomicBool>,
    idle_since: Arc<Mutex<Instant>>,
    retire: watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    queue: Arc<QueueService>,
    monitor: Arc<ResourceMonitor>,
    executor: Arc<dyn TaskExecutor>,
    config: WorkerPoolConfig,
    poll_interval: Duration,
    workers: Mutex<HashMap<usize, WorkerSlot>>,
    next_worker: AtomicUsize,
    active: AtomicUsize,
    running: Mutex<HashMap<String, RunningTask>>,
    scaling_events: AtomicU64,
    claims_lost: AtomicU64,
    stopping: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<QueueService>,
        monitor: Arc<ResourceMonitor>,
        executor: Arc<dyn TaskExecutor>,
        config: WorkerPoolConfig,
    ) -> Self {
        let poll_interval =
            Duration::from_secs(queue.config().poll_interval_seconds.max(1));
        let (shutdown, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(PoolInner {
                queue,
                monitor,
                executor,
                config,
                poll_interval,
                workers: Mutex::new(HashMap::new()),
                next_worker: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                running: Mutex::new(HashMap::new()),
                scaling_events: AtomicU64::new(0),
                claims_lost: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Spawn the minimum worker set, the scaling loop, and the consumer
    /// for stuck-candidate control messages.
    pub fn start(&self, candidates: mpsc::Receiver<StuckCandidate>) {
        for _ in 0..self.inner.config.min {
            spawn_worker(&self.inner);
        }
        tokio::spawn(run_scaling(
            self.inner.clone(),
            self.inner.shutdown.subscribe(),
        ));
        tokio::spawn(run_candidates(
            self.inner.clone(),
            candidates,
            self.inner.shutdown.subscribe(),
        ));
        tracing::info!(workers = self.inner.config.min, "worker pool started");
    }

    /// Stop claiming, signal cancellation to every executor, then wait
    /// until workers drain or the grace expires. Tasks still running past
    /// the grace are left to the reaper via visibility expiry.
    pub async fn stop(&self, grace: Duration) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown.send(());

        {
            let running = self.inner.running.lock().expect("running poisoned");
            for (task_id, task) in running.iter() {
                tracing::info!(task_id = %task_id, "signalling shutdown cancellation");
                let _ = task.cancel.send(Some(CancelReason::Shutdown));
            }
        }

        let start = Instant::now();
        while start.elapsed() < grace {
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut workers = self.inner.workers.lock().expect("workers poisoned");
        for (_, slot) in workers.drain() {
            slot.join.abort();
        }
        tracing::info!("worker pool stopped");
    }

    /// Route a user cancellation to the owning worker. Returns false when
    /// no worker in this pool holds the task.
    pub fn request_cancel(&self, task_id: &str) -> bool {
        self.signal(task_id, CancelReason::User)
    }

    /// Tell the owning worker to stop executing a task that was just
    /// paused; queue state is already `paused` and stays untouched.
    pub fn notify_paused(&self, task_id: &str) -> bool {
        self.signal(task_id, CancelReason::Pause)
    }

    fn signal(&self, task_id: &str, reason: CancelReason) -> bool {
        let running = self.inner.running.lock().expect("running poisoned");
        match running.get(task_id) {
            Some(task) => task.cancel.send(Some(reason)).is_ok(),
            None => false,
        }
    }

    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            current_workers: self.inner.workers.lock().expect("workers poisoned").len(),
            active_workers: self.inner.active.load(Ordering::SeqCst),
            scaling_events: self.inner.scaling_events.load(Ordering::Relaxed),
            claims_lost: self.inner.claims_lost.load(Ordering::Relaxed),
        }
    }
}

fn spawn_worker(inner: &Arc<PoolInner>) {
    let id = inner.next_worker.fetch_add(1, Ordering::SeqCst);
    let busy = Arc::new(AtomicBool::new(false));
    let idle_since = Arc::new(Mutex::new(Instant::now()));
    let (retire_tx, retire_rx) = watch::channel(false);

    let join = tokio::spawn(worker_loop(
        inner.clone(),
        id,
        busy.clone(),
        idle_since.clone(),
        retire_rx,
    ));

    inner.workers.lock().expect("workers poisoned").insert(
        id,
        WorkerSlot {
            busy,
            idle_since,
            retire: retire_tx,
            join,
        },
    );
}

async fn worker_loop(
    inner: Arc<PoolInner>,
    id: usize,
    busy: Arc<AtomicBool>,
    idle_since: Arc<Mutex<Instant>>,
    retire: watch::Receiver<bool>,
) {
    let worker_id = format!("worker-{}-{}", std::process::id(), id);
    let mut shutdown = inner.shutdown.subscribe();
    tracing::debug!(worker_id = %worker_id, "worker started");

    loop {
        if *retire.borrow() || inner.stopping.load(Ordering::SeqCst) {
            break;
        }

        // Resource-aware admission: wait while the host is above its
        // ceilings.
        let (cpu_budget, mem_budget) = inner
            .monitor
            .host_budget(inner.config.cpu_ceiling_percent, inner.config.mem_ceiling_percent);
        if cpu_budget <= 0.0 || mem_budget <= 0 {
            if idle_wait(&inner, &mut shutdown).await {
                break;
            }
            continue;
        }

        let claimed = match inner.queue.claim(&worker_id, cpu_budget, mem_budget).await {
            Ok(task) => task,
            Err(AppError::StoreUnavailable(msg)) => {
                tracing::warn!(worker_id = %worker_id, "claims halted, store unavailable: {}", msg);
                if idle_wait(&inner, &mut shutdown).await {
                    break;
                }
                continue;
            }
            Err(e) => {
                tracing::warn!(worker_id = %worker_id, "claim failed: {:?}", e);
                if idle_wait(&inner, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        let Some(task) = claimed else {
            if idle_wait(&inner, &mut shutdown).await {
                break;
            }
            continue;
        };

        busy.store(true, Ordering::SeqCst);
        inner.active.fetch_add(1, Ordering::SeqCst);
        execute_claimed(&inner, &worker_id, task).await;
        inner.active.fetch_sub(1, Ordering::SeqCst);
        busy.store(false, Ordering::SeqCst);
        *idle_since.lock().expect("idle_since poisoned") = Instant::now();
    }

    tracing::debug!(worker_id = %worker_id, "worker exiting");
}

/// Sleep one jittered poll interval. Returns true when shutdown fired.
async fn idle_wait(inner: &Arc<PoolInner>, shutdown: &mut broadcast::Receiver<()>) -> bool {
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    let delay = inner.poll_interval.mul_f64(jitter);
    tokio::select! {
        _ = shutdown.recv() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

enum ExecStop {
    Finished(Result<ExecutorExit, AppError>),
    LeaseLost,
}

async fn execute_claimed(inner: &Arc<PoolInner>, worker_id: &str, task: Task) {
    let task_id = task.id.clone();
    let task_config = task.config();
    tracing::info!(worker_id = %worker_id, task_id = %task_id, attempt = task.attempt, "executing task");

    let (cancel_tx, mut cancel_rx) = watch::channel(None::<CancelReason>);
    inner.running.lock().expect("running poisoned").insert(
        task_id.clone(),
        RunningTask {
            worker_id: worker_id.to_string(),
            cancel: cancel_tx,
        },
    );

    // Heartbeat emitter: extends the lease until execution ends; a lost
    // lease aborts execution without queue writes.
    let (mut lost_tx, mut lost_rx) = {
        let (tx, rx) = oneshot::channel::<()>();
        (Some(tx), rx)
    };
    let heartbeat = {
        let queue = inner.queue.clone();
        let task_id = task_id.clone();
        let worker_id = worker_id.to_string();
        let interval = Duration::from_secs(inner.config.heartbeat_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match queue.heartbeat(&task_id, &worker_id, None).await {
                    Ok(crate::db::repository::HeartbeatOutcome::Extended(_)) => {}
                    Ok(crate::db::repository::HeartbeatOutcome::Lost) => {
                        if let Some(tx) = lost_tx.take() {
                            let _ = tx.send(());
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(task_id = %task_id, "heartbeat failed: {:?}", e);
                    }
                }
            }
        })
    };

    // Consume executor updates: pid registration, progress, logs.
    let (updates_tx, mut updates_rx) = mpsc::channel::<ExecutorUpdate>(256);
    let updates = {
        let queue = inner.queue.clone();
        let monitor = inner.monitor.clone();
        let task_id = task_id.clone();
        let worker_id = worker_id.to_string();
        tokio::spawn(async move {
            while let Some(update) = updates_rx.recv().await {
                match update {
                    ExecutorUpdate::Started { pid } => monitor.attach(&task_id, pid),
                    ExecutorUpdate::Progress { percent, message } => {
                        if let Err(e) =
                            queue.progress(&task_id, &worker_id, percent, message).await
                        {
                            tracing::warn!(task_id = %task_id, "progress update failed: {:?}", e);
                        }
                    }
                    ExecutorUpdate::Log { stream, line } => {
                        queue.log_line(&task_id, stream, line).await;
                    }
                }
            }
        })
    };

    let (exec_cancel_tx, exec_cancel_rx) = watch::channel(false);
    let ctx = ExecutionContext {
        worker_id: worker_id.to_string(),
        cancel: exec_cancel_rx,
        updates: updates_tx,
        grace_termination: Duration::from_secs(task_config.grace_termination_seconds.max(1)),
    };

    // Effective soft deadline; endless tasks have none.
    let deadline = if task_config.endless {
        None
    } else {
        match (
            task_config.timeout_seconds,
            task_config.hard_kill_after_seconds,
        ) {
            (Some(a), Some(b)) => Some(Duration::from_secs(a.min(b))),
            (Some(a), None) => Some(Duration::from_secs(a)),
            (None, Some(b)) => Some(Duration::from_secs(b)),
            (None, None) => None,
        }
    };

    let mut stop_reason: Option<CancelReason> = None;
    // Scope the executor future so an aborted execution (lease lost)
    // drops it, and with it the updates sender, before the consumer is
    // awaited below.
    let stop = {
        let deadline_sleep =
            tokio::time::sleep(deadline.unwrap_or(Duration::from_secs(365 * 24 * 3600)));
        tokio::pin!(deadline_sleep);

        let executor = inner.executor.clone();
        let exec_fut = executor.execute(&task, ctx);
        tokio::pin!(exec_fut);

        loop {
            tokio::select! {
                result = &mut exec_fut => break ExecStop::Finished(result),
                _ = &mut lost_rx => break ExecStop::LeaseLost,
                changed = cancel_rx.changed(), if stop_reason.is_none() => {
                    if changed.is_err() {
                        continue;
                    }
                    let reason = cancel_rx.borrow().clone();
                    if let Some(reason) = reason {
                        tracing::info!(task_id = %task_id, reason = ?reason, "cancellation signalled");
                        stop_reason = Some(reason);
                        let _ = exec_cancel_tx.send(true);
                    }
                }
                _ = &mut deadline_sleep, if deadline.is_some() && stop_reason.is_none() => {
                    tracing::warn!(task_id = %task_id, "soft deadline reached");
                    stop_reason = Some(CancelReason::Deadline);
                    let _ = exec_cancel_tx.send(true);
                }
            }
        }
    };

    heartbeat.abort();
    let _ = updates.await;
    inner.monitor.detach(&task_id);
    inner
        .running
        .lock()
        .expect("running poisoned")
        .remove(&task_id);

    match stop {
        ExecStop::LeaseLost => {
            // The reaper already returned the task to the queue; any write
            // from this worker would clobber the new owner.
            inner.claims_lost.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(task_id = %task_id, "lease lost, aborting without queue writes");
        }
        ExecStop::Finished(Ok(ExecutorExit::Success { result })) => {
            if let Err(e) = inner.queue.complete(&task_id, worker_id, result).await {
                tracing::warn!(task_id = %task_id, "complete failed: {:?}", e);
            }
        }
        ExecStop::Finished(Ok(ExecutorExit::Cancelled)) => {
            finalize_cancelled(inner, worker_id, &task_id, stop_reason).await;
        }
        ExecStop::Finished(Err(error)) => {
            let record = error_record(&error);
            if let Err(e) = inner.queue.fail(&task_id, worker_id, record).await {
                tracing::warn!(task_id = %task_id, "fail transition failed: {:?}", e);
            }
        }
    }
}

async fn finalize_cancelled(
    inner: &Arc<PoolInner>,
    worker_id: &str,
    task_id: &str,
    reason: Option<CancelReason>,
) {
    let result = match reason {
        Some(CancelReason::User) => inner
            .queue
            .cancel_ack(task_id, worker_id, "user cancel")
            .await
            .map(|_| ()),
        Some(CancelReason::Stuck(signals)) => {
            // Detector-confirmed stuckness converts to a terminal timeout.
            let record = error_record(&AppError::StuckDetected(signals.join(", ")));
            inner.queue.fail(task_id, worker_id, record).await.map(|_| ())
        }
        Some(CancelReason::Deadline) => {
            let record = error_record(&AppError::Timeout("soft deadline exceeded".to_string()));
            inner.queue.fail(task_id, worker_id, record).await.map(|_| ())
        }
        // Queue state is already `paused`; the claim stays with us until
        // resume re-queues the task.
        Some(CancelReason::Pause) => Ok(()),
        Some(CancelReason::Shutdown) | None => inner
            .queue
            .release(task_id, worker_id, "worker shutdown")
            .await,
    };
    if let Err(e) = result {
        tracing::warn!(task_id = %task_id, "cancel finalization failed: {:?}", e);
    }
}

fn error_record(error: &AppError) -> TaskErrorRecord {
    match error {
        AppError::ExecutorFailure {
            code,
            message,
            retryable,
        } => TaskErrorRecord {
            code: code.clone(),
            message: message.clone(),
            retryable: *retryable,
        },
        AppError::Timeout(message) => TaskErrorRecord {
            code: "timeout".to_string(),
            message: message.clone(),
            retryable: false,
        },
        AppError::StuckDetected(message) => TaskErrorRecord {
            code: "timeout".to_string(),
            message: format!("stuck: {}", message),
            retryable: false,
        },
        other => TaskErrorRecord {
            code: "internal".to_string(),
            message: other.to_string(),
            retryable: other.is_retryable(),
        },
    }
}

/// Scaling loop: grow by half under load (respecting host ceilings),
/// retire the longest-idle worker when utilization stays low.
async fn run_scaling(inner: Arc<PoolInner>, mut shutdown: broadcast::Receiver<()>) {
    let interval = Duration::from_secs(inner.config.scale_interval_seconds.max(1));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }

        let current = inner.workers.lock().expect("workers poisoned").len();
        let active = inner.active.load(Ordering::SeqCst);
        let utilization = active as f64 / current.max(1) as f64;
        let host = inner.monitor.host();

        if utilization >= inner.config.scale_up_threshold
            && host.cpu_percent < inner.config.cpu_ceiling_percent
            && host.mem_used_percent() < inner.config.mem_ceiling_percent
            && current < inner.config.max
        {
            let add = (((current as f64) * 0.5).ceil() as usize)
                .max(1)
                .min(inner.config.max - current);
            for _ in 0..add {
                spawn_worker(&inner);
            }
            inner.scaling_events.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                added = add,
                current = current + add,
                utilization = utilization,
                "scaled worker pool up"
            );
        } else if utilization <= inner.config.scale_down_threshold && current > inner.config.min {
            let idle_timeout = Duration::from_secs(inner.config.idle_timeout_seconds);
            let mut workers = inner.workers.lock().expect("workers poisoned");
            let retire_id = workers
                .iter()
                .filter(|(_, slot)| !slot.busy.load(Ordering::SeqCst))
                .filter_map(|(id, slot)| {
                    let idle = slot.idle_since.lock().expect("idle_since poisoned").elapsed();
                    (idle >= idle_timeout).then_some((*id, idle))
                })
                .max_by_key(|(_, idle)| *idle)
                .map(|(id, _)| id);

            if let Some(id) = retire_id {
                if let Some(slot) = workers.remove(&id) {
                    let _ = slot.retire.send(true);
                    inner.scaling_events.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(worker = id, current = workers.len(), "retired idle worker");
                }
            }
        }
    }
}

/// Consume stuck-candidate control messages: confirm the classification
/// on the queue, then drive the owning worker through the cancel path.
async fn run_candidates(
    inner: Arc<PoolInner>,
    mut candidates: mpsc::Receiver<StuckCandidate>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let candidate = tokio::select! {
            _ = shutdown.recv() => break,
            candidate = candidates.recv() => match candidate {
                Some(candidate) => candidate,
                None => break,
            },
        };

        let owned = {
            let running = inner.running.lock().expect("running poisoned");
            running
                .get(&candidate.task_id)
                .map(|task| (task.worker_id.clone(), task.cancel.clone()))
        };
        let Some((worker_id, cancel)) = owned else {
            // Not ours (already finished or reaped); nothing to confirm.
            continue;
        };

        if let Err(e) = inner
            .queue
            .mark_stuck(&candidate.task_id, &worker_id, &candidate.signals.join(", "))
            .await
        {
            tracing::warn!(task_id = %candidate.task_id, "mark_stuck failed: {:?}", e);
        }
        let _ = cancel.send(Some(CancelReason::Stuck(candidate.signals)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::db::models::{CreateTask, TaskConfig, TaskStatus};
    use crate::db::repository::test_support::test_pool;
    use crate::db::repository::EventRepository;
    use crate::db::models::EventKind;
    use crate::services::events::EventBus;
    use async_trait::async_trait;
    use sqlx::SqlitePool;

    enum Behavior {
        Succeed,
        FailRetryable,
        RunUntilCancelled,
    }

    struct ScriptedExecutor {
        behavior: Behavior,
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            _task: &Task,
            mut ctx: ExecutionContext,
        ) -> Result<ExecutorExit, AppError> {
            match self.behavior {
                Behavior::Succeed => {
                    for percent in [0, 50, 100] {
                        let _ = ctx
                            .updates
                            .send(ExecutorUpdate::Progress {
                                percent,
                                message: None,
                            })
                            .await;
                    }
                    Ok(ExecutorExit::Success { result: None })
                }
                Behavior::FailRetryable => Err(AppError::ExecutorFailure {
                    code: "exit_1".to_string(),
                    message: "process exited with status 1".to_string(),
                    retryable: true,
                }),
                Behavior::RunUntilCancelled => loop {
                    if ctx.cancel.changed().await.is_err() {
                        return Ok(ExecutorExit::Cancelled);
                    }
                    if *ctx.cancel.borrow() {
                        return Ok(ExecutorExit::Cancelled);
                    }
                },
            }
        }
    }

    fn pool_config() -> WorkerPoolConfig {
        WorkerPoolConfig {
            min: 1,
            max: 2,
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.3,
            scale_interval_seconds: 3600,
            idle_timeout_seconds: 3600,
            cpu_ceiling_percent: 100.0,
            mem_ceiling_percent: 100.0,
            grace_termination_seconds: 1,
            heartbeat_interval_seconds: 1,
            sample_interval_seconds: 1,
            persist_interval_seconds: 1,
            snapshot_keep: 100,
        }
    }

    async fn harness(behavior: Behavior) -> (WorkerPool, Arc<QueueService>, SqlitePool) {
        let pool = test_pool().await;
        let bus = Arc::new(EventBus::new(pool.clone(), 1024, 256));
        let queue = Arc::new(QueueService::new(
            pool.clone(),
            bus.clone(),
            QueueConfig {
                poll_interval_seconds: 1,
                visibility_timeout_seconds: 60,
                max_retries: 0,
                retry_backoff_base_seconds: 1,
                retry_backoff_cap_seconds: 1,
                jitter: 0.0,
                reap_interval_seconds: 60,
                store_retry_attempts: 3,
            },
        ));
        let monitor = Arc::new(ResourceMonitor::new(
            pool.clone(),
            bus.clone(),
            1,
            10,
            100,
            8,
        ));
        let worker_pool = WorkerPool::new(
            queue.clone(),
            monitor,
            Arc::new(ScriptedExecutor { behavior }),
            pool_config(),
        );
        (worker_pool, queue, pool)
    }

    fn echo_task() -> CreateTask {
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

    async fn wait_for_status(
        queue: &QueueService,
        id: &str,
        wanted: TaskStatus,
        timeout: Duration,
    ) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Ok(Some(task)) = queue.get(id).await {
                if task.status == wanted {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn pool_executes_enqueued_task_to_completion() {
        let (worker_pool, queue, pool) = harness(Behavior::Succeed).await;
        let (_tx, rx) = mpsc::channel(8);
        worker_pool.start(rx);

        let task = queue.enqueue(echo_task()).await.unwrap();
        assert!(
            wait_for_status(&queue, &task.id, TaskStatus::Completed, Duration::from_secs(10))
                .await
        );
        worker_pool.stop(Duration::from_secs(1)).await;

        // Full lifecycle trail with a contiguous seq.
        let events = EventRepository::list_since(&pool, &task.id, 0, 100).await.unwrap();
        let seqs: Vec<i64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=events.len() as i64).collect::<Vec<i64>>());
        let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds[0], EventKind::StatusChange); // pending -> queued
        assert_eq!(kinds[1], EventKind::StatusChange); // queued -> running
        assert!(kinds.contains(&EventKind::Progress));
        assert_eq!(*kinds.last().unwrap(), EventKind::Completed);
    }

    #[tokio::test]
    async fn failing_executor_dead_letters_when_retries_exhausted() {
        let (worker_pool, queue, pool) = harness(Behavior::FailRetryable).await;
        let (_tx, rx) = mpsc::channel(8);
        worker_pool.start(rx);

        // max_retries 0: the first failure dead-letters.
        let task = queue
            .enqueue(CreateTask {
                config: Some(TaskConfig {
                    max_retries: 0,
                    ..Default::default()
                }),
                ..echo_task()
            })
            .await
            .unwrap();
        assert!(
            wait_for_status(&queue, &task.id, TaskStatus::DeadLetter, Duration::from_secs(10))
                .await
        );
        worker_pool.stop(Duration::from_secs(1)).await;

        let record = crate::db::repository::DeadLetterRepository::find_by_task_id(&pool, &task.id)
            .await
            .unwrap();
        assert!(record.is_some());
    }

    #[tokio::test]
    async fn user_cancel_reaches_running_executor() {
        let (worker_pool, queue, _pool) = harness(Behavior::RunUntilCancelled).await;
        let (_tx, rx) = mpsc::channel(8);
        worker_pool.start(rx);

        let task = queue.enqueue(echo_task()).await.unwrap();
        assert!(
            wait_for_status(&queue, &task.id, TaskStatus::Running, Duration::from_secs(10)).await
        );
        assert!(worker_pool.request_cancel(&task.id));
        assert!(
            wait_for_status(&queue, &task.id, TaskStatus::Cancelled, Duration::from_secs(10))
                .await
        );
        worker_pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_releases_unfinished_tasks() {
        let (worker_pool, queue, _pool) = harness(Behavior::RunUntilCancelled).await;
        let (_tx, rx) = mpsc::channel(8);
        worker_pool.start(rx);

        let task = queue.enqueue(echo_task()).await.unwrap();
        assert!(
            wait_for_status(&queue, &task.id, TaskStatus::Running, Duration::from_secs(10)).await
        );
        worker_pool.stop(Duration::from_secs(5)).await;

        let after = queue.get(&task.id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Queued);
        assert!(after.claimed_by.is_none());
        // Attempt is retained for the next claim.
        assert_eq!(after.attempt, 1);
    }

    #[tokio::test]
    async fn stuck_candidate_converts_to_terminal_timeout() {
        let (worker_pool, queue, pool) = harness(Behavior::RunUntilCancelled).await;
        let (candidates_tx, candidates_rx) = mpsc::channel(8);
        worker_pool.start(candidates_rx);

        let task = queue.enqueue(echo_task()).await.unwrap();
        assert!(
            wait_for_status(&queue, &task.id, TaskStatus::Running, Duration::from_secs(10)).await
        );

        candidates_tx
            .send(StuckCandidate {
                task_id: task.id.clone(),
                worker_id: None,
                signals: vec!["heartbeat_timeout(10s)".to_string()],
            })
            .await
            .unwrap();

        assert!(
            wait_for_status(&queue, &task.id, TaskStatus::DeadLetter, Duration::from_secs(10))
                .await
        );
        worker_pool.stop(Duration::from_secs(1)).await;

        let after = queue.get(&task.id).await.unwrap().unwrap();
        let error = after.error().expect("error record");
        assert_eq!(error.code, "timeout");
        assert!(!error.retryable);
        let _ = pool;
    }
}
