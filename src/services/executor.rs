//! Executor seam.
//!
//! The worker pool is written against the `TaskExecutor` trait so the
//! concrete process runner is injectable (tests use a scripted executor).
//! `ProcessExecutor` runs the task payload as a shell command, streams
//! stdout/stderr lines back as log updates, and honours cooperative
//! cancellation with a termination signal followed by a hard kill.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};

use crate::db::models::Task;
use crate::error::{AppError, AppResult};

/// Messages from an executing task back to its owning worker.
#[derive(Debug, Clone)]
pub enum ExecutorUpdate {
    /// The subprocess started; the monitor should attach to this pid.
    Started { pid: u32 },
    Progress { percent: i64, message: Option<String> },
    Log { stream: &'static str, line: String },
}

/// How an execution ended, from the executor's point of view.
#[derive(Debug)]
pub enum ExecutorExit {
    Success { result: Option<serde_json::Value> },
    /// The cancel signal was observed and the process was terminated.
    Cancelled,
}

/// Everything an executor needs for one run. The cancel receiver flips to
/// true exactly once; executors must then stop promptly.
pub struct ExecutionContext {
    pub worker_id: String,
    pub cancel: watch::Receiver<bool>,
    pub updates: mpsc::Sender<ExecutorUpdate>,
    /// Seconds between the termination signal and a hard kill.
    pub grace_termination: Duration,
}

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the task to completion, cancellation, or failure. Failures are
    /// returned as `AppError::ExecutorFailure` carrying the retryability
    /// classification.
    async fn execute(&self, task: &Task, ctx: ExecutionContext) -> AppResult<ExecutorExit>;
}

/// Runs the task payload as `sh -c <payload>`.
pub struct ProcessExecutor;

impl ProcessExecutor {
    fn send_sigterm(pid: u32) {
        // SAFETY: plain kill(2) on a pid we spawned; failure is harmless
        // (the process may already be gone).
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn execute(&self, task: &Task, mut ctx: ExecutionContext) -> AppResult<ExecutorExit> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&task.payload)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::ExecutorFailure {
                code: "spawn_failed".to_string(),
                message: format!("failed to spawn task process: {}", e),
                retryable: false,
            })?;

        let pid = child.id().unwrap_or_default();
        tracing::debug!(worker_id = %ctx.worker_id, task_id = %task.id, pid = pid, "task process spawned");
        let _ = ctx.updates.send(ExecutorUpdate::Started { pid }).await;

        // Stream both output pipes as log updates.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let mut log_handles = Vec::new();
        if let Some(stdout) = stdout {
            let updates = ctx.updates.clone();
            log_handles.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = updates
                        .send(ExecutorUpdate::Log {
                            stream: "stdout",
                            line,
                        })
                        .await;
                }
            }));
        }
        if let Some(stderr) = stderr {
            let updates = ctx.updates.clone();
            log_handles.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let _ = updates
                        .send(ExecutorUpdate::Log {
                            stream: "stderr",
                            line,
                        })
                        .await;
                }
            }));
        }

        let status = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.map_err(|e| AppError::ExecutorFailure {
                        code: "wait_failed".to_string(),
                        message: format!("failed to await task process: {}", e),
                        retryable: true,
                    })?;
                }
                changed = ctx.cancel.changed() => {
                    let cancelled = changed.is_ok() && *ctx.cancel.borrow();
                    if !cancelled {
                        // Sender dropped without signalling: treat as cancel
                        // so the child never outlives its worker.
                        if changed.is_err() {
                            Self::send_sigterm(pid);
                            let _ = child.kill().await;
                            for handle in log_handles {
                                let _ = handle.await;
                            }
                            return Ok(ExecutorExit::Cancelled);
                        }
                        continue;
                    }

                    Self::send_sigterm(pid);
                    let graceful = tokio::time::timeout(ctx.grace_termination, child.wait()).await;
                    if graceful.is_err() {
                        let _ = child.kill().await;
                        let _ = child.wait().await;
                    }
                    for handle in log_handles {
                        let _ = handle.await;
                    }
                    return Ok(ExecutorExit::Cancelled);
                }
            }
        };

        for handle in log_handles {
            let _ = handle.await;
        }

        if status.success() {
            return Ok(ExecutorExit::Success { result: None });
        }

        match status.code() {
            // Non-zero exit: transient by default (the retry budget bounds
            // how often we believe that).
            Some(code) => Err(AppError::ExecutorFailure {
                code: format!("exit_{}", code),
                message: format!("process exited with status {}", code),
                retryable: true,
            }),
            // Killed by signal (OOM killer, external SIGKILL): transient.
            None => Err(AppError::ExecutorFailure {
                code: "signal".to_string(),
                message: "process terminated by signal".to_string(),
                retryable: true,
            }),
        }
    }
}
