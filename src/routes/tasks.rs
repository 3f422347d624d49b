use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::db::models::{CreateTask, Task, TaskConfig, TaskStatus};
use crate::db::repository::{DeadLetterRepository, QueueStats};
use crate::error::{AppError, AppResult};
use crate::services::queue::CancelOutcome;
use crate::services::worker_pool::PoolMetrics;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", post(enqueue_task).get(list_tasks))
        .route("/stats", get(queue_stats))
        .route("/dead-letter", get(list_dead_letter))
        .route("/:id", get(get_task))
        .route("/:id/resources", get(task_resources))
        .route("/:id/cancel", post(cancel_task))
        .route("/:id/pause", post(pause_task))
        .route("/:id/resume", post(resume_task))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub task_type: String,
    pub payload: String,
    pub priority: Option<i64>,
    pub config: Option<TaskConfig>,
    pub scheduled_at: Option<NaiveDateTime>,
    pub required_cpu_cores: Option<f64>,
    pub required_memory_bytes: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub pool: PoolMetrics,
    pub events_published: u64,
    pub webhook_failed_deliveries: u64,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: TaskStatus,
    /// True when the owning worker was signalled and the terminal state
    /// will follow once it acknowledges (or the lease expires).
    pub signalled: bool,
}

// ============================================================================
// Handlers
// ============================================================================

async fn enqueue_task(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnqueueRequest>,
) -> AppResult<(StatusCode, Json<Task>)> {
    let task = state
        .queue
        .enqueue(CreateTask {
            task_type: request.task_type,
            payload: request.payload,
            priority: request.priority,
            config: request.config,
            scheduled_at: request.scheduled_at,
            required_cpu_cores: request.required_cpu_cores,
            required_memory_bytes: request.required_memory_bytes,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> AppResult<Json<Vec<Task>>> {
    let tasks = state
        .queue
        .list(query.status, query.limit.unwrap_or(100).clamp(1, 1000))
        .await?;
    Ok(Json(tasks))
}

async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Task>> {
    let task = state
        .queue
        .get(&id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("task {}", id)))?;
    Ok(Json(task))
}

async fn queue_stats(State(state): State<Arc<AppState>>) -> AppResult<Json<StatsResponse>> {
    Ok(Json(StatsResponse {
        queue: state.queue.stats().await?,
        pool: state.worker_pool.metrics(),
        events_published: state.hub.events_published(),
        webhook_failed_deliveries: state.webhooks.failed_deliveries(),
    }))
}

async fn list_dead_letter(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> AppResult<Json<Vec<crate::db::models::DeadLetterRecord>>> {
    let records =
        DeadLetterRepository::list(&state.db, query.limit.unwrap_or(100).clamp(1, 1000)).await?;
    Ok(Json(records))
}

#[derive(Debug, Serialize)]
pub struct ResourcesResponse {
    /// Most recent in-memory sample, present while the task executes.
    pub latest: Option<crate::db::models::ResourceSnapshot>,
    /// Persisted (downsampled) snapshot history, newest first.
    pub history: Vec<crate::db::models::ResourceSnapshot>,
}

async fn task_resources(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<ListTasksQuery>,
) -> AppResult<Json<ResourcesResponse>> {
    if state.queue.get(&id).await?.is_none() {
        return Err(AppError::NotFound(format!("task {}", id)));
    }
    let history = crate::db::repository::SnapshotRepository::latest(
        &state.db,
        &id,
        query.limit.unwrap_or(state.config.stuck.io_window.max(8) as i64),
    )
    .await?;
    // Fresh sample when the task is executing, last cached one otherwise.
    let latest = state.monitor.sample(&id).or_else(|| state.monitor.latest(&id));
    Ok(Json(ResourcesResponse { latest, history }))
}

async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<(StatusCode, Json<CancelResponse>)> {
    match state.queue.cancel(&id).await? {
        CancelOutcome::Cancelled(task) => Ok((
            StatusCode::OK,
            Json(CancelResponse {
                status: task.status,
                signalled: false,
            }),
        )),
        CancelOutcome::SignalRunning(task) => {
            // Cooperative path: the worker terminates the executor and
            // acknowledges; the reaper covers a vanished worker.
            state.worker_pool.request_cancel(&task.id);
            Ok((
                StatusCode::ACCEPTED,
                Json(CancelResponse {
                    status: task.status,
                    signalled: true,
                }),
            ))
        }
        CancelOutcome::AlreadyTerminal(task) => Err(AppError::Conflict(format!(
            "task {} is already {}",
            id, task.status
        ))),
        CancelOutcome::NotFound => Err(AppError::NotFound(format!("task {}", id))),
    }
}

async fn pause_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Task>> {
    let task = state.queue.pause(&id).await?;
    state.worker_pool.notify_paused(&id);
    Ok(Json(task))
}

async fn resume_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> AppResult<Json<Task>> {
    let task = state.queue.resume(&id).await?;
    Ok(Json(task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::repository::test_support::test_pool;
    use crate::services::events::EventBus;
    use crate::services::executor::ProcessExecutor;
    use crate::services::monitor::ResourceMonitor;
    use tokio_test::assert_ok;
    use crate::services::notifications::NotificationHub;
    use crate::services::queue::QueueService;
    use crate::services::webhooks::WebhookDispatcher;
    use crate::services::worker_pool::WorkerPool;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    /// Full AppState over an in-memory store; the worker pool is built
    /// but never started, so rows stay where the handlers put them.
    async fn test_app() -> (Router, Arc<AppState>) {
        let pool = test_pool().await;
        let config = Config::default();
        let bus = Arc::new(EventBus::new(pool.clone(), 64, 64));
        let queue = Arc::new(QueueService::new(
            pool.clone(),
            bus.clone(),
            config.queue.clone(),
        ));
        let monitor = Arc::new(ResourceMonitor::new(pool.clone(), bus.clone(), 1, 10, 100, 8));
        let hub = Arc::new(NotificationHub::new(
            pool.clone(),
            bus.clone(),
            config.notifications.clone(),
        ));
        let webhooks = Arc::new(WebhookDispatcher::new(
            pool.clone(),
            config.notifications.clone(),
        ));
        let worker_pool = Arc::new(WorkerPool::new(
            queue.clone(),
            monitor.clone(),
            Arc::new(ProcessExecutor),
            config.worker_pool.clone(),
        ));
        let state = Arc::new(AppState {
            db: pool,
            config,
            queue,
            hub,
            webhooks,
            worker_pool,
            monitor,
        });
        (router().with_state(state.clone()), state)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        tokio_test::assert_ok!(serde_json::from_slice(&bytes))
    }

    #[tokio::test]
    async fn enqueue_and_fetch_roundtrip_over_http() {
        let (app, _state) = test_app().await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/",
                serde_json::json!({
                    "task_type": "echo",
                    "payload": "echo hi",
                    "priority": 5
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let created = body_json(response).await;
        assert_eq!(created["status"], "queued");
        assert_eq!(created["priority"], 5);
        assert_eq!(created["attempt"], 0);
        let id = created["id"].as_str().unwrap().to_string();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let fetched = body_json(response).await;
        assert_eq!(fetched["id"], id.as_str());
        assert_eq!(fetched["task_type"], "echo");
    }

    #[tokio::test]
    async fn enqueue_rejects_blank_task_type_with_422() {
        let (app, state) = test_app().await;

        let response = app
            .oneshot(post_json(
                "/",
                serde_json::json!({ "task_type": "  ", "payload": "echo hi" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

        // Rejected means never stored.
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&state.db)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }

    #[tokio::test]
    async fn cancel_over_http_is_terminal_then_conflict() {
        let (app, state) = test_app().await;
        let task = state
            .queue
            .enqueue(CreateTask {
                task_type: "echo".to_string(),
                payload: "echo hi".to_string(),
                priority: None,
                config: None,
                scheduled_at: None,
                required_cpu_cores: None,
                required_memory_bytes: None,
            })
            .await
            .unwrap();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/{}/cancel", task.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "cancelled");
        assert_eq!(body["signalled"], false);

        // Terminal statuses are absorbing: a second cancel conflicts.
        let response = app
            .oneshot(post_json(
                &format!("/{}/cancel", task.id),
                serde_json::json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "CONFLICT");
    }

    #[tokio::test]
    async fn stats_reports_queue_and_pool_shapes() {
        let (app, state) = test_app().await;
        state
            .queue
            .enqueue(CreateTask {
                task_type: "echo".to_string(),
                payload: "echo hi".to_string(),
                priority: None,
                config: None,
                scheduled_at: None,
                required_cpu_cores: None,
                required_memory_bytes: None,
            })
            .await
            .unwrap();

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;

        let by_status = body["queue"]["by_status"].as_array().unwrap();
        assert!(by_status
            .iter()
            .any(|c| c["status"] == "queued" && c["count"] == 1));
        // The pool was never started.
        assert_eq!(body["pool"]["current_workers"], 0);
        assert_eq!(body["webhook_failed_deliveries"], 0);
        // The enqueue published its pending -> queued event.
        assert!(body["events_published"].as_u64().unwrap() >= 1);
    }
}
