use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::body::Body;
use http::{HeaderValue, StatusCode};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod config;
mod db;
mod error;
mod routes;
mod services;

use config::Config;
use services::events::EventBus;
use services::executor::ProcessExecutor;
use services::init;
use services::monitor::ResourceMonitor;
use services::notifications::NotificationHub;
use services::queue::QueueService;
use services::stuck::StuckDetector;
use services::webhooks::WebhookDispatcher;
use services::worker_pool::WorkerPool;

/// Process-wide state: constructed once at startup and passed by
/// reference to every component. No ambient singletons.
pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub queue: Arc<QueueService>,
    pub hub: Arc<NotificationHub>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub worker_pool: Arc<WorkerPool>,
    pub monitor: Arc<ResourceMonitor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "taskforge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Taskforge task execution service");

    // Open the task store
    let pool = init::init_store(&config).await?;

    // Root shutdown fanout: every long-lived component subscribes.
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(8);

    // Build the service graph, leaves first.
    let bus = Arc::new(EventBus::new(
        pool.clone(),
        config.notifications.polling_ring_size,
        config.notifications.push_buffer_size,
    ));
    let queue = Arc::new(QueueService::new(
        pool.clone(),
        bus.clone(),
        config.queue.clone(),
    ));
    let monitor = Arc::new(ResourceMonitor::new(
        pool.clone(),
        bus.clone(),
        config.worker_pool.sample_interval_seconds,
        config.worker_pool.persist_interval_seconds,
        config.worker_pool.snapshot_keep,
        config.stuck.io_window.max(8),
    ));
    let (candidates_tx, candidates_rx) = init::candidate_channel();
    let detector = Arc::new(StuckDetector::new(
        pool.clone(),
        monitor.clone(),
        config.stuck.clone(),
        config.worker_pool.sample_interval_seconds,
        candidates_tx,
    ));
    let webhooks = Arc::new(WebhookDispatcher::new(
        pool.clone(),
        config.notifications.clone(),
    ));
    webhooks
        .start(bus.add_tap(), shutdown_tx.subscribe())
        .await?;
    let hub = Arc::new(NotificationHub::new(
        pool.clone(),
        bus.clone(),
        config.notifications.clone(),
    ));
    let worker_pool = Arc::new(WorkerPool::new(
        queue.clone(),
        monitor.clone(),
        Arc::new(ProcessExecutor),
        config.worker_pool.clone(),
    ));

    // Spawn background components and the pool.
    let background = init::spawn_background_services(
        queue.clone(),
        monitor.clone(),
        detector,
        shutdown_tx.clone(),
    );
    worker_pool.start(candidates_rx);

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        queue,
        hub,
        webhooks,
        worker_pool: worker_pool.clone(),
        monitor,
    });

    // Rate limiter for the public task-submission and webhook endpoints.
    // The error handler returns a proper 429 status and Retry-After header when limits are exceeded.
    let mut api_builder = GovernorConfigBuilder::default();
    api_builder.per_second(config.rate_limit.api_per_second.into());
    api_builder.burst_size(config.rate_limit.api_burst.into());
    api_builder.key_extractor(SmartIpKeyExtractor);
    api_builder.error_handler(|error: GovernorError| -> http::Response<Body> {
        match error {
            GovernorError::TooManyRequests { wait_time, headers } => {
                let retry_after = wait_time;
                let body = serde_json::json!({
                    "error": {
                        "code": "RATE_LIMITED",
                        "message": "Rate limit exceeded",
                        "details": { "retry_after_seconds": retry_after }
                    }
                })
                .to_string();

                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::TOO_MANY_REQUESTS;
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp.headers_mut().insert(
                    http::header::RETRY_AFTER,
                    http::HeaderValue::from_str(&retry_after.to_string()).unwrap(),
                );
                resp
            }
            GovernorError::UnableToExtractKey => {
                let body = serde_json::json!({
                    "error": {
                        "code": "INVALID_REQUEST",
                        "message": "Unable to determine client IP for rate limiting"
                    }
                })
                .to_string();

                let mut resp = http::Response::new(Body::from(body));
                *resp.status_mut() = StatusCode::BAD_REQUEST;
                resp.headers_mut().insert(
                    http::header::CONTENT_TYPE,
                    http::HeaderValue::from_static("application/json"),
                );
                resp
            }
            GovernorError::Other { code, msg, headers } => {
                let body = msg.unwrap_or_else(|| "Rate limiting error".to_string());
                let mut resp = http::Response::new(Body::from(body));
                let status = StatusCode::from_u16(code.as_u16())
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                *resp.status_mut() = status;
                if let Some(hmap) = headers {
                    for (name, value) in hmap.iter() {
                        resp.headers_mut().append(name.clone(), value.clone());
                    }
                }
                resp
            }
        }
    });
    let api_gov_conf = Arc::new(
        api_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build API governor config"))?,
    );

    // Background cleanup for the limiter storage
    {
        let limiter = api_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            tracing::debug!("api rate limiter size: {}", limiter.len());
            limiter.retain_recent();
        });
    }

    let api_rate_layer = GovernorLayer {
        config: api_gov_conf.clone(),
    };

    // Build router
    let app = Router::new()
        // Health check
        .route("/health", get(routes::health::health_check))
        // Task submission and control (rate limited: public surface)
        .nest("/api/tasks", routes::tasks::router().layer(api_rate_layer.clone()))
        // Event streams, polling catch-up
        .nest("/api/events", routes::events::router())
        // Webhook subscriptions (rate limited: public surface)
        .nest(
            "/api/webhooks",
            routes::webhooks::router().layer(api_rate_layer),
        )
        // Add shared state
        .with_state(app_state.clone())
        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(
                    config
                        .server
                        .frontend_url
                        .parse::<HeaderValue>()
                        .expect("Invalid FRONTEND_URL for CORS"),
                )
                .allow_methods([
                    http::Method::GET,
                    http::Method::POST,
                    http::Method::DELETE,
                    http::Method::OPTIONS,
                ])
                .allow_headers([
                    http::header::CONTENT_TYPE,
                    http::header::ACCEPT,
                    http::header::HeaderName::from_static("last-event-id"),
                ]),
        );

    // Start server
    let host = config.server.host.clone();
    let port = config.server.port;
    let addr = format!("{}:{}", host, port);

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Cancel-and-join fanout from the root: stop claiming, give executors
    // the configured grace, then wind down the periodic components.
    tracing::info!("Shutting down");
    let _ = shutdown_tx.send(());
    worker_pool
        .stop(Duration::from_secs(
            config.worker_pool.grace_termination_seconds,
        ))
        .await;
    for handle in background {
        let _ = handle.await;
    }
    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
