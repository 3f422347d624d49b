//! Outbound webhook dispatch.
//!
//! Every subscription gets its own delivery worker fed from an unbounded
//! per-subscription queue, so deliveries for one subscription are
//! serialized in publication order while distinct subscriptions stay
//! independent. Bodies are signed with HMAC-SHA256 over the raw bytes;
//! receivers validate `X-Signature` and use `X-Timestamp` for replay
//! windows. Non-2xx responses retry on a capped, jittered exponential
//! curve; exhaustion is recorded and the delivery dropped — task state is
//! never affected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, mpsc};

use crate::config::NotificationsConfig;
use crate::db::models::{CreateWebhook, TaskEvent, WebhookSubscription};
use crate::db::repository::WebhookRepository;
use crate::error::AppResult;
use crate::services::queue::retry_backoff;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Timestamp";

/// `sha256=<hex>` over the raw body with the subscription secret.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

struct SubscriptionWorker {
    subscription: WebhookSubscription,
    tx: mpsc::UnboundedSender<Arc<TaskEvent>>,
}

pub struct WebhookDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    pool: SqlitePool,
    client: reqwest::Client,
    config: NotificationsConfig,
    workers: Mutex<HashMap<String, SubscriptionWorker>>,
    failed_deliveries: AtomicU64,
}

impl WebhookDispatcher {
    pub fn new(pool: SqlitePool, config: NotificationsConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.webhook_timeout_seconds.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            inner: Arc::new(DispatcherInner {
                pool,
                client,
                config,
                workers: Mutex::new(HashMap::new()),
                failed_deliveries: AtomicU64::new(0),
            }),
        }
    }

    /// Load persisted subscriptions and start routing bus events.
    pub async fn start(
        &self,
        tap: mpsc::UnboundedReceiver<Arc<TaskEvent>>,
        shutdown: broadcast::Receiver<()>,
    ) -> AppResult<()> {
        let existing = WebhookRepository::list_all(&self.inner.pool).await?;
        for subscription in existing {
            self.spawn_worker(subscription);
        }
        tokio::spawn(run_router(self.inner.clone(), tap, shutdown));
        Ok(())
    }

    pub async fn register(&self, webhook: CreateWebhook) -> AppResult<WebhookSubscription> {
        let subscription = WebhookRepository::create(
            &self.inner.pool,
            webhook,
            self.inner.config.webhook_max_retries,
        )
        .await?;
        tracing::info!(webhook_id = %subscription.id, url = %subscription.url, "webhook registered");
        self.spawn_worker(subscription.clone());
        Ok(subscription)
    }

    pub async fn unregister(&self, id: &str) -> AppResult<bool> {
        let removed = WebhookRepository::delete(&self.inner.pool, id).await?;
        // Dropping the sender lets the worker drain and exit.
        self.inner
            .workers
            .lock()
            .expect("workers poisoned")
            .remove(id);
        Ok(removed)
    }

    pub async fn list(&self) -> AppResult<Vec<WebhookSubscription>> {
        WebhookRepository::list_all(&self.inner.pool).await
    }

    pub fn failed_deliveries(&self) -> u64 {
        self.inner.failed_deliveries.load(Ordering::Relaxed)
    }

    /// Route one event to every matching subscription queue.
    pub(crate) fn dispatch(&self, event: Arc<TaskEvent>) {
        dispatch_to_workers(&self.inner, event);
    }

    fn spawn_worker(&self, subscription: WebhookSubscription) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = SubscriptionWorker {
            subscription: subscription.clone(),
            tx,
        };
        self.inner
            .workers
            .lock()
            .expect("workers poisoned")
            .insert(subscription.id.clone(), worker);
        tokio::spawn(run_subscription(self.inner.clone(), subscription, rx));
    }
}

fn dispatch_to_workers(inner: &Arc<DispatcherInner>, event: Arc<TaskEvent>) {
    let workers = inner.workers.lock().expect("workers poisoned");
    for worker in workers.values() {
        if worker.subscription.matches(event.kind) {
            let _ = worker.tx.send(event.clone());
        }
    }
}

async fn run_router(
    inner: Arc<DispatcherInner>,
    mut tap: mpsc::UnboundedReceiver<Arc<TaskEvent>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("webhook dispatcher shutting down");
                break;
            }
            event = tap.recv() => match event {
                Some(event) => dispatch_to_workers(&inner, event),
                None => break,
            },
        }
    }
}

/// Serialized delivery loop for one subscription.
async fn run_subscription(
    inner: Arc<DispatcherInner>,
    subscription: WebhookSubscription,
    mut rx: mpsc::UnboundedReceiver<Arc<TaskEvent>>,
) {
    while let Some(event) = rx.recv().await {
        deliver_with_retry(&inner, &subscription, &event).await;
    }
    tracing::debug!(webhook_id = %subscription.id, "webhook worker exited");
}

async fn deliver_with_retry(
    inner: &Arc<DispatcherInner>,
    subscription: &WebhookSubscription,
    event: &TaskEvent,
) {
    let body = event.to_wire().to_string();
    let signature = sign_body(&subscription.secret, body.as_bytes());
    let max_attempts = subscription.max_retries.max(1);

    for attempt in 1..=max_attempts {
        let response = inner
            .client
            .post(&subscription.url)
            .header(SIGNATURE_HEADER, &signature)
            .header(TIMESTAMP_HEADER, Utc::now().timestamp().to_string())
            .header("Content-Type", "application/json")
            .body(body.clone())
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(
                    webhook_id = %subscription.id,
                    task_id = %event.task_id,
                    seq = event.seq,
                    attempt = attempt,
                    "webhook delivered"
                );
                return;
            }
            Ok(response) => {
                tracing::warn!(
                    webhook_id = %subscription.id,
                    status = %response.status(),
                    attempt = attempt,
                    "webhook delivery rejected"
                );
            }
            Err(e) => {
                tracing::warn!(
                    webhook_id = %subscription.id,
                    attempt = attempt,
                    "webhook delivery error: {}",
                    e
                );
            }
        }

        if attempt < max_attempts {
            let delay = retry_backoff(
                attempt,
                inner.config.webhook_backoff_base_seconds,
                inner.config.webhook_backoff_cap_seconds,
                inner.config.webhook_jitter,
            );
            tokio::time::sleep(Duration::from_millis(delay.num_milliseconds().max(0) as u64))
                .await;
        }
    }

    // Exhausted: record the failed delivery and drop it. Task state is
    // never affected.
    inner.failed_deliveries.fetch_add(1, Ordering::Relaxed);
    let error = crate::error::AppError::DeliveryFailure(format!(
        "subscription {} gave up on task {} seq {} after {} attempts",
        subscription.id, event.task_id, event.seq, max_attempts
    ));
    tracing::error!("{}", error);
}
