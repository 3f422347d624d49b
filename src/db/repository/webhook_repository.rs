use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::models::{CreateWebhook, WebhookSubscription};
use crate::error::{AppError, AppResult};

/// Repository for outbound webhook subscriptions.
pub struct WebhookRepository;

impl WebhookRepository {
    pub async fn create(
        pool: &SqlitePool,
        webhook: CreateWebhook,
        default_max_retries: i64,
    ) -> AppResult<WebhookSubscription> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().naive_utc();
        let kinds: Vec<String> = webhook
            .event_kinds
            .unwrap_or_default()
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();
        let event_kinds = serde_json::to_string(&kinds)
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

        let row = sqlx::query_as::<_, WebhookSubscription>(
            r#"
            INSERT INTO webhooks (id, url, event_kinds, secret, max_retries, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, url, event_kinds, secret, max_retries, created_at
            "#,
        )
        .bind(id)
        .bind(webhook.url)
        .bind(event_kinds)
        .bind(webhook.secret)
        .bind(webhook.max_retries.unwrap_or(default_max_retries))
        .bind(now)
        .fetch_one(pool)
        .await
        .map_err(AppError::Database)?;

        Ok(row)
    }

    pub async fn delete(pool: &SqlitePool, id: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(AppError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: &str,
    ) -> AppResult<Option<WebhookSubscription>> {
        let row = sqlx::query_as::<_, WebhookSubscription>(
            "SELECT id, url, event_kinds, secret, max_retries, created_at FROM webhooks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(row)
    }

    pub async fn list_all(pool: &SqlitePool) -> AppResult<Vec<WebhookSubscription>> {
        let rows = sqlx::query_as::<_, WebhookSubscription>(
            "SELECT id, url, event_kinds, secret, max_retries, created_at FROM webhooks ORDER BY created_at ASC",
        )
        .fetch_all(pool)
        .await
        .map_err(AppError::Database)?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::EventKind;
    use crate::db::repository::test_support::test_pool;

    #[tokio::test]
    async fn create_applies_default_retry_limit() {
        let pool = test_pool().await;
        let sub = WebhookRepository::create(
            &pool,
            CreateWebhook {
                url: "http://localhost:9/hook".to_string(),
                event_kinds: Some(vec![EventKind::Completed]),
                secret: "s".to_string(),
                max_retries: None,
            },
            5,
        )
        .await
        .unwrap();
        assert_eq!(sub.max_retries, 5);
        assert!(sub.matches(EventKind::Completed));
        assert!(!sub.matches(EventKind::Progress));

        assert!(WebhookRepository::delete(&pool, &sub.id).await.unwrap());
        assert!(!WebhookRepository::delete(&pool, &sub.id).await.unwrap());
    }
}
