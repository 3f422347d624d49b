use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::EventKind;

/// An outbound webhook subscription. Independent of tasks: deliveries for
/// one subscription are serialized, distinct subscriptions are
/// independent.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookSubscription {
    /// Primary key (UUID)
    pub id: String,

    /// Target URL for deliveries.
    pub url: String,

    /// JSON array of event kind strings; empty array matches every kind.
    pub event_kinds: String,

    /// HMAC-SHA256 signing secret. Never serialized into API responses.
    #[serde(skip_serializing)]
    pub secret: String,

    /// Delivery attempts before a delivery is dropped.
    pub max_retries: i64,

    pub created_at: NaiveDateTime,
}

impl WebhookSubscription {
    pub fn kinds(&self) -> Vec<EventKind> {
        serde_json::from_str::<Vec<String>>(&self.event_kinds)
            .unwrap_or_default()
            .iter()
            .filter_map(|raw| EventKind::parse(raw))
            .collect()
    }

    /// Empty kind list subscribes to everything.
    pub fn matches(&self, kind: EventKind) -> bool {
        let kinds = self.kinds();
        kinds.is_empty() || kinds.contains(&kind)
    }
}

/// Data required to register a new webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateWebhook {
    pub url: String,
    /// Event kinds to deliver; omit or empty for all.
    pub event_kinds: Option<Vec<EventKind>>,
    pub secret: String,
    pub max_retries: Option<i64>,
}
