use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event name that matches every triggered event.
pub const WILDCARD_EVENT: &str = "*";

pub const DEFAULT_METHOD: &str = "POST";
pub const DEFAULT_RETRY_COUNT: u32 = 3;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Unique identifier for a webhook subscription.
///
/// Strongly typed so subscription ids are not mixed up with
/// delivery record ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookId(pub String);

impl WebhookId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WebhookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WebhookId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A registered webhook target plus its delivery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: WebhookId,
    pub name: String,
    pub url: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub active: bool,

    /// Maximum number of retries after the initial send.
    pub retry_count: u32,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub created_at: String,
    pub updated_at: String,
}

impl Webhook {
    /// Whether this subscription wants `event`, either by name or via `*`.
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events
            .iter()
            .any(|e| e == event || e == WILDCARD_EVENT)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// Registration request for a webhook subscription.
///
/// Deserializes from the usual configuration shape, filling in the
/// documented defaults for missing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWebhook {
    pub name: String,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_timeout_secs", rename = "timeout")]
    pub timeout_secs: u64,
}

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

fn default_retry_count() -> u32 {
    DEFAULT_RETRY_COUNT
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl NewWebhook {
    /// Create a registration with default delivery settings.
    ///
    /// Defaults:
    /// - method: POST
    /// - retry_count: 3
    /// - timeout: 30 seconds
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            method: default_method(),
            headers: BTreeMap::new(),
            secret: None,
            events: Vec::new(),
            retry_count: DEFAULT_RETRY_COUNT,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }

    /// Subscribe to the given event names. `*` subscribes to everything.
    pub fn with_events<I, S>(mut self, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.events = events.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set a secret for HMAC signing.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }
}

/// Partial update of a subscription. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookUpdate {
    pub name: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    /// `Some(None)` clears the secret.
    pub secret: Option<Option<String>>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
    pub retry_count: Option<u32>,
    #[serde(rename = "timeout")]
    pub timeout_secs: Option<u64>,
}

/// One in-memory unit of delivery work.
///
/// Holds a snapshot of the subscription taken at enqueue time, so later
/// edits (including deactivation) do not affect it.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub id: String,
    pub webhook: Arc<Webhook>,
    pub event: String,
    pub payload: Value,
    pub retry_count: u32,
    pub enqueued_at: String,
}

/// Lifecycle of an attempt inside the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    Queued,
    Sending,
    Delivered,
    RetryScheduled,
    Exhausted,
    /// A one-off send (test or redelivery) without a 2xx. Never retried.
    Failed,
}

/// Persisted outcome of a single HTTP send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: String,
    pub webhook_id: WebhookId,
    pub event: String,
    pub payload: Value,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub success: bool,
    pub retry_count: u32,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: String,
}

/// Delivery record before it has been assigned an id and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDeliveryRecord {
    pub webhook_id: WebhookId,
    pub event: String,
    pub payload: Value,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub success: bool,
    pub retry_count: u32,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Aggregate view over persisted delivery records.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_duration_ms: f64,
    pub min_duration_ms: u64,
    pub max_duration_ms: u64,
}

impl DeliveryStats {
    /// Fraction of successful deliveries, 0.0 when nothing was sent.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successful as f64 / self.total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn webhook(events: &[&str]) -> Webhook {
        Webhook {
            id: WebhookId::from("wh-1"),
            name: "hook".into(),
            url: "https://example.test/hook".into(),
            method: "POST".into(),
            headers: BTreeMap::new(),
            secret: None,
            events: events.iter().map(|e| e.to_string()).collect(),
            active: true,
            retry_count: 3,
            timeout_secs: 30,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn wildcard_matches_unlisted_events() {
        let hook = webhook(&["*"]);
        assert!(hook.subscribes_to("user.registered"));
        assert!(hook.subscribes_to("never.listed"));
    }

    #[test]
    fn named_events_match_exactly() {
        let hook = webhook(&["user.registered"]);
        assert!(hook.subscribes_to("user.registered"));
        assert!(!hook.subscribes_to("user.deleted"));
        assert!(!hook.subscribes_to("user"));
    }

    #[test]
    fn new_webhook_deserializes_with_defaults() {
        let parsed: NewWebhook = serde_json::from_value(serde_json::json!({
            "name": "orders",
            "url": "https://example.test/hook",
            "events": ["order.created"]
        }))
        .unwrap();

        assert_eq!(parsed.method, "POST");
        assert!(parsed.headers.is_empty());
        assert_eq!(parsed.secret, None);
        assert_eq!(parsed.retry_count, 3);
        assert_eq!(parsed.timeout_secs, 30);
    }

    #[test]
    fn success_rate_handles_empty_history() {
        assert_eq!(DeliveryStats::default().success_rate(), 0.0);
        let stats = DeliveryStats {
            total: 4,
            successful: 3,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(stats.success_rate(), 0.75);
    }
}
