//! Webhook subscription CRUD.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::info;

use crate::error::{WebhookError, WebhookResult};
use crate::store::{Row, RowExt, Store};
use crate::types::{NewWebhook, Webhook, WebhookId, WebhookUpdate};

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

/// Upper bound on a subscription timeout (one day).
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

const SELECT_WEBHOOK: &str = "SELECT id, name, url, method, headers, secret, events, active, \
     retry_count, timeout, created_at, updated_at FROM webhooks";

/// Reads and writes the `webhooks` table.
#[derive(Clone)]
pub struct WebhookRegistry {
    store: Arc<dyn Store>,
}

impl WebhookRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Validate and persist a new subscription.
    pub fn register(&self, new: NewWebhook) -> WebhookResult<Webhook> {
        let method = new.method.trim().to_ascii_uppercase();
        validate(&new.name, &new.url, &method, &new.events, new.timeout_secs)?;

        let now = self.store.now();
        let webhook = Webhook {
            id: WebhookId(self.store.new_id()),
            name: new.name.trim().to_string(),
            url: new.url.trim().to_string(),
            method,
            headers: new.headers,
            secret: new.secret.filter(|s| !s.is_empty()),
            events: new.events,
            active: true,
            retry_count: new.retry_count,
            timeout_secs: new.timeout_secs,
            created_at: now.clone(),
            updated_at: now,
        };

        self.store.execute(
            "INSERT INTO webhooks (id, name, url, method, headers, secret, events, active, retry_count, timeout, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            &params_for(&webhook),
        )?;

        info!(webhook_id = %webhook.id, url = %webhook.url, events = ?webhook.events, "Webhook registered");
        Ok(webhook)
    }

    /// Apply a partial update. The merged subscription is validated as a whole.
    pub fn update(&self, id: &WebhookId, update: WebhookUpdate) -> WebhookResult<Webhook> {
        let mut webhook = self
            .get(id)?
            .ok_or_else(|| WebhookError::NotFound(format!("webhook {id}")))?;

        if let Some(name) = update.name {
            webhook.name = name.trim().to_string();
        }
        if let Some(url) = update.url {
            webhook.url = url.trim().to_string();
        }
        if let Some(method) = update.method {
            webhook.method = method.trim().to_ascii_uppercase();
        }
        if let Some(headers) = update.headers {
            webhook.headers = headers;
        }
        if let Some(secret) = update.secret {
            webhook.secret = secret.filter(|s| !s.is_empty());
        }
        if let Some(events) = update.events {
            webhook.events = events;
        }
        if let Some(active) = update.active {
            webhook.active = active;
        }
        if let Some(retry_count) = update.retry_count {
            webhook.retry_count = retry_count;
        }
        if let Some(timeout_secs) = update.timeout_secs {
            webhook.timeout_secs = timeout_secs;
        }

        validate(
            &webhook.name,
            &webhook.url,
            &webhook.method,
            &webhook.events,
            webhook.timeout_secs,
        )?;
        webhook.updated_at = self.store.now();

        self.store.execute(
            "UPDATE webhooks SET name = ?2, url = ?3, method = ?4, headers = ?5, secret = ?6, events = ?7,
                active = ?8, retry_count = ?9, timeout = ?10, updated_at = ?12
             WHERE id = ?1",
            &params_for(&webhook),
        )?;

        info!(webhook_id = %webhook.id, active = webhook.active, "Webhook updated");
        Ok(webhook)
    }

    /// Soft delete: the row stays so delivery history keeps its reference.
    pub fn delete(&self, id: &WebhookId) -> WebhookResult<()> {
        let changed = self.store.execute(
            "UPDATE webhooks SET active = 0, updated_at = ?2 WHERE id = ?1",
            &[json!(id.as_str()), json!(self.store.now())],
        )?;
        if changed == 0 {
            return Err(WebhookError::NotFound(format!("webhook {id}")));
        }
        info!(webhook_id = %id, "Webhook deactivated");
        Ok(())
    }

    pub fn get(&self, id: &WebhookId) -> WebhookResult<Option<Webhook>> {
        let sql = format!("{SELECT_WEBHOOK} WHERE id = ?1");
        let row = self.store.query_one(&sql, &[json!(id.as_str())])?;
        row.map(|r| webhook_from_row(&r)).transpose()
    }

    /// All subscriptions in registration order.
    pub fn list(&self, include_inactive: bool) -> WebhookResult<Vec<Webhook>> {
        let sql = format!("{SELECT_WEBHOOK} WHERE active = 1 OR ?1 ORDER BY rowid");
        let rows = self.store.query_all(&sql, &[json!(include_inactive)])?;
        rows.iter().map(webhook_from_row).collect()
    }

    /// Active subscriptions that want `event`, in registration order.
    pub fn matching(&self, event: &str) -> WebhookResult<Vec<Webhook>> {
        Ok(self
            .list(false)?
            .into_iter()
            .filter(|w| w.subscribes_to(event))
            .collect())
    }
}

fn params_for(webhook: &Webhook) -> Vec<Value> {
    vec![
        json!(webhook.id.as_str()),
        json!(webhook.name),
        json!(webhook.url),
        json!(webhook.method),
        json!(webhook.headers),
        json!(webhook.secret),
        json!(webhook.events),
        json!(webhook.active),
        json!(webhook.retry_count),
        json!(webhook.timeout_secs),
        json!(webhook.created_at),
        json!(webhook.updated_at),
    ]
}

fn webhook_from_row(row: &Row) -> WebhookResult<Webhook> {
    Ok(Webhook {
        id: WebhookId(row.text("id")?),
        name: row.text("name")?,
        url: row.text("url")?,
        method: row.text("method")?,
        headers: row.json("headers")?,
        secret: row.opt_text("secret")?,
        events: row.json("events")?,
        active: row.flag("active")?,
        retry_count: u32::try_from(row.int("retry_count")?).unwrap_or(0),
        timeout_secs: u64::try_from(row.int("timeout")?).unwrap_or(0),
        created_at: row.text("created_at")?,
        updated_at: row.text("updated_at")?,
    })
}

fn validate(
    name: &str,
    url: &str,
    method: &str,
    events: &[String],
    timeout_secs: u64,
) -> WebhookResult<()> {
    if name.trim().is_empty() {
        return Err(WebhookError::Configuration("name is required".into()));
    }
    if url.trim().is_empty() {
        return Err(WebhookError::Configuration("url is required".into()));
    }
    let parsed = url::Url::parse(url.trim())
        .map_err(|e| WebhookError::Configuration(format!("invalid url {url:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(WebhookError::Configuration(format!(
            "unsupported url scheme {:?}",
            parsed.scheme()
        )));
    }
    if !ALLOWED_METHODS.contains(&method) {
        return Err(WebhookError::Configuration(format!("unsupported method {method:?}")));
    }
    if events.is_empty() || events.iter().any(|e| e.trim().is_empty()) {
        return Err(WebhookError::Configuration(
            "at least one non-empty event name is required (use \"*\" for all)".into(),
        ));
    }
    if timeout_secs == 0 {
        return Err(WebhookError::Configuration("timeout must be at least 1 second".into()));
    }
    if timeout_secs > MAX_TIMEOUT_SECS {
        return Err(WebhookError::Configuration(format!(
            "timeout must be at most {MAX_TIMEOUT_SECS} seconds"
        )));
    }
    Ok(())
}
