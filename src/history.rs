//! Append-only delivery history and the statistics computed over it.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::StoreResult;
use crate::store::{Row, RowExt, Store};
use crate::types::{DeliveryRecord, DeliveryStats, NewDeliveryRecord, WebhookId};

const SELECT_DELIVERY: &str = "SELECT id, webhook_id, event, payload, status_code, response_body, \
     success, retry_count, error, duration_ms, created_at FROM webhook_deliveries";

/// Reads and appends to the `webhook_deliveries` table.
#[derive(Clone)]
pub struct DeliveryHistory {
    store: Arc<dyn Store>,
}

impl DeliveryHistory {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append one record. Records are never updated afterwards.
    pub fn insert(&self, new: NewDeliveryRecord) -> StoreResult<DeliveryRecord> {
        let record = DeliveryRecord {
            id: self.store.new_id(),
            webhook_id: new.webhook_id,
            event: new.event,
            payload: new.payload,
            status_code: new.status_code,
            response_body: new.response_body,
            success: new.success,
            retry_count: new.retry_count,
            error: new.error,
            duration_ms: new.duration_ms,
            created_at: self.store.now(),
        };

        self.store.execute(
            "INSERT INTO webhook_deliveries (id, webhook_id, event, payload, status_code, response_body, success, retry_count, error, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            &[
                json!(record.id),
                json!(record.webhook_id.as_str()),
                json!(record.event),
                // Stored as JSON text even for scalar payloads.
                Value::String(serde_json::to_string(&record.payload)?),
                json!(record.status_code),
                json!(record.response_body),
                json!(record.success),
                json!(record.retry_count),
                json!(record.error),
                json!(record.duration_ms),
                json!(record.created_at),
            ],
        )?;

        Ok(record)
    }

    pub fn get(&self, id: &str) -> StoreResult<Option<DeliveryRecord>> {
        let sql = format!("{SELECT_DELIVERY} WHERE id = ?1");
        self.store
            .query_one(&sql, &[json!(id)])?
            .map(|row| record_from_row(&row))
            .transpose()
    }

    /// Most recent records first, optionally restricted to one subscription.
    pub fn list(&self, webhook_id: Option<&WebhookId>, limit: usize) -> StoreResult<Vec<DeliveryRecord>> {
        let sql = format!(
            "{SELECT_DELIVERY} WHERE (?1 IS NULL OR webhook_id = ?1) ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .store
            .query_all(&sql, &[json!(webhook_id.map(WebhookId::as_str)), json!(limit)])?;
        rows.iter().map(record_from_row).collect()
    }

    /// Aggregate over every record, or over one subscription's records.
    pub fn stats(&self, webhook_id: Option<&WebhookId>) -> StoreResult<DeliveryStats> {
        let row = self.store.query_one(
            "SELECT COUNT(*) AS total,
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) AS successful,
                    COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) AS failed,
                    COALESCE(AVG(duration_ms), 0.0) AS avg_duration_ms,
                    COALESCE(MIN(duration_ms), 0) AS min_duration_ms,
                    COALESCE(MAX(duration_ms), 0) AS max_duration_ms
             FROM webhook_deliveries
             WHERE (?1 IS NULL OR webhook_id = ?1)",
            &[json!(webhook_id.map(WebhookId::as_str))],
        )?;

        let Some(row) = row else {
            return Ok(DeliveryStats::default());
        };

        Ok(DeliveryStats {
            total: non_negative(row.int("total")?),
            successful: non_negative(row.int("successful")?),
            failed: non_negative(row.int("failed")?),
            avg_duration_ms: row.real("avg_duration_ms")?,
            min_duration_ms: non_negative(row.int("min_duration_ms")?),
            max_duration_ms: non_negative(row.int("max_duration_ms")?),
        })
    }

    /// Delete records created strictly before `before` (an ISO-8601 timestamp).
    pub fn purge_before(&self, before: &str) -> StoreResult<usize> {
        self.store.execute(
            "DELETE FROM webhook_deliveries WHERE created_at < ?1",
            &[json!(before)],
        )
    }
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn record_from_row(row: &Row) -> StoreResult<DeliveryRecord> {
    Ok(DeliveryRecord {
        id: row.text("id")?,
        webhook_id: WebhookId(row.text("webhook_id")?),
        event: row.text("event")?,
        payload: row.json("payload")?,
        status_code: row.opt_int("status_code")?.and_then(|s| u16::try_from(s).ok()),
        response_body: row.opt_text("response_body")?,
        success: row.flag("success")?,
        retry_count: u32::try_from(row.int("retry_count")?).unwrap_or(0),
        error: row.opt_text("error")?,
        duration_ms: non_negative(row.int("duration_ms")?),
        created_at: row.text("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WebhookRegistry;
    use crate::store::SqliteStore;
    use crate::types::NewWebhook;

    fn setup() -> (DeliveryHistory, WebhookId, WebhookId) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open_in_memory().unwrap());
        let registry = WebhookRegistry::new(store.clone());
        let a = registry
            .register(NewWebhook::new("a", "https://a.test").with_events(["*"]))
            .unwrap();
        let b = registry
            .register(NewWebhook::new("b", "https://b.test").with_events(["*"]))
            .unwrap();
        (DeliveryHistory::new(store), a.id, b.id)
    }

    fn record(webhook_id: &WebhookId, success: bool, duration_ms: u64) -> NewDeliveryRecord {
        NewDeliveryRecord {
            webhook_id: webhook_id.clone(),
            event: "user.registered".into(),
            payload: json!({"id": "u1"}),
            status_code: Some(if success { 200 } else { 500 }),
            response_body: Some("ok".into()),
            success,
            retry_count: 0,
            error: (!success).then(|| "HTTP 500".to_string()),
            duration_ms,
        }
    }

    #[test]
    fn test_insert_and_get_round_trip() {
        let (history, a, _) = setup();
        let inserted = history.insert(record(&a, false, 12)).unwrap();
        let loaded = history.get(&inserted.id).unwrap().unwrap();
        assert_eq!(loaded, inserted);
        assert!(history.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_transport_failure_record_has_null_status() {
        let (history, a, _) = setup();
        let mut new = record(&a, false, 5);
        new.status_code = None;
        new.response_body = None;
        new.error = Some("request timed out".into());
        let inserted = history.insert(new).unwrap();

        let loaded = history.get(&inserted.id).unwrap().unwrap();
        assert_eq!(loaded.status_code, None);
        assert_eq!(loaded.response_body, None);
    }

    #[test]
    fn test_stats_global_and_per_webhook() {
        let (history, a, b) = setup();
        history.insert(record(&a, true, 10)).unwrap();
        history.insert(record(&a, false, 30)).unwrap();
        history.insert(record(&b, true, 50)).unwrap();

        let all = history.stats(None).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.successful, 2);
        assert_eq!(all.failed, 1);
        assert_eq!(all.min_duration_ms, 10);
        assert_eq!(all.max_duration_ms, 50);
        assert!((all.avg_duration_ms - 30.0).abs() < f64::EPSILON);

        let only_a = history.stats(Some(&a)).unwrap();
        assert_eq!(only_a.total, 2);
        assert_eq!(only_a.successful, 1);
        assert!((only_a.avg_duration_ms - 20.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stats_on_empty_history() {
        let (history, _, _) = setup();
        assert_eq!(history.stats(None).unwrap(), DeliveryStats::default());
    }

    #[test]
    fn test_list_newest_first_with_limit_and_filter() {
        let (history, a, b) = setup();
        let first = history.insert(record(&a, true, 1)).unwrap();
        let second = history.insert(record(&a, true, 2)).unwrap();
        history.insert(record(&b, true, 3)).unwrap();

        let listed = history.list(Some(&a), 10).unwrap();
        assert_eq!(
            listed.iter().map(|r| r.id.clone()).collect::<Vec<_>>(),
            vec![second.id.clone(), first.id]
        );
        assert_eq!(history.list(None, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_purge_before() {
        let (history, a, _) = setup();
        history.insert(record(&a, true, 1)).unwrap();
        assert_eq!(history.purge_before("1970-01-01T00:00:00Z").unwrap(), 0);
        assert_eq!(history.purge_before("9999-01-01T00:00:00Z").unwrap(), 1);
        assert_eq!(history.stats(None).unwrap().total, 0);
    }
}
