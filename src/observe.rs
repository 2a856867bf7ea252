#[cfg(feature = "metrics")]
pub(crate) fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc(_name: &'static str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_inc_webhook(name: &'static str, webhook_id: &crate::types::WebhookId) {
    metrics::increment_counter!(name, "webhook" => webhook_id.0.clone());
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_inc_webhook(_name: &'static str, _webhook_id: &crate::types::WebhookId) {}
