use tokio::time::Instant;
use tracing::debug;

use crate::error::FailureReason;
use crate::observe::metric_inc;
use crate::signing::{compute_signature, SIGNATURE_HEADER};
use crate::transport::{OutboundRequest, Transport};
use crate::types::{Attempt, NewDeliveryRecord};

pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Result of exactly one HTTP send.
#[derive(Debug, Clone)]
pub struct SendReport {
    /// Record to persist for this send.
    pub record: NewDeliveryRecord,
    /// `None` when the endpoint answered 2xx.
    pub failure: Option<FailureReason>,
}

/// Build the request for an attempt.
///
/// The body and the signature are computed from the same byte buffer.
pub fn build_request(attempt: &Attempt) -> Result<OutboundRequest, serde_json::Error> {
    let webhook = &attempt.webhook;
    let body = serde_json::to_vec(&attempt.payload)?;

    let mut request = OutboundRequest {
        method: webhook.method.clone(),
        url: webhook.url.clone(),
        headers: vec![(CONTENT_TYPE_HEADER.to_string(), "application/json".to_string())],
        body,
        timeout: webhook.timeout(),
    };

    for (name, value) in &webhook.headers {
        request.set_header(name.as_str(), value.as_str());
    }
    request.set_header(EVENT_TYPE_HEADER, attempt.event.as_str());

    if let Some(secret) = webhook.secret.as_deref() {
        let signature = compute_signature(secret.as_bytes(), &request.body);
        request.set_header(SIGNATURE_HEADER, signature);
    }

    Ok(request)
}

/// Send one attempt and describe the outcome. Never retries and never
/// touches the store.
///
/// The subscription timeout is enforced here as well as in the transport,
/// so a transport that ignores it still cannot hold the queue.
pub async fn send_attempt(
    transport: &dyn Transport,
    attempt: &Attempt,
    max_response_body: usize,
) -> SendReport {
    let started = Instant::now();

    let result = match build_request(attempt) {
        Ok(request) => {
            let timeout = request.timeout;
            match tokio::time::timeout(timeout, transport.send(request)).await {
                Ok(result) => result,
                Err(_) => Err(FailureReason::Timeout),
            }
        }
        Err(e) => Err(FailureReason::Network(format!("payload serialization failed: {e}"))),
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis())
        .unwrap_or(u64::MAX)
        .min(i64::MAX as u64);

    let (status_code, response_body, failure) = match result {
        Ok(response) if response.is_success() => {
            (Some(response.status), Some(truncate(response.body, max_response_body)), None)
        }
        Ok(response) => (
            Some(response.status),
            Some(truncate(response.body, max_response_body)),
            Some(FailureReason::HttpStatus {
                status: response.status,
            }),
        ),
        Err(reason) => (None, None, Some(reason)),
    };

    match &failure {
        None => metric_inc("webhook.send.success"),
        Some(reason) if reason.is_transport() => metric_inc("webhook.send.transport_error"),
        Some(_) => metric_inc("webhook.send.http_error"),
    }

    debug!(
        webhook_id = %attempt.webhook.id,
        event = %attempt.event,
        retry_count = attempt.retry_count,
        status = ?status_code,
        duration_ms,
        "Webhook send finished"
    );

    SendReport {
        record: NewDeliveryRecord {
            webhook_id: attempt.webhook.id.clone(),
            event: attempt.event.clone(),
            payload: attempt.payload.clone(),
            status_code,
            response_body,
            success: failure.is_none(),
            retry_count: attempt.retry_count,
            error: failure.as_ref().map(ToString::to_string),
            duration_ms,
        },
        failure,
    }
}

fn truncate(mut body: String, max: usize) -> String {
    if body.len() > max {
        let mut cut = max;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    body
}
