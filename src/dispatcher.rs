use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::DispatcherConfig;
use crate::error::{FailureReason, WebhookError, WebhookResult};
use crate::history::DeliveryHistory;
use crate::observe::{metric_inc, metric_inc_webhook};
use crate::registry::WebhookRegistry;
use crate::store::Store;
use crate::transport::Transport;
use crate::types::{
    Attempt, AttemptState, DeliveryRecord, DeliveryStats, NewDeliveryRecord, NewWebhook, Webhook,
    WebhookId, WebhookUpdate,
};
use crate::worker::send_attempt;

/// Event name used for manual probes when the caller supplies no payload.
pub const TEST_EVENT: &str = "webhook.test";

/// Delay before re-queueing an attempt that has already been retried
/// `prior_retries` times: `base * 2^prior_retries`.
pub fn retry_delay(base: Duration, prior_retries: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(prior_retries))
}

/// Webhook delivery queue.
///
/// Triggered events fan out into one attempt per matching subscription.
/// Attempts are drained strictly FIFO with at most one HTTP request in
/// flight; failed attempts re-enter at the back of the queue after an
/// exponential delay until the subscription's retry budget is spent.
///
/// Must be created inside a tokio runtime.
pub struct Dispatcher {
    shared: Arc<Shared>,
    ticker: Option<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
}

struct Shared {
    config: DispatcherConfig,
    store: Arc<dyn Store>,
    registry: WebhookRegistry,
    history: DeliveryHistory,
    transport: Arc<dyn Transport>,
    bus: Option<EventBus>,
    queue: Mutex<VecDeque<Attempt>>,
    /// Set while a drain pass owns the queue.
    draining: AtomicBool,
    is_running: AtomicBool,
    scheduled_retries: AtomicUsize,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, store: Arc<dyn Store>, transport: Arc<dyn Transport>) -> Self {
        Self::build(config, store, transport, None)
    }

    /// Like [`Dispatcher::new`], additionally emitting `webhook:*` lifecycle
    /// events on `bus`.
    pub fn new_with_bus(
        config: DispatcherConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
    ) -> Self {
        Self::build(config, store, transport, Some(bus))
    }

    fn build(
        config: DispatcherConfig,
        store: Arc<dyn Store>,
        transport: Arc<dyn Transport>,
        bus: Option<EventBus>,
    ) -> Self {
        let shared = Arc::new(Shared {
            registry: WebhookRegistry::new(store.clone()),
            history: DeliveryHistory::new(store.clone()),
            config,
            store,
            transport,
            bus,
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            is_running: AtomicBool::new(true),
            scheduled_retries: AtomicUsize::new(0),
        });

        let ticker = tokio::spawn(tick_loop(
            Arc::downgrade(&shared),
            shared.config.tick_interval,
        ));

        Self {
            shared,
            ticker: Some(ticker),
            listeners: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Validate and store a subscription. Configuration errors come back
    /// here and nothing is enqueued.
    pub fn register_webhook(&self, new: NewWebhook) -> WebhookResult<Webhook> {
        let webhook = self.shared.registry.register(new)?;
        self.shared.emit(
            "webhook:registered",
            json!({ "webhook_id": webhook.id, "name": webhook.name }),
        );
        Ok(webhook)
    }

    /// Already-queued attempts keep the snapshot they were created with.
    pub fn update_webhook(&self, id: &WebhookId, update: WebhookUpdate) -> WebhookResult<Webhook> {
        let webhook = self.shared.registry.update(id, update)?;
        self.shared.emit(
            "webhook:updated",
            json!({ "webhook_id": webhook.id, "active": webhook.active }),
        );
        Ok(webhook)
    }

    /// Deactivate a subscription. In-flight and queued attempts still run
    /// to completion.
    pub fn delete_webhook(&self, id: &WebhookId) -> WebhookResult<()> {
        self.shared.registry.delete(id)?;
        self.shared.emit("webhook:deleted", json!({ "webhook_id": id }));
        Ok(())
    }

    pub fn webhook(&self, id: &WebhookId) -> WebhookResult<Option<Webhook>> {
        self.shared.registry.get(id)
    }

    pub fn webhooks(&self, include_inactive: bool) -> WebhookResult<Vec<Webhook>> {
        self.shared.registry.list(include_inactive)
    }

    // ------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------

    /// Fan `event` out to every active matching subscription.
    ///
    /// Returns how many attempts were enqueued. Delivery results are only
    /// visible through the history and statistics.
    pub async fn trigger(&self, event: &str, payload: Value) -> WebhookResult<usize> {
        self.shared.trigger(event, payload).await
    }

    /// Send one request to a subscription right now, bypassing the queue.
    ///
    /// Retry count is fixed at 0 and a failure is not retried. Without a
    /// payload a synthetic one is sent under [`TEST_EVENT`].
    pub async fn test_webhook(
        &self,
        id: &WebhookId,
        payload: Option<Value>,
    ) -> WebhookResult<DeliveryRecord> {
        let shared = &self.shared;
        shared.ensure_running()?;
        let webhook = shared
            .registry
            .get(id)?
            .ok_or_else(|| WebhookError::NotFound(format!("webhook {id}")))?;

        let payload = payload.unwrap_or_else(|| {
            json!({
                "test": true,
                "message": "This is a test webhook delivery",
                "webhook_id": webhook.id,
                "timestamp": shared.store.now(),
            })
        });

        let attempt = shared.new_attempt(Arc::new(webhook), TEST_EVENT, payload, 0);
        shared.send_once(attempt).await
    }

    /// Re-send a stored delivery with its original event, payload and retry
    /// count, using the subscription's current settings.
    ///
    /// Produces a new record and leaves the original untouched. A failure is
    /// not retried automatically.
    pub async fn redeliver(&self, record_id: &str) -> WebhookResult<DeliveryRecord> {
        let shared = &self.shared;
        shared.ensure_running()?;
        let original = shared
            .history
            .get(record_id)?
            .ok_or_else(|| WebhookError::NotFound(format!("delivery {record_id}")))?;
        let webhook = shared
            .registry
            .get(&original.webhook_id)?
            .ok_or_else(|| WebhookError::NotFound(format!("webhook {}", original.webhook_id)))?;

        info!(
            delivery_id = %original.id,
            webhook_id = %webhook.id,
            event = %original.event,
            "Redelivering webhook"
        );

        let attempt = shared.new_attempt(
            Arc::new(webhook),
            &original.event,
            original.payload,
            original.retry_count,
        );
        shared.send_once(attempt).await
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn deliveries(&self, webhook_id: Option<&WebhookId>, limit: usize) -> WebhookResult<Vec<DeliveryRecord>> {
        Ok(self.shared.history.list(webhook_id, limit)?)
    }

    pub fn delivery(&self, id: &str) -> WebhookResult<Option<DeliveryRecord>> {
        Ok(self.shared.history.get(id)?)
    }

    pub fn stats(&self, webhook_id: Option<&WebhookId>) -> WebhookResult<DeliveryStats> {
        Ok(self.shared.history.stats(webhook_id)?)
    }

    /// Remove delivery records older than `before` (ISO-8601).
    pub fn purge_deliveries_before(&self, before: &str) -> WebhookResult<usize> {
        let purged = self.shared.history.purge_before(before)?;
        info!(purged, before, "Purged delivery records");
        Ok(purged)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Trigger webhooks for every event emitted on `bus`, except the
    /// dispatcher's own `webhook:*` events.
    pub fn listen(&mut self, bus: &EventBus) {
        let mut stream = bus.subscribe();
        let weak = Arc::downgrade(&self.shared);
        self.listeners.push(tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                if event.is_webhook_lifecycle() {
                    continue;
                }
                let Some(shared) = weak.upgrade() else { break };
                if let Err(e) = shared.trigger(&event.name, event.payload).await {
                    warn!(event = %event.name, error = %e, "Failed to trigger webhooks for bus event");
                }
            }
        }));
    }

    /// Attempts waiting in the queue, not counting pending retry timers.
    pub async fn queue_len(&self) -> usize {
        self.shared.queue.lock().await.len()
    }

    /// Attempts waiting for their backoff delay to elapse.
    pub fn scheduled_retries(&self) -> usize {
        self.shared.scheduled_retries.load(Ordering::SeqCst)
    }

    /// No queued attempts, nothing being sent and no retry timer pending.
    pub async fn is_idle(&self) -> bool {
        let queue_empty = self.shared.queue.lock().await.is_empty();
        queue_empty
            && !self.shared.draining.load(Ordering::SeqCst)
            && self.scheduled_retries() == 0
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running.load(Ordering::SeqCst)
    }

    /// Stop accepting work. Queued attempts and pending retries are
    /// dropped; a send already in flight finishes and is recorded.
    pub async fn shutdown(&mut self) {
        self.shared.is_running.store(false, Ordering::SeqCst);

        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        for listener in self.listeners.drain(..) {
            listener.abort();
        }

        let dropped = {
            let mut queue = self.shared.queue.lock().await;
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            warn!(dropped, "Dropped queued webhook attempts on shutdown");
        }
        info!("Webhook dispatcher shut down");
    }
}

#[cfg(test)]
impl Dispatcher {
    /// Queue an attempt without starting a drain pass.
    async fn enqueue_without_kick(&self, webhook: Webhook, event: &str, payload: Value) {
        let attempt = self.shared.new_attempt(Arc::new(webhook), event, payload, 0);
        self.shared.queue.lock().await.push_back(attempt);
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.abort();
        }
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
    }
}

impl Shared {
    fn ensure_running(&self) -> WebhookResult<()> {
        if self.is_running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WebhookError::Shutdown)
        }
    }

    fn emit(&self, name: &str, payload: Value) {
        if let Some(bus) = &self.bus {
            bus.emit(name, payload);
        }
    }

    fn new_attempt(&self, webhook: Arc<Webhook>, event: &str, payload: Value, retry_count: u32) -> Attempt {
        Attempt {
            id: self.store.new_id(),
            webhook,
            event: event.to_string(),
            payload,
            retry_count,
            enqueued_at: self.store.now(),
        }
    }

    async fn trigger(self: &Arc<Self>, event: &str, payload: Value) -> WebhookResult<usize> {
        self.ensure_running()?;

        let attempts: Vec<Attempt> = self
            .registry
            .matching(event)?
            .into_iter()
            .map(|webhook| self.new_attempt(Arc::new(webhook), event, payload.clone(), 0))
            .collect();
        let count = attempts.len();

        if count > 0 {
            self.queue.lock().await.extend(attempts);
            metric_inc("webhook.dispatch.enqueued");
            kick(self);
        }

        debug!(event, attempts = count, "Event fanned out");
        Ok(count)
    }

    /// Direct send used by probes and redelivery: one request, one record.
    async fn send_once(&self, attempt: Attempt) -> WebhookResult<DeliveryRecord> {
        let report = send_attempt(self.transport.as_ref(), &attempt, self.config.max_response_body).await;
        let failure = report.failure.clone();
        let record = self.history.insert(report.record)?;

        let state = if failure.is_none() {
            AttemptState::Delivered
        } else {
            AttemptState::Failed
        };
        self.emit_outcome(&attempt, state, Some(&record.id), failure.as_ref(), None);
        Ok(record)
    }

    /// Drive one attempt through `Sending` to its next state.
    async fn process_attempt(self: &Arc<Self>, mut attempt: Attempt) -> AttemptState {
        debug!(
            attempt_id = %attempt.id,
            webhook_id = %attempt.webhook.id,
            event = %attempt.event,
            retry_count = attempt.retry_count,
            state = ?AttemptState::Sending,
            "Sending webhook"
        );

        let report = send_attempt(self.transport.as_ref(), &attempt, self.config.max_response_body).await;
        let failure = report.failure.clone();
        let record_id = self.persist(report.record);

        let Some(reason) = failure else {
            metric_inc_webhook("webhook.delivery.delivered", &attempt.webhook.id);
            info!(
                webhook_id = %attempt.webhook.id,
                event = %attempt.event,
                retry_count = attempt.retry_count,
                "Webhook delivered"
            );
            self.emit_outcome(&attempt, AttemptState::Delivered, record_id.as_deref(), None, None);
            return AttemptState::Delivered;
        };

        if attempt.retry_count < attempt.webhook.retry_count {
            let delay = retry_delay(self.config.retry_base, attempt.retry_count);
            warn!(
                webhook_id = %attempt.webhook.id,
                event = %attempt.event,
                retry_count = attempt.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "Webhook delivery failed, retry scheduled"
            );
            self.emit_outcome(
                &attempt,
                AttemptState::RetryScheduled,
                record_id.as_deref(),
                Some(&reason),
                Some(delay),
            );
            metric_inc("webhook.delivery.retry_scheduled");
            attempt.retry_count += 1;
            schedule_retry(self, attempt, delay);
            AttemptState::RetryScheduled
        } else {
            metric_inc_webhook("webhook.delivery.exhausted", &attempt.webhook.id);
            error!(
                webhook_id = %attempt.webhook.id,
                event = %attempt.event,
                retry_count = attempt.retry_count,
                error = %reason,
                "Webhook delivery failed, retries exhausted"
            );
            self.emit_outcome(
                &attempt,
                AttemptState::Exhausted,
                record_id.as_deref(),
                Some(&reason),
                None,
            );
            AttemptState::Exhausted
        }
    }

    /// Store failures are reported and swallowed so they cannot change the
    /// retry decision for the attempt.
    fn persist(&self, record: NewDeliveryRecord) -> Option<String> {
        let webhook_id = record.webhook_id.clone();
        match self.history.insert(record) {
            Ok(stored) => Some(stored.id),
            Err(e) => {
                metric_inc("webhook.record.persist_failed");
                error!(webhook_id = %webhook_id, error = %e, "Failed to persist delivery record");
                None
            }
        }
    }

    fn emit_outcome(
        &self,
        attempt: &Attempt,
        state: AttemptState,
        record_id: Option<&str>,
        failure: Option<&FailureReason>,
        retry_in: Option<Duration>,
    ) {
        let name = match state {
            AttemptState::Delivered => "webhook:delivered",
            AttemptState::RetryScheduled | AttemptState::Failed => "webhook:failed",
            _ => "webhook:exhausted",
        };
        self.emit(
            name,
            json!({
                "webhook_id": attempt.webhook.id,
                "event": attempt.event,
                "delivery_id": record_id,
                "retry_count": attempt.retry_count,
                "state": state,
                "error": failure.map(ToString::to_string),
                "retry_in_ms": retry_in.map(|d| d.as_millis() as u64),
            }),
        );
    }
}

/// Start a drain pass unless one is already running.
fn kick(shared: &Arc<Shared>) {
    if !shared.is_running.load(Ordering::SeqCst) {
        return;
    }
    if shared
        .draining
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        tokio::spawn(drain(shared.clone()));
    }
}

async fn drain(shared: Arc<Shared>) {
    loop {
        let next = shared.queue.lock().await.pop_front();
        match next {
            Some(attempt) => {
                let state = shared.process_attempt(attempt).await;
                debug!(state = ?state, "Attempt processed");
            }
            None => {
                shared.draining.store(false, Ordering::SeqCst);
                // Work enqueued between the empty pop and the flag reset
                // would otherwise wait for the next tick.
                let more = !shared.queue.lock().await.is_empty();
                if more
                    && shared.is_running.load(Ordering::SeqCst)
                    && shared
                        .draining
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                {
                    continue;
                }
                return;
            }
        }
    }
}

fn schedule_retry(shared: &Arc<Shared>, attempt: Attempt, delay: Duration) {
    shared.scheduled_retries.fetch_add(1, Ordering::SeqCst);
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if shared.is_running.load(Ordering::SeqCst) {
            shared.queue.lock().await.push_back(attempt);
            kick(&shared);
        } else {
            warn!(
                webhook_id = %attempt.webhook.id,
                event = %attempt.event,
                "Dispatcher shut down, dropping scheduled retry"
            );
        }
        shared.scheduled_retries.fetch_sub(1, Ordering::SeqCst);
    });
}

/// Fallback nudge for the drain loop.
async fn tick_loop(weak: Weak<Shared>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(shared) = weak.upgrade() else { break };
        if !shared.is_running.load(Ordering::SeqCst) {
            break;
        }
        let has_work = !shared.queue.lock().await.is_empty();
        if has_work && !shared.draining.load(Ordering::SeqCst) {
            debug!("Tick starting idle drain loop");
            kick(&shared);
        }
    }
}
