//! In-process publish/subscribe, scoped to whoever owns the [`EventBus`].

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Prefix of the events the webhook dispatcher emits about itself.
pub const WEBHOOK_EVENT_PREFIX: &str = "webhook:";

const DEFAULT_CAPACITY: usize = 256;

/// A named event with an arbitrary JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub name: String,
    pub payload: Value,
}

impl BusEvent {
    /// Events emitted by the dispatcher describing its own activity.
    pub fn is_webhook_lifecycle(&self) -> bool {
        self.name.starts_with(WEBHOOK_EVENT_PREFIX)
    }
}

/// Cloneable handle to a broadcast channel of [`BusEvent`]s.
///
/// Emitting with no subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(&self, name: impl Into<String>, payload: Value) {
        let event = BusEvent {
            name: name.into(),
            payload,
        };
        debug!(event = %event.name, "Emitting bus event");
        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side of an [`EventBus`] subscription.
pub struct EventStream {
    rx: broadcast::Receiver<BusEvent>,
}

impl EventStream {
    /// Wait for the next event. Returns `None` once every bus handle is gone.
    ///
    /// A subscriber that falls behind skips the events it missed.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}
