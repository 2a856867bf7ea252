//! Webhook subscriptions and a single-process delivery queue.
//!
//! Subscriptions and delivery history live in SQLite behind the [`Store`]
//! contract. Triggered events fan out into one attempt per matching
//! subscription; attempts are sent one at a time, in order, and retried
//! with exponential backoff until each subscription's retry budget runs out.
//!
//! ## Guarantees
//! - At most one outbound request in flight per dispatcher
//! - FIFO ordering of attempts as they become ready
//! - One history record per HTTP send, never updated afterwards
//! - Optional HMAC-SHA256 signature over the exact body bytes
//!
//! ## Non-Guarantees
//! - Queued attempts do not survive a restart
//! - No jitter, no per-endpoint rate limiting
//! - No distributed coordination

mod bus;
mod config;
mod context;
mod dispatcher;
mod error;
mod history;
mod observe;
mod registry;
mod signing;
mod store;
mod transport;
mod types;
mod worker;

pub use bus::{BusEvent, EventBus, EventStream, WEBHOOK_EVENT_PREFIX};
pub use config::{AppConfig, DispatcherConfig};
pub use context::AppContext;
pub use dispatcher::{retry_delay, Dispatcher, TEST_EVENT};
pub use error::{FailureReason, StoreError, StoreResult, WebhookError, WebhookResult};
pub use history::DeliveryHistory;
pub use registry::{WebhookRegistry, MAX_TIMEOUT_SECS};
pub use signing::{
    compute_signature,
    parse_signature_header,
    verify_signature,
    verify_webhook_request,
    VerificationError,
    SIGNATURE_HEADER,
};
pub use store::{run_migrations, Row, RowExt, SqliteStore, Store, CURRENT_VERSION};
pub use transport::{OutboundRequest, Transport, TransportResponse};
pub use types::{
    Attempt,
    AttemptState,
    DeliveryRecord,
    DeliveryStats,
    NewDeliveryRecord,
    NewWebhook,
    Webhook,
    WebhookId,
    WebhookUpdate,
    DEFAULT_METHOD,
    DEFAULT_RETRY_COUNT,
    DEFAULT_TIMEOUT_SECS,
    WILDCARD_EVENT,
};
pub use worker::{build_request, send_attempt, SendReport, CONTENT_TYPE_HEADER, EVENT_TYPE_HEADER};

#[cfg(feature = "http")]
pub use transport::HttpTransport;
