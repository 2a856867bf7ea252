use thiserror::Error;

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection unusable (poisoned lock, closed handle)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Row did not have the expected shape
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned to callers of the webhook API.
///
/// Delivery failures never show up here: they are recorded in the
/// delivery history instead.
#[derive(Error, Debug)]
pub enum WebhookError {
    /// Subscription is malformed. Never enters the queue.
    #[error("invalid webhook configuration: {0}")]
    Configuration(String),

    /// Store read or write failed.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("not found: {0}")]
    NotFound(String),

    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,
}

pub type WebhookResult<T> = Result<T, WebhookError>;

/// Reasons why a single HTTP delivery attempt failed.
///
/// Every variant is retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The subscription timeout elapsed before a response arrived.
    #[error("request timed out")]
    Timeout,

    /// Connection, DNS or protocol failure.
    #[error("network error: {0}")]
    Network(String),

    /// The endpoint answered outside the 2xx range.
    #[error("HTTP {status}")]
    HttpStatus { status: u16 },
}

impl FailureReason {
    /// True for failures where no HTTP response was received.
    pub fn is_transport(&self) -> bool {
        matches!(self, FailureReason::Timeout | FailureReason::Network(_))
    }
}
