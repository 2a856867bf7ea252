use std::sync::Arc;

use tracing::info;

use crate::bus::EventBus;
use crate::config::AppConfig;
use crate::dispatcher::Dispatcher;
use crate::error::WebhookResult;
use crate::store::{SqliteStore, Store};
use crate::transport::Transport;

/// Explicitly wired application services.
///
/// Construct once at startup and pass by reference; there is no global
/// registry of singletons.
pub struct AppContext {
    pub store: Arc<dyn Store>,
    pub bus: EventBus,
    pub webhooks: Dispatcher,
}

impl AppContext {
    /// Open the configured store and deliver over HTTP.
    #[cfg(feature = "http")]
    pub fn open(config: AppConfig) -> WebhookResult<Self> {
        Self::with_transport(config, Arc::new(crate::transport::HttpTransport::new()))
    }

    /// Open the configured store with a caller-supplied transport.
    pub fn with_transport(config: AppConfig, transport: Arc<dyn Transport>) -> WebhookResult<Self> {
        let store: Arc<dyn Store> = match &config.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(SqliteStore::open_in_memory()?),
        };
        Ok(Self::from_parts(config, store, transport))
    }

    /// Wire services around an already opened store.
    pub fn from_parts(config: AppConfig, store: Arc<dyn Store>, transport: Arc<dyn Transport>) -> Self {
        let bus = EventBus::default();
        let mut webhooks = Dispatcher::new_with_bus(config.dispatcher, store.clone(), transport, bus.clone());
        webhooks.listen(&bus);

        info!(
            database = ?config.database_path,
            "Application context ready"
        );

        Self { store, bus, webhooks }
    }

    pub async fn shutdown(&mut self) {
        self.webhooks.shutdown().await;
    }
}
