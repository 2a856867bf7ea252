use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{WebhookError, WebhookResult};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay before the first retry; doubles for each further retry.
    pub retry_base: Duration,
    /// How often an idle drain loop is nudged when work is queued.
    pub tick_interval: Duration,
    /// Response bodies longer than this many bytes are truncated before storing.
    pub max_response_body: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry_base: Duration::from_millis(5_000),
            tick_interval: Duration::from_millis(1_000),
            max_response_body: 10_000,
        }
    }
}

/// Everything needed to build an [`AppContext`](crate::AppContext).
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// SQLite file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    pub dispatcher: DispatcherConfig,
}

impl AppConfig {
    /// Defaults overridden by environment variables:
    ///
    /// - `WEBHOOK_DB_PATH`
    /// - `WEBHOOK_RETRY_BASE_MS`
    /// - `WEBHOOK_TICK_INTERVAL_MS`
    /// - `WEBHOOK_MAX_RESPONSE_BODY`
    pub fn from_env() -> WebhookResult<Self> {
        let mut config = Self::default();

        if let Some(path) = env::var_os("WEBHOOK_DB_PATH") {
            config.database_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = get_env_parse::<u64>("WEBHOOK_RETRY_BASE_MS")? {
            config.dispatcher.retry_base = Duration::from_millis(ms);
        }
        if let Some(ms) = get_env_parse::<u64>("WEBHOOK_TICK_INTERVAL_MS")? {
            if ms == 0 {
                return Err(WebhookError::Configuration(
                    "WEBHOOK_TICK_INTERVAL_MS must be greater than zero".to_string(),
                ));
            }
            config.dispatcher.tick_interval = Duration::from_millis(ms);
        }
        if let Some(bytes) = get_env_parse::<usize>("WEBHOOK_MAX_RESPONSE_BODY")? {
            config.dispatcher.max_response_body = bytes;
        }

        Ok(config)
    }
}

fn get_env_parse<T>(name: &str) -> WebhookResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| WebhookError::Configuration(format!("Invalid value for {}: {}", name, e))),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(WebhookError::Configuration(format!("Invalid value for {}: {}", name, e))),
    }
}
