#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pwa_webhooks::{
    Dispatcher, DispatcherConfig, FailureReason, OutboundRequest, SqliteStore, Store, Transport,
    TransportResponse,
};

/// What the fake endpoint does with the next request.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16),
    Fail(FailureReason),
    /// Never answer; the subscription timeout has to fire.
    Hang,
}

/// Transport that answers from a script and records every request.
///
/// Once the script runs out every request gets a 200.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<OutboundRequest>>,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = Reply>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Default::default()
        })
    }

    /// Answers 200 to everything.
    pub fn always_ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn statuses(statuses: &[u16]) -> Arc<Self> {
        Self::new(statuses.iter().copied().map(Reply::Status))
    }

    /// Every response takes `delay` to arrive.
    pub fn slow(statuses: &[u16], delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(statuses.iter().copied().map(Reply::Status).collect()),
            delay,
            ..Default::default()
        })
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: OutboundRequest) -> Result<TransportResponse, FailureReason> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        self.requests.lock().unwrap().push(request);
        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Status(200));

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match reply {
            Reply::Status(status) => Ok(TransportResponse::new(status, format!("status {status}"))),
            Reply::Fail(reason) => Err(reason),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(TransportResponse::new(200, ""))
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        retry_base: Duration::from_millis(10),
        tick_interval: Duration::from_millis(25),
        max_response_body: 10_000,
    }
}

pub fn memory_store() -> Arc<dyn Store> {
    Arc::new(SqliteStore::open_in_memory().unwrap())
}

pub fn dispatcher(transport: Arc<ScriptedTransport>) -> Dispatcher {
    Dispatcher::new(fast_config(), memory_store(), transport)
}

/// Poll until the queue, the in-flight send and every retry timer are done.
pub async fn wait_idle(dispatcher: &Dispatcher) {
    for _ in 0..500 {
        if dispatcher.is_idle().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("dispatcher did not go idle");
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
