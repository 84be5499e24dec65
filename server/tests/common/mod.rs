#![allow(dead_code)]
use std::{
    future::Future,
    str::FromStr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use courier::prelude::*;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                tracing_subscriber::filter::EnvFilter::from_default_env()
                    .add_directive(tracing_subscriber::filter::Directive::from_str("info").unwrap())
                    .add_directive(
                        tracing_subscriber::filter::Directive::from_str("courier=debug").unwrap(),
                    ),
            ),
        )
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub value: u32,
}

impl MessageAttribute for Command {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("test/command");
}

/// Same as [`Command`] but never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub value: u32,
}

impl MessageAttribute for Notice {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("test/notice");
    const DURABLE: bool = false;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    pub value: u32,
}

impl MessageAttribute for Query {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("test/query");
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub value: u32,
}

impl MessageAttribute for QueryResult {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("test/result");
}

#[derive(Debug)]
pub struct TestFailure(pub &'static str);

impl std::fmt::Display for TestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for TestFailure {}

/// A config with short intervals, attached to `bus` with a fresh transport.
pub fn test_config(bus: &LocalBus, index: u64, service_name: &str) -> RuntimeConfig {
    RuntimeConfig {
        local_scheduler_tick: Duration::from_millis(10),
        ..RuntimeConfig::new(NodeId::new_indexed(index), service_name)
    }
    .with_transport(TransportService::new(bus.transport()))
    .with_poll_interval(Duration::from_millis(20))
    .with_retry(
        RetryPolicy::new(3, Duration::from_millis(20)).with_max_backoff(Duration::from_millis(100)),
    )
    .with_storage_retry(RetryPolicy::new(3, Duration::from_millis(5)))
    .with_reply_timeout(Duration::from_secs(5))
    .with_shutdown_grace(Duration::from_secs(2))
}

pub fn memory_store() -> DurableService {
    DurableService::new(MemoryDurable::new())
}

pub fn memory(store: &DurableService) -> &MemoryDurable {
    store
        .downcast_ref::<MemoryDurable>()
        .expect("memory store")
}

#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicUsize>);

impl Counter {
    pub fn incr(&self) -> usize {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
