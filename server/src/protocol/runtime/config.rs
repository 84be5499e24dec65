use std::time::Duration;

use crate::{
    model::{codec::CodecKind, Address, NodeId},
    protocol::{
        durable::DurableService,
        scheduler::{RetryPolicy, SchedulerConfig},
        transport::TransportService,
    },
};

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub node_id: NodeId,
    /// Role label of this node, carried in the registry and in tracking records.
    pub service_name: String,
    /// Store of this node, a private [`MemoryDurable`](crate::protocol::durable::MemoryDurable)
    /// when unset.
    pub durable: Option<DurableService>,
    /// Transport of this node, a private [`LocalTransport`](crate::protocol::transport::LocalTransport)
    /// when unset.
    pub transport: Option<TransportService>,
    /// Endpoint addresses listened on besides the control address.
    pub listen: Vec<Address>,
    /// Codec used for outgoing frames, inbound frames carry their own codec kind.
    pub codec: CodecKind,
    pub scheduler: SchedulerConfig,
    /// Retry of store calls before `StorageUnavailable` is reported.
    pub storage_retry: RetryPolicy,
    /// Default timeout of [`Runtime::invoke`](crate::protocol::runtime::Runtime::invoke).
    pub reply_timeout: Duration,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
    /// Send heartbeats to every registered peer at this interval.
    pub heartbeat_interval: Option<Duration>,
    /// Resolution of the in-memory timers.
    pub local_scheduler_tick: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::snowflake(),
            service_name: String::from("courier"),
            durable: None,
            transport: None,
            listen: Vec::new(),
            codec: CodecKind::default(),
            scheduler: SchedulerConfig::default(),
            storage_retry: RetryPolicy::storage_default(),
            reply_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
            heartbeat_interval: None,
            local_scheduler_tick: Duration::from_millis(100),
        }
    }
}

impl RuntimeConfig {
    pub fn new(node_id: NodeId, service_name: impl Into<String>) -> Self {
        Self {
            node_id,
            service_name: service_name.into(),
            ..Default::default()
        }
    }
    pub fn with_durable(mut self, durable: DurableService) -> Self {
        self.durable = Some(durable);
        self
    }
    pub fn with_transport(mut self, transport: TransportService) -> Self {
        self.transport = Some(transport);
        self
    }
    pub fn listen_on(mut self, address: Address) -> Self {
        self.listen.push(address);
        self
    }
    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }
    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.scheduler.retry = retry;
        self
    }
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.scheduler.poll_interval = poll_interval;
        self
    }
    pub fn with_inbox_retention(mut self, inbox_retention: Duration) -> Self {
        self.scheduler.inbox_retention = inbox_retention;
        self
    }
    pub fn with_storage_retry(mut self, storage_retry: RetryPolicy) -> Self {
        self.storage_retry = storage_retry;
        self
    }
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }
    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }
    pub fn with_heartbeat_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = Some(heartbeat_interval);
        self
    }
}
