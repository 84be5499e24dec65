pub mod config;
mod delivery;
pub mod event;
pub mod lifecycle;

use std::{
    collections::BTreeSet,
    ops::Deref,
    sync::{Arc, PoisonError},
    time::Duration,
};

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::Instrument;

use crate::{
    handler::{HandlerTable, HandlerTableBuilder},
    model::{
        codec::CodecError,
        control::{
            AssignWork, AssignWorkMessage, HeartbeatMessage, NodeHeartbeat, Ping,
            PongMessage, ReleaseWork, ReleaseWorkMessage,
        },
        message::json::Json,
        Address, Envelope, EnvelopeId, Message, MessageCodec, NodeId, NodeRecord,
    },
    protocol::{
        control,
        durable::{DurableService, MemoryDurable},
        reply::ReplyTracker,
        router::Router,
        scheduler::{DurableScheduler, ScheduledJobs},
        transport::{FrameReceiver, LocalTransport, TransportService},
    },
};

pub use config::RuntimeConfig;
pub use event::{EnvelopeEvent, EnvelopeEventKind, RuntimeEvent};
pub use lifecycle::{Health, RuntimeState, ShutdownStep, StartupStep};

use event::Observers;

#[derive(Debug)]
struct Listener {
    address: Address,
    task: tokio::task::JoinHandle<FrameReceiver>,
}

#[derive(Debug, Default)]
struct Background {
    scheduler: Option<tokio::task::JoinHandle<()>>,
    heartbeat: Option<tokio::task::JoinHandle<()>>,
}

pub struct RuntimeInner {
    config: RuntimeConfig,
    service_name: Arc<str>,
    durable: DurableService,
    transport: TransportService,
    router: Router,
    handlers: HandlerTable,
    replies: ReplyTracker,
    /// in-memory timers of non-durable envelopes
    jobs: ScheduledJobs,
    state: watch::Sender<RuntimeState>,
    health: watch::Sender<Health>,
    observers: Observers,
    assignments: std::sync::Mutex<BTreeSet<String>>,
    /// spawned handler tasks
    in_flight: TaskTracker,
    /// cancelled first on shutdown, stops listeners and heartbeats
    accepting: CancellationToken,
    /// cancelled after transports are gone, stops the durable scheduler
    durability: CancellationToken,
    listeners: tokio::sync::Mutex<Vec<Listener>>,
    background: tokio::sync::Mutex<Background>,
    /// serializes start and stop
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RuntimeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInner")
            .field("node_id", &self.config.node_id)
            .field("service_name", &self.service_name)
            .field("state", &*self.state.borrow())
            .field("durable", &self.durable)
            .field("transport", &self.transport)
            .field("handlers", &self.handlers)
            .finish()
    }
}

/// A weak handle, it does not keep the runtime alive.
#[derive(Debug, Clone, Default)]
pub struct RuntimeRef {
    inner: std::sync::Weak<RuntimeInner>,
}

impl RuntimeRef {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

/// One node of the messaging core.
///
/// Cheap to clone; every clone drives the same node.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.id())
            .field("service_name", &self.service_name())
            .field("state", &self.state())
            .finish()
    }
}

impl Deref for Runtime {
    type Target = RuntimeInner;
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Runtime {
    /// Create a runtime, it must be called inside a tokio runtime.
    ///
    /// The built-in control handlers are merged into `handlers`.
    pub fn new(config: RuntimeConfig, handlers: HandlerTableBuilder) -> Self {
        let durable = config
            .durable
            .clone()
            .unwrap_or_else(|| DurableService::new(MemoryDurable::new()));
        let transport = config
            .transport
            .clone()
            .unwrap_or_else(|| TransportService::new(LocalTransport::new()));
        let inner = Arc::new_cyclic(|weak| {
            let runtime_ref = RuntimeRef {
                inner: weak.clone(),
            };
            let handlers =
                control::register_control_handlers(handlers, config.node_id, runtime_ref).build();
            RuntimeInner {
                service_name: Arc::from(config.service_name.as_str()),
                router: Router::new(transport.clone()),
                jobs: ScheduledJobs::new(config.local_scheduler_tick),
                durable,
                transport,
                handlers,
                replies: ReplyTracker::new(),
                state: watch::Sender::new(RuntimeState::Created),
                health: watch::Sender::new(Health::Healthy),
                observers: Observers::default(),
                assignments: Default::default(),
                in_flight: TaskTracker::new(),
                accepting: CancellationToken::new(),
                durability: CancellationToken::new(),
                listeners: Default::default(),
                background: Default::default(),
                lifecycle: Default::default(),
                config,
            }
        });
        Self { inner }
    }
    #[inline]
    pub fn id(&self) -> NodeId {
        self.config.node_id
    }
    pub fn service_name(&self) -> &str {
        &self.service_name
    }
    /// `control://{node_id}` of this node.
    pub fn control_address(&self) -> Address {
        self.id().control_address()
    }
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }
    pub fn durable(&self) -> &DurableService {
        &self.durable
    }
    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }
    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }
    pub fn watch_state(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }
    pub fn health(&self) -> Health {
        *self.health.borrow()
    }
    pub fn watch_health(&self) -> watch::Receiver<Health> {
        self.health.subscribe()
    }
    /// Number of reply waiters not yet resolved.
    pub fn pending_replies(&self) -> usize {
        self.replies.pending()
    }
    /// Attach an event sink. Events are pushed synchronously, so the channel should be unbounded.
    pub fn observe(&self, sink: flume::Sender<RuntimeEvent>) {
        self.observers.attach(sink);
    }
    pub fn subscribe(&self) -> flume::Receiver<RuntimeEvent> {
        let (sink, events) = flume::unbounded();
        self.observe(sink);
        events
    }
    /// Work ids currently assigned to this node.
    pub fn assignments(&self) -> Vec<String> {
        self.assignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
    pub(crate) fn set_assignment(&self, work_id: String, assigned: bool) {
        let mut assignments = self
            .assignments
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if assigned {
            assignments.insert(work_id);
        } else {
            assignments.remove(&work_id);
        }
    }
    pub fn runtime_ref(&self) -> RuntimeRef {
        RuntimeRef {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn set_state(&self, state: RuntimeState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(node = %self.id(), %previous, %state, "runtime state changed");
            self.observers.emit(RuntimeEvent::StateChanged {
                node_id: self.id(),
                state,
            });
        }
    }
    pub(crate) fn ensure_running(&self, context: &'static str) -> crate::Result<()> {
        match self.state() {
            RuntimeState::Running => Ok(()),
            RuntimeState::Created | RuntimeState::Starting => Err(crate::Error::new(
                context,
                crate::error::ErrorKind::InvalidState("runtime not started".into()),
            )),
            RuntimeState::Stopping | RuntimeState::Stopped => {
                Err(crate::Error::runtime_stopped(context))
            }
        }
    }

    /// Register the node, start listening and start the durable scheduler.
    ///
    /// Starting a running runtime does nothing; a stopped runtime cannot be started again.
    #[tracing::instrument(skip_all, fields(node = %self.id(), service = %self.service_name()))]
    pub async fn start(&self) -> crate::Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            RuntimeState::Created => {}
            RuntimeState::Running => return Ok(()),
            state => {
                return Err(crate::Error::new(
                    "start runtime",
                    crate::error::ErrorKind::InvalidState(format!("runtime is {state}")),
                ))
            }
        }
        self.set_state(RuntimeState::Starting);
        for step in StartupStep::ORDER {
            if let Err(e) = self.startup_step(step).await {
                tracing::error!(?step, error = %e, "startup failed, shutting down");
                self.shutdown_sequence().await;
                return Err(e);
            }
            tracing::debug!(?step, "startup step done");
            self.observers.emit(RuntimeEvent::Startup {
                node_id: self.id(),
                step,
            });
        }
        self.set_state(RuntimeState::Running);
        tracing::info!("runtime started");
        Ok(())
    }

    async fn startup_step(&self, step: StartupStep) -> crate::Result<()> {
        match step {
            StartupStep::RegisterNode => {
                let record = NodeRecord::new(self.id(), self.service_name());
                self.with_storage("register node", || {
                    self.durable.register_node(record.clone())
                })
                .await?;
            }
            StartupStep::StartEndpoints => {
                for address in self.config.listen.clone() {
                    self.router.resolve(&address)?;
                    self.start_listener(address).await?;
                }
            }
            StartupStep::StartControlChannel => {
                self.start_listener(self.control_address()).await?;
            }
            StartupStep::StartScheduler => {
                DurableScheduler::recover(self).await?;
                let scheduler = DurableScheduler::new(
                    self.runtime_ref(),
                    self.config.scheduler.clone(),
                    self.durability.child_token(),
                );
                let mut background = self.background.lock().await;
                background.scheduler = Some(scheduler.spawn());
                if let Some(interval) = self.config.heartbeat_interval {
                    background.heartbeat = Some(tokio::spawn(heartbeat_loop(
                        self.runtime_ref(),
                        interval,
                        self.accepting.child_token(),
                    )));
                }
            }
        }
        Ok(())
    }

    async fn start_listener(&self, address: Address) -> crate::Result<()> {
        let frames = self
            .transport
            .listen(&address)
            .await
            .map_err(crate::Error::contextual("listen"))?;
        let span = tracing::info_span!("listener", node = %self.id(), %address);
        let task = tokio::spawn(
            listen_loop(self.runtime_ref(), frames, self.accepting.child_token()).instrument(span),
        );
        tracing::debug!(%address, "listening");
        self.listeners.lock().await.push(Listener { address, task });
        Ok(())
    }

    /// Shut the runtime down, running every [`ShutdownStep`] in order.
    ///
    /// Stopping a stopped runtime returns immediately, a concurrent call waits for the first one.
    #[tracing::instrument(skip_all, fields(node = %self.id(), service = %self.service_name()))]
    pub async fn stop(&self) -> crate::Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        match self.state() {
            RuntimeState::Stopped => return Ok(()),
            RuntimeState::Created => {
                self.jobs.release().await;
                self.replies.release_all();
                self.set_state(RuntimeState::Stopped);
                return Ok(());
            }
            _ => {}
        }
        self.shutdown_sequence().await;
        tracing::info!("runtime stopped");
        Ok(())
    }

    async fn shutdown_sequence(&self) {
        for step in ShutdownStep::ORDER {
            self.shutdown_step(step).await;
            tracing::debug!(?step, "shutdown step done");
            self.observers.emit(RuntimeEvent::Shutdown {
                node_id: self.id(),
                step,
            });
        }
        self.set_state(RuntimeState::Stopped);
    }

    async fn shutdown_step(&self, step: ShutdownStep) {
        match step {
            ShutdownStep::StopAcceptingWork => {
                self.set_state(RuntimeState::Stopping);
                self.accepting.cancel();
                let heartbeat = self.background.lock().await.heartbeat.take();
                if let Some(heartbeat) = heartbeat {
                    if let Err(e) = heartbeat.await {
                        tracing::warn!(?e, "heartbeat task exited abnormally");
                    }
                }
            }
            ShutdownStep::ReleaseReplyWaiters => {
                self.replies.release_all();
            }
            ShutdownStep::DrainInFlight => {
                self.in_flight.close();
                let grace = self.config.shutdown_grace;
                if tokio::time::timeout(grace, self.in_flight.wait())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        remaining = self.in_flight.len(),
                        ?grace,
                        "in-flight handlers did not finish in time"
                    );
                }
            }
            ShutdownStep::DisposeEndpoints => {
                let listeners = std::mem::take(&mut *self.listeners.lock().await);
                for Listener { address, task } in listeners {
                    let frames = task.await;
                    self.transport.unlisten(&address).await;
                    match frames {
                        Ok(frames) => self.park_unread_frames(&address, frames).await,
                        Err(e) => tracing::warn!(?e, %address, "listener exited abnormally"),
                    }
                }
            }
            ShutdownStep::DisposeTransports => {
                self.transport.dispose().await;
            }
            ShutdownStep::CancelDurability => {
                self.durability.cancel();
            }
            ShutdownStep::AwaitScheduler => {
                let scheduler = self.background.lock().await.scheduler.take();
                if let Some(scheduler) = scheduler {
                    if let Err(e) = scheduler.await {
                        tracing::warn!(?e, "scheduler exited abnormally");
                    }
                }
            }
            ShutdownStep::ReleaseTimers => {
                self.jobs.release().await;
            }
            ShutdownStep::DeregisterNode => {
                let id = self.id();
                if let Err(e) = self
                    .with_storage("unregister node", || self.durable.unregister_node(id))
                    .await
                {
                    tracing::warn!(error = %e, "node left registered");
                }
            }
        }
    }

    /// Send `envelope`, or schedule it if its scheduled time lies ahead.
    ///
    /// Durable envelopes are in the outbox when this returns.
    pub async fn send(&self, envelope: Envelope) -> crate::Result<EnvelopeId> {
        self.ensure_running("send")?;
        self.submit(envelope).await
    }
    pub async fn send_message<M: Message>(
        &self,
        message: M,
        destination: Address,
    ) -> crate::Result<EnvelopeId> {
        let envelope = message
            .into_envelope(destination)
            .map_err(crate::Error::contextual("encode message"))?;
        self.send(envelope).await
    }
    /// Send a request and wait for the envelope answering it.
    pub async fn send_and_await(
        &self,
        mut envelope: Envelope,
        timeout: Duration,
    ) -> crate::Result<Envelope> {
        self.ensure_running("send and await")?;
        let correlation_id = *envelope.correlation_id.get_or_insert(envelope.id);
        envelope.reply_to = Some(self.control_address());
        let handle = self
            .replies
            .register(correlation_id, tokio::time::Instant::now() + timeout)?;
        if let Err(e) = self.submit(envelope).await {
            self.replies.cancel(correlation_id);
            return Err(e);
        }
        handle.await
    }
    /// Typed request/reply with the configured reply timeout.
    pub async fn invoke<M: Message, R: Message>(
        &self,
        message: M,
        destination: Address,
    ) -> crate::Result<R> {
        self.invoke_with_timeout(message, destination, self.config.reply_timeout)
            .await
    }
    pub async fn invoke_with_timeout<M: Message, R: Message>(
        &self,
        message: M,
        destination: Address,
        timeout: Duration,
    ) -> crate::Result<R> {
        let envelope = message
            .into_envelope(destination)
            .map_err(crate::Error::contextual("encode request"))?;
        let reply = self.send_and_await(envelope, timeout).await?;
        decode_reply(reply)
    }
    /// Round trip of a ping over the control channel of `node`.
    pub async fn ping(&self, node: NodeId, timeout: Duration) -> crate::Result<Duration> {
        let started = tokio::time::Instant::now();
        let pong: PongMessage = self
            .invoke_with_timeout(
                Json(Ping {
                    sent_at: Utc::now(),
                }),
                node.control_address(),
                timeout,
            )
            .await?;
        let elapsed = started.elapsed();
        tracing::debug!(peer = %pong.0.node_id, ?elapsed, "pong");
        Ok(elapsed)
    }
    /// Ask `node` to take over `work_id`.
    pub async fn assign_work(
        &self,
        node: NodeId,
        work_id: impl Into<String>,
    ) -> crate::Result<EnvelopeId> {
        let message: AssignWorkMessage = Json(AssignWork {
            work_id: work_id.into(),
        });
        self.send_message(message, node.control_address()).await
    }
    /// Ask `node` to give up `work_id`.
    pub async fn release_work(
        &self,
        node: NodeId,
        work_id: impl Into<String>,
    ) -> crate::Result<EnvelopeId> {
        let message: ReleaseWorkMessage = Json(ReleaseWork {
            work_id: work_id.into(),
        });
        self.send_message(message, node.control_address()).await
    }

    /// Record our own heartbeat and send one to every registered peer.
    async fn beat(&self) {
        if !self.state().is_running() {
            return;
        }
        let id = self.id();
        let now = Utc::now();
        if let Err(e) = self
            .with_storage("record heartbeat", || self.durable.heartbeat(id, now))
            .await
        {
            tracing::warn!(error = %e, "heartbeat not recorded");
            return;
        }
        let peers = match self.with_storage("list nodes", || self.durable.nodes()).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(error = %e, "node registry unavailable");
                return;
            }
        };
        for peer in peers.into_iter().filter(|peer| peer.node_id != id) {
            let message: HeartbeatMessage = Json(NodeHeartbeat {
                node_id: id,
                service_name: self.service_name().to_owned(),
                time: now,
            });
            if let Err(e) = self.send_message(message, peer.control_address).await {
                tracing::debug!(peer = %peer.node_id, error = %e, "heartbeat not sent");
            }
        }
    }
}

fn decode_reply<R: Message>(reply: Envelope) -> crate::Result<R> {
    if reply.message_type != R::MESSAGE_TYPE {
        return Err(crate::Error::new(
            "decode reply",
            CodecError::new(format!(
                "expected reply of type {}, got {}",
                R::MESSAGE_TYPE,
                reply.message_type
            )),
        ));
    }
    <R as MessageCodec>::from_bytes(reply.payload().clone())
        .ok_or_else(|| crate::Error::new("decode reply", CodecError::new("malformed reply payload")))
}

async fn listen_loop(
    runtime: RuntimeRef,
    frames: FrameReceiver,
    accepting: CancellationToken,
) -> FrameReceiver {
    loop {
        let frame = tokio::select! {
            _ = accepting.cancelled() => break,
            frame = frames.recv_async() => frame,
        };
        let Ok(frame) = frame else {
            tracing::debug!("transport closed the listener");
            break;
        };
        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        runtime.accept_frame(frame);
    }
    frames
}

async fn heartbeat_loop(runtime: RuntimeRef, interval: Duration, ct: CancellationToken) {
    loop {
        tokio::select! {
            _ = ct.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        let Some(runtime) = runtime.upgrade() else {
            break;
        };
        runtime.beat().await;
    }
}
