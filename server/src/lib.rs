//! A durable multi-node messaging core.
//!
//! Every [`Runtime`](protocol::runtime::Runtime) is one node: it listens on its control address
//! `control://{node_id}`, persists durable envelopes in an outbox and an inbox, redelivers
//! failed envelopes with backoff and shuts down in a fixed order.
pub mod error;
pub mod handler;
pub mod protocol;

pub use bytes;
pub use courier_model as model;
pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::error::{Error, ErrorKind};
    pub use crate::handler::{Handler, HandlerFailure, HandlerTable, HandlerTableBuilder};
    pub use crate::model::control::*;
    pub use crate::model::message::json::Json;
    pub use crate::model::*;
    pub use crate::protocol::durable::{
        Durable, DurableError, DurableRecord, DurableService, MemoryDurable, PersistOutcome,
        QueueKind, TransitionOutcome,
    };
    pub use crate::protocol::runtime::{
        EnvelopeEvent, EnvelopeEventKind, Health, Runtime, RuntimeConfig, RuntimeEvent,
        RuntimeRef, RuntimeState, ShutdownStep, StartupStep,
    };
    pub use crate::protocol::scheduler::{DurableScheduler, RetryPolicy, SchedulerConfig};
    pub use crate::protocol::transport::{
        LocalBus, LocalTransport, Transport, TransportError, TransportService,
    };
}
