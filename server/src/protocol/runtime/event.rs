use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::model::{Envelope, NodeId};

use super::lifecycle::{RuntimeState, ShutdownStep, StartupStep};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeEventKind {
    Sent,
    Received,
    Completed,
    Scheduled,
    DeadLettered,
}

/// A snapshot of an envelope taken at one point of its lifecycle on one node.
#[derive(Debug, Clone)]
pub struct EnvelopeEvent {
    pub kind: EnvelopeEventKind,
    pub node_id: NodeId,
    pub service_name: Arc<str>,
    pub envelope: Envelope,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum RuntimeEvent {
    Envelope(EnvelopeEvent),
    Startup { node_id: NodeId, step: StartupStep },
    Shutdown { node_id: NodeId, step: ShutdownStep },
    StateChanged { node_id: NodeId, state: RuntimeState },
}

impl RuntimeEvent {
    pub fn as_envelope_event(&self) -> Option<&EnvelopeEvent> {
        match self {
            RuntimeEvent::Envelope(event) => Some(event),
            _ => None,
        }
    }
}

/// Event sinks attached to a runtime; closed sinks are dropped on the next emit.
#[derive(Debug, Default)]
pub(crate) struct Observers {
    sinks: Mutex<Vec<flume::Sender<RuntimeEvent>>>,
}

impl Observers {
    pub(crate) fn attach(&self, sink: flume::Sender<RuntimeEvent>) {
        self.sinks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sink);
    }
    pub(crate) fn emit(&self, event: RuntimeEvent) {
        let mut sinks = self.sinks.lock().unwrap_or_else(PoisonError::into_inner);
        if sinks.is_empty() {
            return;
        }
        sinks.retain(|sink| sink.send(event.clone()).is_ok());
    }
}
