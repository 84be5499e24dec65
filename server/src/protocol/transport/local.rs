use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use bytes::Bytes;

use crate::model::Address;

use super::{FrameReceiver, Transport, TransportError, TransportErrorKind};

/// An in-process network shared by every [`LocalTransport`] created from it.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    routes: Arc<RwLock<HashMap<Address, flume::Sender<Bytes>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
    /// Attach a new transport to this bus.
    pub fn transport(&self) -> LocalTransport {
        LocalTransport {
            bus: self.clone(),
            closed: AtomicBool::new(false),
            listening: Default::default(),
        }
    }
    /// Addresses currently listened on.
    pub fn addresses(&self) -> Vec<Address> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
    fn route(&self, address: &Address) -> Option<flume::Sender<Bytes>> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }
}

/// Transport over a [`LocalBus`], serving the `control` and `local` schemes.
#[derive(Debug)]
pub struct LocalTransport {
    bus: LocalBus,
    closed: AtomicBool,
    listening: std::sync::Mutex<HashSet<Address>>,
}

impl Default for LocalTransport {
    fn default() -> Self {
        LocalBus::new().transport()
    }
}

impl LocalTransport {
    pub const LOCAL_SCHEME: &'static str = "local";
    pub fn new() -> Self {
        Self::default()
    }
    pub fn bus(&self) -> &LocalBus {
        &self.bus
    }
    fn ensure_open(&self, context: &'static str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::new(context, TransportErrorKind::Closed))
        } else {
            Ok(())
        }
    }
}

impl Transport for LocalTransport {
    fn accepts(&self, address: &Address) -> bool {
        matches!(address.scheme(), Address::CONTROL_SCHEME | Self::LOCAL_SCHEME)
    }

    async fn send(&self, address: &Address, frame: Bytes) -> Result<(), TransportError> {
        self.ensure_open("send")?;
        if !Transport::accepts(self, address) {
            return Err(TransportError::new(
                address.to_string(),
                TransportErrorKind::Unsupported,
            ));
        }
        let Some(sender) = self.bus.route(address) else {
            return Err(TransportError::new(
                address.to_string(),
                TransportErrorKind::Unreachable,
            ));
        };
        sender
            .send_async(frame)
            .await
            .map_err(|_| TransportError::new(address.to_string(), TransportErrorKind::Unreachable))
    }

    async fn listen(&self, address: &Address) -> Result<FrameReceiver, TransportError> {
        self.ensure_open("listen")?;
        if !Transport::accepts(self, address) {
            return Err(TransportError::new(
                address.to_string(),
                TransportErrorKind::Unsupported,
            ));
        }
        let mut routes = self
            .bus
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if routes
            .get(address)
            .is_some_and(|sender| !sender.is_disconnected())
        {
            return Err(TransportError::new(
                address.to_string(),
                TransportErrorKind::AddressInUse,
            ));
        }
        let (sender, receiver) = flume::unbounded();
        routes.insert(address.clone(), sender);
        self.listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(address.clone());
        tracing::debug!(%address, "local transport listening");
        Ok(receiver)
    }

    async fn unlisten(&self, address: &Address) {
        let owned = self
            .listening
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        if owned {
            self.bus
                .routes
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(address);
            tracing::debug!(%address, "local transport stopped listening");
        }
    }

    async fn dispose(&self) {
        self.closed.store(true, Ordering::Release);
        let addresses = std::mem::take(
            &mut *self
                .listening
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let mut routes = self
            .bus
            .routes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for address in addresses {
            routes.remove(&address);
        }
    }
}
