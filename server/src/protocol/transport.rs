pub mod local;

use std::{any::TypeId, borrow::Cow, future::Future, sync::Arc};

use bytes::Bytes;

use crate::model::Address;

pub use local::{LocalBus, LocalTransport};

/// Frames delivered to one listening address.
pub type FrameReceiver = flume::Receiver<Bytes>;

#[derive(Debug)]
pub struct TransportError {
    pub context: Cow<'static, str>,
    pub kind: TransportErrorKind,
}

#[derive(Debug)]
pub enum TransportErrorKind {
    /// Nobody listens on the address.
    Unreachable,
    /// The address is already taken by another listener.
    AddressInUse,
    /// The scheme is not served by this transport.
    Unsupported,
    /// The transport was disposed.
    Closed,
    Underlying(Box<dyn std::error::Error + Send + Sync>),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transport error: {}, ", self.context)?;
        match &self.kind {
            TransportErrorKind::Unreachable => write!(f, "unreachable"),
            TransportErrorKind::AddressInUse => write!(f, "address in use"),
            TransportErrorKind::Unsupported => write!(f, "unsupported address"),
            TransportErrorKind::Closed => write!(f, "closed"),
            TransportErrorKind::Underlying(e) => write!(f, "underlying error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            TransportErrorKind::Underlying(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl TransportError {
    pub fn new(context: impl Into<Cow<'static, str>>, kind: TransportErrorKind) -> Self {
        Self {
            context: context.into(),
            kind,
        }
    }
    pub fn underlying(
        context: impl Into<Cow<'static, str>>,
    ) -> impl FnOnce(Box<dyn std::error::Error + Send + Sync>) -> Self {
        move |e| Self::new(context, TransportErrorKind::Underlying(e))
    }
}

/// Moves encoded frames between addresses.
pub trait Transport: Send + Sync + 'static {
    /// Whether `address` can be served by this transport.
    fn accepts(&self, address: &Address) -> bool;
    fn send(
        &self,
        address: &Address,
        frame: Bytes,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
    /// Start receiving frames sent to `address`.
    fn listen(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<FrameReceiver, TransportError>> + Send;
    /// Stop receiving on `address`; frames not yet taken from the receiver stay there.
    fn unlisten(&self, address: &Address) -> impl Future<Output = ()> + Send;
    /// Release the transport, later sends fail with [`TransportErrorKind::Closed`].
    fn dispose(&self) -> impl Future<Output = ()> + Send;
}

#[derive(Clone)]
pub struct TransportService {
    provider: Cow<'static, str>,
    provider_type: TypeId,
    inner: Arc<dyn sealed::TransportObjectTrait>,
}

impl std::fmt::Debug for TransportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportService")
            .field("provider", &self.provider)
            .finish()
    }
}

impl TransportService {
    pub fn new<T: Transport>(inner: T) -> Self {
        Self {
            provider: std::any::type_name::<T>().into(),
            provider_type: TypeId::of::<T>(),
            inner: Arc::new(inner),
        }
    }
    pub fn downcast_ref<T: Transport>(&self) -> Option<&T> {
        if self.provider_type == TypeId::of::<T>() {
            // SAFETY: the type id matches the concrete type stored in `inner`
            unsafe {
                Some(&*(self.inner.as_ref() as *const dyn sealed::TransportObjectTrait as *const T))
            }
        } else {
            None
        }
    }
    #[inline(always)]
    pub fn accepts(&self, address: &Address) -> bool {
        self.inner.accepts(address)
    }
    #[inline(always)]
    pub async fn send(&self, address: &Address, frame: Bytes) -> Result<(), TransportError> {
        self.inner.send(address, frame).await
    }
    #[inline(always)]
    pub async fn listen(&self, address: &Address) -> Result<FrameReceiver, TransportError> {
        self.inner.listen(address).await
    }
    #[inline(always)]
    pub async fn unlisten(&self, address: &Address) {
        self.inner.unlisten(address).await
    }
    #[inline(always)]
    pub async fn dispose(&self) {
        self.inner.dispose().await
    }
}

mod sealed {
    use std::{future::Future, pin::Pin};

    use bytes::Bytes;

    use crate::model::Address;

    use super::{FrameReceiver, Transport, TransportError};

    type Boxed<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

    pub(super) trait TransportObjectTrait: Send + Sync + 'static {
        fn accepts(&self, address: &Address) -> bool;
        fn send<'a>(&'a self, address: &'a Address, frame: Bytes)
            -> Boxed<'a, Result<(), TransportError>>;
        fn listen<'a>(&'a self, address: &'a Address) -> Boxed<'a, Result<FrameReceiver, TransportError>>;
        fn unlisten<'a>(&'a self, address: &'a Address) -> Boxed<'a, ()>;
        fn dispose(&self) -> Boxed<'_, ()>;
    }

    impl<T: Transport> TransportObjectTrait for T {
        #[inline(always)]
        fn accepts(&self, address: &Address) -> bool {
            Transport::accepts(self, address)
        }
        #[inline(always)]
        fn send<'a>(
            &'a self,
            address: &'a Address,
            frame: Bytes,
        ) -> Boxed<'a, Result<(), TransportError>> {
            Box::pin(Transport::send(self, address, frame))
        }
        #[inline(always)]
        fn listen<'a>(
            &'a self,
            address: &'a Address,
        ) -> Boxed<'a, Result<FrameReceiver, TransportError>> {
            Box::pin(Transport::listen(self, address))
        }
        #[inline(always)]
        fn unlisten<'a>(&'a self, address: &'a Address) -> Boxed<'a, ()> {
            Box::pin(Transport::unlisten(self, address))
        }
        #[inline(always)]
        fn dispose(&self) -> Boxed<'_, ()> {
            Box::pin(Transport::dispose(self))
        }
    }
}
