//! Dispatch table from message types to async handlers.
//!
//! The table is built once before a runtime starts and never changes afterwards. Every runtime
//! merges its built-in control handlers into the table handed to it.
use std::{collections::HashMap, future::Future, marker::PhantomData};

use futures_util::{future::BoxFuture, FutureExt};

use crate::model::{
    codec::CodecError, Envelope, IntoReply, Message, MessageType, ReplyBody,
};

pub trait Handler<A>: Clone + Sync + Send + 'static {
    type Error: std::error::Error + Send;
    type Message: Message;
    type Reply: IntoReply;
    fn handle(
        self,
        message: Self::Message,
    ) -> impl Future<Output = Result<Self::Reply, Self::Error>> + Send;
}

/// Function adapter: any `Fn(M) -> impl Future<Output = Result<R, E>>` is a handler.
#[derive(Debug, Clone)]
pub struct PlainFnAdapter<M, R, E>(PhantomData<*const fn(M) -> Result<R, E>>);

impl<M, R, E, F, Fut> Handler<PlainFnAdapter<M, R, E>> for F
where
    E: std::error::Error + Send,
    M: Message,
    R: IntoReply,
    F: (Fn(M) -> Fut) + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send,
{
    type Error = E;
    type Message = M;
    type Reply = R;
    fn handle(self, message: Self::Message) -> impl Future<Output = Result<R, E>> + Send {
        (self)(message)
    }
}

/// Why a handler did not complete an envelope.
#[derive(Debug)]
pub enum HandlerFailure {
    /// The payload does not decode as the handler's message type, retrying will not help.
    Decode,
    /// The reply could not be encoded.
    Encode(CodecError),
    /// The handler returned an error.
    Failed(String),
}

impl HandlerFailure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerFailure::Failed(_))
    }
}

impl std::fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandlerFailure::Decode => write!(f, "payload could not be decoded"),
            HandlerFailure::Encode(e) => write!(f, "reply could not be encoded: {e}"),
            HandlerFailure::Failed(e) => write!(f, "{e}"),
        }
    }
}

pub type HandlerResult = Result<Option<ReplyBody>, HandlerFailure>;

type InnerHandler = dyn Fn(Envelope) -> BoxFuture<'static, HandlerResult> + Send + Sync;

pub struct HandlerTable {
    handlers: HashMap<MessageType, Box<InnerHandler>>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("message_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }
    pub fn contains(&self, message_type: &MessageType) -> bool {
        self.handlers.contains_key(message_type)
    }
    pub fn message_types(&self) -> impl Iterator<Item = &MessageType> {
        self.handlers.keys()
    }
    /// The handler future for `envelope`, `None` when nothing handles its type.
    pub fn dispatch(&self, envelope: Envelope) -> Option<BoxFuture<'static, HandlerResult>> {
        let handler = self.handlers.get(&envelope.message_type)?;
        Some((handler)(envelope))
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<MessageType, Box<InnerHandler>>,
}

impl std::fmt::Debug for HandlerTableBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTableBuilder")
            .field("message_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerTableBuilder {
    pub fn with_handler<A>(mut self, handler: impl Handler<A>) -> Self {
        self.register_handler(handler);
        self
    }
    /// Register `handler` for its message type, replacing any previous one.
    pub fn register_handler<H, A>(&mut self, handler: H)
    where
        H: Handler<A>,
    {
        let message_type = <H::Message as crate::model::MessageAttribute>::MESSAGE_TYPE;
        tracing::debug!(%message_type, "register handler");
        let inner_handler = Box::new(move |envelope: Envelope| {
            let handler = handler.clone();
            async move {
                let Some(message) = <H::Message as crate::model::MessageCodec>::from_bytes(
                    envelope.payload().clone(),
                ) else {
                    tracing::debug!(id = %envelope.id, "failed to decode message");
                    return Err(HandlerFailure::Decode);
                };
                match handler.handle(message).await {
                    Ok(reply) => reply.into_reply().map_err(HandlerFailure::Encode),
                    Err(e) => Err(HandlerFailure::Failed(e.to_string())),
                }
            }
            .boxed()
        });
        if self.handlers.insert(message_type.clone(), inner_handler).is_some() {
            tracing::warn!(%message_type, "handler replaced");
        }
    }
    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}
