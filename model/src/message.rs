pub mod json;
use std::{convert::Infallible, fmt::Display, str::FromStr};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::{codec::CodecError, Address, Envelope};

/// Logical type tag of an envelope, used to pick a handler.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[typeshare(serialized_as = "String")]
pub struct MessageType(Bytes);

impl MessageType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Bytes::from(name.into()))
    }
    pub const fn const_new(name: &'static str) -> Self {
        Self(Bytes::from_static(name.as_bytes()))
    }
    pub fn as_str(&self) -> &str {
        // constructed from str only
        std::str::from_utf8(self.0.as_ref()).unwrap_or_default()
    }
    /// Message types under `courier/` are reserved for the control plane.
    pub fn is_reserved(&self) -> bool {
        self.as_str().starts_with(Self::RESERVED_PREFIX)
    }
    pub const RESERVED_PREFIX: &'static str = "courier/";
}

impl From<&'static str> for MessageType {
    fn from(value: &'static str) -> Self {
        MessageType::const_new(value)
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        MessageType::new(value)
    }
}

impl FromStr for MessageType {
    type Err = Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(MessageType::new(s))
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("MessageType").field(&self.as_str()).finish()
    }
}

impl Serialize for MessageType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let string = String::deserialize(deserializer)?;
        Ok(MessageType::new(string))
    }
}

pub trait MessageCodec: Sized {
    fn from_bytes(bytes: Bytes) -> Option<Self>;
    fn to_bytes(&self) -> Result<Bytes, CodecError>;
}

pub trait MessageAttribute {
    const MESSAGE_TYPE: MessageType;
    /// Whether the envelope goes through the outbox and inbox.
    const DURABLE: bool = true;
}

/// A typed message that can be wrapped into an [`Envelope`].
pub trait Message: MessageAttribute + MessageCodec + Send + 'static {
    fn into_envelope(self, destination: Address) -> Result<Envelope, CodecError>;
}

impl<M> Message for M
where
    M: MessageAttribute + MessageCodec + Send + 'static,
{
    fn into_envelope(self, destination: Address) -> Result<Envelope, CodecError> {
        let payload = self.to_bytes()?;
        Ok(Envelope::builder(M::MESSAGE_TYPE, payload, destination)
            .durable(M::DURABLE)
            .build())
    }
}

/// Type tag and body of a handler's reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyBody {
    pub message_type: MessageType,
    pub payload: Bytes,
}

/// What a handler may return: `()` for no reply, or any [`Message`] to answer a request.
pub trait IntoReply: Send + 'static {
    fn into_reply(self) -> Result<Option<ReplyBody>, CodecError>;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Option<ReplyBody>, CodecError> {
        Ok(None)
    }
}

impl<M: Message> IntoReply for M {
    fn into_reply(self) -> Result<Option<ReplyBody>, CodecError> {
        Ok(Some(ReplyBody {
            message_type: M::MESSAGE_TYPE,
            payload: self.to_bytes()?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_prefix() {
        assert!(MessageType::const_new("courier/ping").is_reserved());
        assert!(!MessageType::const_new("Query").is_reserved());
    }

    #[test]
    fn test_unit_has_no_reply() {
        assert_eq!(().into_reply().unwrap(), None);
    }
}
