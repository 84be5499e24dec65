use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::{
    address::Address, message::MessageType, node::NodeId, util::MaybeBase64Bytes,
};

#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
#[typeshare(serialized_as = "String")]
#[repr(transparent)]
pub struct EnvelopeId {
    pub bytes: [u8; 16],
}

impl EnvelopeId {
    /// A fresh id: process digest, milliseconds since the epoch and a process-wide counter.
    pub fn new_snowflake() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let timestamp = crate::util::timestamp_millis();
        let counter = COUNTER.fetch_add(1, Ordering::Relaxed);
        let digest = crate::util::process_digest() as u32;
        let mut bytes = [0; 16];
        bytes[0..4].copy_from_slice(&digest.to_be_bytes());
        bytes[4..10].copy_from_slice(&timestamp.to_be_bytes()[2..8]);
        bytes[10..16].copy_from_slice(&counter.to_be_bytes()[2..8]);
        Self { bytes }
    }
    pub fn to_u128(&self) -> u128 {
        u128::from_be_bytes(self.bytes)
    }
    pub fn to_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.bytes)
    }
    pub fn from_base64(s: &str) -> Result<Self, base64::DecodeError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD.decode(s.as_bytes())?;
        if bytes.len() != 16 {
            return Err(base64::DecodeError::InvalidLength(bytes.len()));
        }
        let mut id = [0; 16];
        id.copy_from_slice(&bytes);
        Ok(Self { bytes: id })
    }
}

impl Serialize for EnvelopeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_base64())
        } else {
            <[u8; 16]>::serialize(&self.bytes, serializer)
        }
    }
}

impl<'de> Deserialize<'de> for EnvelopeId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            use serde::de::Error;
            let s = String::deserialize(deserializer)?;
            Self::from_base64(&s).map_err(D::Error::custom)
        } else {
            Ok(Self {
                bytes: <[u8; 16]>::deserialize(deserializer)?,
            })
        }
    }
}

impl std::fmt::Debug for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EnvelopeId").field(&self.to_string()).finish()
    }
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&crate::util::dashed(&[
            crate::util::hex(&self.bytes[0..4]),
            crate::util::hex(&self.bytes[4..10]),
            crate::util::hex(&self.bytes[10..16]),
        ]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[typeshare]
#[repr(u8)]
pub enum EnvelopeStatus {
    Created = 0x00,
    Scheduled = 0x01,
    Sent = 0x02,
    Received = 0x03,
    Completed = 0x04,
    DeadLettered = 0x80,
}

impl std::fmt::Display for EnvelopeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeStatus::Created => write!(f, "Created"),
            EnvelopeStatus::Scheduled => write!(f, "Scheduled"),
            EnvelopeStatus::Sent => write!(f, "Sent"),
            EnvelopeStatus::Received => write!(f, "Received"),
            EnvelopeStatus::Completed => write!(f, "Completed"),
            EnvelopeStatus::DeadLettered => write!(f, "DeadLettered"),
        }
    }
}

impl EnvelopeStatus {
    pub fn try_from_u8(v: u8) -> Option<Self> {
        match v {
            0x00 => Some(EnvelopeStatus::Created),
            0x01 => Some(EnvelopeStatus::Scheduled),
            0x02 => Some(EnvelopeStatus::Sent),
            0x03 => Some(EnvelopeStatus::Received),
            0x04 => Some(EnvelopeStatus::Completed),
            0x80 => Some(EnvelopeStatus::DeadLettered),
            _ => None,
        }
    }
    #[inline(always)]
    pub fn is_terminal(&self) -> bool {
        matches!(self, EnvelopeStatus::Completed | EnvelopeStatus::DeadLettered)
    }
    /// Whether `self` is a legal predecessor of `next`.
    ///
    /// The only step back is the retry cycle into `Scheduled`, which always comes with a new
    /// delivery attempt.
    pub fn can_transition_to(&self, next: EnvelopeStatus) -> bool {
        use EnvelopeStatus::*;
        match next {
            Created => false,
            Scheduled => matches!(self, Created | Sent | Received),
            Sent => matches!(self, Created | Scheduled),
            Received => matches!(self, Sent | Scheduled),
            Completed => matches!(self, Received),
            DeadLettered => !self.is_terminal(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub envelope: EnvelopeId,
    pub from: EnvelopeStatus,
    pub to: EnvelopeStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "envelope {} cannot move from {} to {}",
            self.envelope, self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// The unit of transport: a payload plus its delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[typeshare]
pub struct Envelope {
    pub id: EnvelopeId,
    pub message_type: MessageType,
    pub payload: MaybeBase64Bytes,
    pub destination: Address,
    /// Conversation key; a reply carries the correlation id of its request.
    pub correlation_id: Option<EnvelopeId>,
    /// Set on replies only: the id of the request being answered.
    pub reply_id: Option<EnvelopeId>,
    /// Set on requests only: where the reply should go.
    pub reply_to: Option<Address>,
    pub source: Option<NodeId>,
    pub attempts: u32,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub durable: bool,
    pub status: EnvelopeStatus,
    pub dead_letter_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(message_type: MessageType, payload: impl Into<Bytes>, destination: Address) -> Self {
        Self::builder(message_type, payload, destination).build()
    }
    pub fn builder(
        message_type: MessageType,
        payload: impl Into<Bytes>,
        destination: Address,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder::new(message_type, payload.into(), destination)
    }
    pub fn payload(&self) -> &Bytes {
        &self.payload.0
    }
    pub fn is_reply(&self) -> bool {
        self.reply_id.is_some()
    }
    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }
    /// Whether the envelope may be delivered at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.map_or(true, |time| time <= now)
    }
    /// Build the reply to this request.
    pub fn reply(&self, message_type: MessageType, payload: impl Into<Bytes>) -> Option<Envelope> {
        let reply_to = self.reply_to.clone()?;
        let mut builder = Envelope::builder(message_type, payload, reply_to).durable(self.durable);
        builder.correlation_id = Some(self.correlation_id.unwrap_or(self.id));
        builder.reply_id = Some(self.id);
        Some(builder.build())
    }

    fn transition(&mut self, next: EnvelopeStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                envelope: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
    pub fn mark_scheduled(&mut self, time: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition(EnvelopeStatus::Scheduled)?;
        self.scheduled_time = Some(time);
        Ok(())
    }
    pub fn mark_sent(&mut self) -> Result<(), InvalidTransition> {
        self.transition(EnvelopeStatus::Sent)
    }
    pub fn mark_received(&mut self) -> Result<(), InvalidTransition> {
        self.transition(EnvelopeStatus::Received)
    }
    pub fn mark_completed(&mut self) -> Result<(), InvalidTransition> {
        self.transition(EnvelopeStatus::Completed)
    }
    pub fn mark_dead_lettered(
        &mut self,
        reason: impl Into<String>,
    ) -> Result<(), InvalidTransition> {
        self.transition(EnvelopeStatus::DeadLettered)?;
        self.dead_letter_reason = Some(reason.into());
        Ok(())
    }
    /// Count one more delivery attempt.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }
}

pub struct EnvelopeBuilder {
    message_type: MessageType,
    payload: Bytes,
    destination: Address,
    correlation_id: Option<EnvelopeId>,
    reply_id: Option<EnvelopeId>,
    reply_to: Option<Address>,
    scheduled_time: Option<DateTime<Utc>>,
    durable: bool,
}

impl EnvelopeBuilder {
    #[inline(always)]
    pub fn new(message_type: MessageType, payload: Bytes, destination: Address) -> Self {
        Self {
            message_type,
            payload,
            destination,
            correlation_id: None,
            reply_id: None,
            reply_to: None,
            scheduled_time: None,
            durable: true,
        }
    }
    pub fn correlation_id(mut self, correlation_id: EnvelopeId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }
    pub fn reply_to(mut self, reply_to: Address) -> Self {
        self.reply_to = Some(reply_to);
        self
    }
    pub fn scheduled_at(mut self, time: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(time);
        self
    }
    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }
    pub fn build(self) -> Envelope {
        Envelope {
            id: EnvelopeId::new_snowflake(),
            message_type: self.message_type,
            payload: MaybeBase64Bytes::new(self.payload),
            destination: self.destination,
            correlation_id: self.correlation_id,
            reply_id: self.reply_id,
            reply_to: self.reply_to,
            source: None,
            attempts: 0,
            scheduled_time: self.scheduled_time,
            durable: self.durable,
            status: EnvelopeStatus::Created,
            dead_letter_reason: None,
            created_at: Utc::now(),
        }
    }
}
