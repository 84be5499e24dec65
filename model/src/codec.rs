#[cfg(feature = "bincode")]
pub mod bincode;
#[cfg(feature = "cbor")]
pub mod cbor;
pub mod json;

use std::borrow::Cow;

use crate::Envelope;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
#[derive(serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CodecKind(pub u8);

impl std::fmt::Display for CodecKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

impl CodecKind {
    pub const CBOR: Self = Self(0x00);
    pub const BINCODE: Self = Self(0x01);
    pub const JSON: Self = Self(0x40);
}

impl Default for CodecKind {
    fn default() -> Self {
        #[cfg(feature = "bincode")]
        {
            CodecKind::BINCODE
        }
        #[cfg(not(feature = "bincode"))]
        {
            CodecKind::JSON
        }
    }
}

#[derive(Debug)]
pub struct CodecError {
    pub context: Cow<'static, str>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "codec error: {}", self.context)?;
        if let Some(source) = &self.source {
            write!(f, " with source: {}", source)?;
        }
        Ok(())
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl CodecError {
    pub fn new(context: impl Into<Cow<'static, str>>) -> Self {
        Self {
            context: context.into(),
            source: None,
        }
    }
    pub fn decode_error(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            context: "decode".into(),
            source: Some(Box::new(e)),
        }
    }
    pub fn encode_error(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            context: "encode".into(),
            source: Some(Box::new(e)),
        }
    }
    pub fn unknown_kind(kind: u8) -> Self {
        Self::new(format!("unknown codec kind {kind:02x}"))
    }
}

pub trait Codec: Send + Sync + 'static {
    fn encode(&self, value: &Envelope) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Envelope, CodecError>;
    fn kind(&self) -> CodecKind;
}

/// Look up the codec registered for `kind`.
pub fn codec_for(kind: CodecKind) -> Result<&'static dyn Codec, CodecError> {
    match kind {
        CodecKind::JSON => Ok(&json::Json),
        #[cfg(feature = "bincode")]
        CodecKind::BINCODE => Ok(&bincode::Bincode),
        #[cfg(feature = "cbor")]
        CodecKind::CBOR => Ok(&cbor::Cbor),
        other => Err(CodecError::unknown_kind(other.0)),
    }
}

/// Encode a wire frame: one codec kind byte followed by the encoded envelope.
pub fn encode_frame(kind: CodecKind, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let codec = codec_for(kind)?;
    let body = codec.encode(envelope)?;
    let mut frame = Vec::with_capacity(body.len() + 1);
    frame.push(kind.0);
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame produced by [`encode_frame`], whatever codec the sender picked.
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, CodecError> {
    let (kind, body) = frame
        .split_first()
        .ok_or_else(|| CodecError::new("empty frame"))?;
    codec_for(CodecKind(*kind))?.decode(body)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::Utc;

    use super::*;
    use crate::{Address, MessageType, NodeId};

    fn sample() -> Envelope {
        let mut envelope = Envelope::builder(
            MessageType::const_new("Query"),
            Bytes::from_static(b"{\"number\":13}"),
            NodeId::new_indexed(2).control_address(),
        )
        .reply_to(NodeId::new_indexed(1).control_address())
        .scheduled_at(Utc::now())
        .build();
        envelope.source = Some(NodeId::new_indexed(1));
        envelope
    }

    #[test]
    fn test_json_frame() {
        let envelope = sample();
        let frame = encode_frame(CodecKind::JSON, &envelope).unwrap();
        assert_eq!(frame[0], CodecKind::JSON.0);
        assert_eq!(decode_frame(&frame).unwrap(), envelope);
    }

    #[cfg(feature = "bincode")]
    #[test]
    fn test_bincode_frame() {
        let envelope = sample();
        let frame = encode_frame(CodecKind::BINCODE, &envelope).unwrap();
        let decoded = decode_frame(&frame).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.destination, Address::Control(NodeId::new_indexed(2)));
    }

    #[test]
    fn test_bad_frames() {
        assert!(decode_frame(&[]).is_err());
        assert!(decode_frame(&[0x7e, 1, 2, 3]).is_err());
        assert!(decode_frame(&[CodecKind::JSON.0, b'{']).is_err());
    }
}
