use crate::Envelope;

use super::Codec;
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Bincode;

pub const BINCODE_CONFIG: bincode::config::Configuration = bincode::config::standard();

impl Codec for Bincode {
    fn decode(&self, bytes: &[u8]) -> Result<Envelope, super::CodecError> {
        Ok(bincode::serde::decode_from_slice(bytes, BINCODE_CONFIG)
            .map_err(super::CodecError::decode_error)?
            .0)
    }
    fn encode(&self, value: &Envelope) -> Result<Vec<u8>, super::CodecError> {
        bincode::serde::encode_to_vec(value, BINCODE_CONFIG)
            .map_err(super::CodecError::encode_error)
    }
    fn kind(&self) -> super::CodecKind {
        super::CodecKind::BINCODE
    }
}
