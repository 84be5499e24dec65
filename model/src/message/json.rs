use super::{MessageAttribute, MessageCodec, MessageType};
use crate::codec::CodecError;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

/// Carry `T` as a json body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T: Serialize + DeserializeOwned>(pub T);

impl<T: Serialize + DeserializeOwned> MessageCodec for Json<T> {
    fn to_bytes(&self) -> Result<Bytes, CodecError> {
        serde_json::to_vec(&self.0)
            .map(Bytes::from)
            .map_err(CodecError::encode_error)
    }
    fn from_bytes(bytes: Bytes) -> Option<Self> {
        serde_json::from_slice(&bytes).ok().map(Json)
    }
}

impl<T> MessageAttribute for Json<T>
where
    T: Serialize + DeserializeOwned + MessageAttribute,
{
    const MESSAGE_TYPE: MessageType = T::MESSAGE_TYPE;
    const DURABLE: bool = T::DURABLE;
}
