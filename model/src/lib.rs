pub mod address;
pub mod codec;
pub mod control;
pub mod envelope;
pub mod message;
pub mod node;
pub mod util;

pub use address::{Address, AddressParseError};
pub use envelope::{Envelope, EnvelopeBuilder, EnvelopeId, EnvelopeStatus, InvalidTransition};
pub use message::{IntoReply, Message, MessageAttribute, MessageCodec, MessageType, ReplyBody};
pub use node::{NodeId, NodeIdParseError, NodeRecord};
pub use util::MaybeBase64Bytes;
