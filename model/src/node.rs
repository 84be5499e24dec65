use std::{str::FromStr, sync};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::address::Address;

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[typeshare(serialized_as = "string")]
pub struct NodeId {
    pub bytes: [u8; 16],
}

impl Serialize for NodeId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            <[u8; 16]>::serialize(&self.bytes, serializer)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            NodeId::from_str(&s).map_err(D::Error::custom)
        } else {
            let bytes = <[u8; 16]>::deserialize(deserializer)?;
            Ok(NodeId { bytes })
        }
    }
}

impl From<u64> for NodeId {
    fn from(id: u64) -> Self {
        Self::new_indexed(id)
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeId").field(&self.to_string()).finish()
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&crate::util::dashed(&[
            crate::util::hex(&self.bytes[0..1]),
            crate::util::hex(&self.bytes[1..9]),
            crate::util::hex(&self.bytes[9..10]),
            crate::util::hex(&self.bytes[10..16]),
        ]))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdParseError {
    pub input: String,
}

impl std::fmt::Display for NodeIdParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid node id: {:?}", self.input)
    }
}

impl std::error::Error for NodeIdParseError {}

impl FromStr for NodeId {
    type Err = NodeIdParseError;
    /// Parse the dashed hex form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = || NodeIdParseError {
            input: s.to_owned(),
        };
        let segments = s.split('-').map(str::len).collect::<Vec<_>>();
        if segments != [2, 16, 2, 12] {
            return Err(error());
        }
        let digits = s.replace('-', "");
        let mut bytes = [0u8; 16];
        for (index, byte) in bytes.iter_mut().enumerate() {
            let pair = digits.get(index * 2..index * 2 + 2).ok_or_else(error)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| error())?;
        }
        Ok(NodeId { bytes })
    }
}

impl NodeId {
    pub const KIND_INDEXED: u8 = 0x00;
    pub const KIND_SHA256: u8 = 0x01;
    pub const KIND_SNOWFLAKE: u8 = 0x02;
    pub const fn new_indexed(id: u64) -> Self {
        let mut bytes = [0; 16];
        bytes[0] = Self::KIND_INDEXED;
        let index_part = id.to_be_bytes();
        bytes[1] = index_part[0];
        bytes[2] = index_part[1];
        bytes[3] = index_part[2];
        bytes[4] = index_part[3];
        bytes[5] = index_part[4];
        bytes[6] = index_part[5];
        bytes[7] = index_part[6];
        bytes[8] = index_part[7];
        NodeId { bytes }
    }
    pub fn sha256(bytes: &[u8]) -> Self {
        let dg = <sha2::Sha256 as sha2::Digest>::digest(bytes);
        let mut bytes = [0; 16];
        bytes[0] = Self::KIND_SHA256;
        bytes[1..16].copy_from_slice(&dg.as_slice()[0..15]);
        NodeId { bytes }
    }
    /// A node id unique to this process instance.
    pub fn snowflake() -> NodeId {
        static INSTANCE_ID: std::sync::atomic::AtomicU8 = std::sync::atomic::AtomicU8::new(0);
        let dg = crate::util::process_digest();
        let mut bytes = [0; 16];
        bytes[0] = Self::KIND_SNOWFLAKE;
        bytes[1..9].copy_from_slice(&dg.to_be_bytes());
        bytes[9..10].copy_from_slice(
            &INSTANCE_ID
                .fetch_add(1, sync::atomic::Ordering::SeqCst)
                .to_be_bytes(),
        );
        bytes[10..16].copy_from_slice(&crate::util::timestamp_millis().to_be_bytes()[2..8]);
        NodeId { bytes }
    }
    pub fn kind(&self) -> u8 {
        self.bytes[0]
    }
    /// The address of this node's control channel.
    ///
    /// Derived from the id alone, so any node can reach any other node's control channel as soon
    /// as it learns the id.
    pub fn control_address(&self) -> Address {
        Address::Control(*self)
    }
}

/// Registry entry of a live node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[typeshare]
pub struct NodeRecord {
    pub node_id: NodeId,
    /// Role label, it never takes part in routing.
    pub service_name: String,
    pub control_address: Address,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl NodeRecord {
    pub fn new(node_id: NodeId, service_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node_id,
            service_name: service_name.into(),
            control_address: node_id.control_address(),
            started_at: now,
            last_heartbeat: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_round_trip() {
        let id = NodeId::snowflake();
        let text = id.to_string();
        assert_eq!(NodeId::from_str(&text).unwrap(), id);
        let indexed = NodeId::new_indexed(7);
        assert_eq!(indexed.to_string(), "00-0000000000000007-00-000000000000");
    }

    #[test]
    fn test_reject_malformed() {
        assert!(NodeId::from_str("not-a-node").is_err());
        assert!(NodeId::from_str("00-000000000000000g-00-000000000000").is_err());
        assert!(NodeId::from_str("000000000000000000000000000000000").is_err());
    }

    #[test]
    fn test_snowflake_distinct() {
        let a = NodeId::snowflake();
        let b = NodeId::snowflake();
        assert_ne!(a, b);
        assert_ne!(a.control_address(), b.control_address());
    }

    #[test]
    fn test_sha256_stable() {
        assert_eq!(NodeId::sha256(b"orders"), NodeId::sha256(b"orders"));
        assert_ne!(NodeId::sha256(b"orders"), NodeId::sha256(b"billing"));
        assert_eq!(NodeId::sha256(b"orders").kind(), NodeId::KIND_SHA256);
    }
}
