use std::str::FromStr;

use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::node::NodeId;

/// Destination of an envelope.
///
/// Control addresses are written `control://{node_id}`; every other address is an opaque
/// `scheme://rest` uri left to a transport to resolve.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[typeshare(serialized_as = "String")]
pub enum Address {
    Control(NodeId),
    Endpoint(String),
}

impl Address {
    pub const CONTROL_SCHEME: &'static str = "control";
    pub fn scheme(&self) -> &str {
        match self {
            Address::Control(_) => Self::CONTROL_SCHEME,
            Address::Endpoint(uri) => uri.split_once("://").map(|(s, _)| s).unwrap_or_default(),
        }
    }
    pub fn is_control(&self) -> bool {
        matches!(self, Address::Control(_))
    }
    pub fn control_node(&self) -> Option<NodeId> {
        match self {
            Address::Control(id) => Some(*id),
            Address::Endpoint(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressParseError {
    pub input: String,
    pub reason: &'static str,
}

impl std::fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid address {:?}: {}", self.input, self.reason)
    }
}

impl std::error::Error for AddressParseError {}

impl FromStr for Address {
    type Err = AddressParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let error = |reason| AddressParseError {
            input: s.to_owned(),
            reason,
        };
        let (scheme, rest) = s.split_once("://").ok_or_else(|| error("missing scheme"))?;
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(error("invalid scheme"));
        }
        if rest.is_empty() {
            return Err(error("missing authority"));
        }
        if scheme == Self::CONTROL_SCHEME {
            let authority = rest.trim_end_matches('/');
            let id = NodeId::from_str(authority).map_err(|_| error("invalid node id"))?;
            Ok(Address::Control(id))
        } else {
            Ok(Address::Endpoint(s.to_owned()))
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Control(id) => write!(f, "{}://{}", Self::CONTROL_SCHEME, id),
            Address::Endpoint(uri) => f.write_str(uri),
        }
    }
}

impl std::fmt::Debug for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Address").field(&self.to_string()).finish()
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error;
        let s = String::deserialize(deserializer)?;
        Address::from_str(&s).map_err(D::Error::custom)
    }
}

impl From<NodeId> for Address {
    fn from(id: NodeId) -> Self {
        Address::Control(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_address_round_trip() {
        let id = NodeId::new_indexed(42);
        let address = id.control_address();
        let text = address.to_string();
        assert_eq!(text, "control://00-000000000000002a-00-000000000000");
        assert_eq!(Address::from_str(&text).unwrap(), address);
        assert_eq!(address.control_node(), Some(id));
    }

    #[test]
    fn test_endpoint_address() {
        let address = Address::from_str("local://orders").unwrap();
        assert_eq!(address.scheme(), "local");
        assert!(!address.is_control());
        assert_eq!(address.to_string(), "local://orders");
    }

    #[test]
    fn test_malformed() {
        assert!(Address::from_str("orders").is_err());
        assert!(Address::from_str("local://").is_err());
        assert!(Address::from_str("://x").is_err());
        assert!(Address::from_str("control://nobody").is_err());
    }

    #[test]
    fn test_distinct_nodes_distinct_addresses() {
        let ids = (0..64).map(NodeId::new_indexed).collect::<Vec<_>>();
        for (i, a) in ids.iter().enumerate() {
            for b in ids.iter().skip(i + 1) {
                assert_ne!(a.control_address(), b.control_address());
            }
        }
    }
}
