//! Built-in control-plane messages.
//!
//! These travel on the control channel of a node and are handled by the runtime itself.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typeshare::typeshare;

use crate::{message::json::Json, MessageAttribute, MessageType, NodeId};

/// Liveness signal, updates the sender's heartbeat in the node registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[typeshare]
pub struct NodeHeartbeat {
    pub node_id: NodeId,
    pub service_name: String,
    pub time: DateTime<Utc>,
}

impl MessageAttribute for NodeHeartbeat {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("courier/heartbeat");
    const DURABLE: bool = false;
}

/// Diagnostics request answered with a [`Pong`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[typeshare]
pub struct Ping {
    pub sent_at: DateTime<Utc>,
}

impl MessageAttribute for Ping {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("courier/ping");
    const DURABLE: bool = false;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[typeshare]
pub struct Pong {
    pub node_id: NodeId,
    pub sent_at: DateTime<Utc>,
}

impl MessageAttribute for Pong {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("courier/pong");
    const DURABLE: bool = false;
}

/// Hand a unit of work to the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[typeshare]
pub struct AssignWork {
    pub work_id: String,
}

impl MessageAttribute for AssignWork {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("courier/assign-work");
}

/// Take a unit of work away from the receiving node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[typeshare]
pub struct ReleaseWork {
    pub work_id: String,
}

impl MessageAttribute for ReleaseWork {
    const MESSAGE_TYPE: MessageType = MessageType::const_new("courier/release-work");
}

pub type HeartbeatMessage = Json<NodeHeartbeat>;
pub type PingMessage = Json<Ping>;
pub type PongMessage = Json<Pong>;
pub type AssignWorkMessage = Json<AssignWork>;
pub type ReleaseWorkMessage = Json<ReleaseWork>;
