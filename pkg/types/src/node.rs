use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use crate::net::DeviceId;
use crate::resource::Resource;

// --- Node readiness ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    #[default]
    Init,
    Complete,
    Incomplete,
    OffBoarded,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Init => write!(f, "INIT"),
            NodeState::Complete => write!(f, "COMPLETE"),
            NodeState::Incomplete => write!(f, "INCOMPLETE"),
            NodeState::OffBoarded => write!(f, "OFF_BOARDED"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum NodeRole {
    Master,
    #[default]
    Minion,
}

// --- Persisted Node object ---

/// A cluster node as seen by the overlay: one integration bridge, an
/// optional tunnel port and an optional uplink to the external network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    #[serde(default)]
    pub role: NodeRole,
    pub node_ip: Ipv4Addr,
    pub integration_bridge: DeviceId,
    #[serde(default)]
    pub tunnel_port: Option<u32>,
    #[serde(default)]
    pub external_port: Option<u32>,
    #[serde(default)]
    pub external_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub external_gateway_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub state: NodeState,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Node {
    pub fn is_complete(&self) -> bool {
        self.state == NodeState::Complete
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTransition {
    Complete,
    Incomplete,
    OffBoarded,
}

impl Resource for Node {
    type Transition = NodeTransition;
    const KIND: &'static str = "nodes";

    fn uid(&self) -> &str {
        &self.hostname
    }

    fn transitions(old: &Self, new: &Self) -> Vec<NodeTransition> {
        if old.state == new.state {
            return Vec::new();
        }
        match new.state {
            NodeState::Complete => vec![NodeTransition::Complete],
            NodeState::Incomplete => vec![NodeTransition::Incomplete],
            NodeState::OffBoarded => vec![NodeTransition::OffBoarded],
            NodeState::Init => Vec::new(),
        }
    }
}
