use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::resource::{NoTransition, Resource};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkType {
    #[default]
    Vxlan,
    Gre,
    Geneve,
    Flat,
    Vlan,
}

impl NetworkType {
    /// Whether traffic between nodes is carried over a tunnel.
    pub fn is_tunneled(self) -> bool {
        matches!(self, NetworkType::Vxlan | NetworkType::Gre | NetworkType::Geneve)
    }
}

/// A node's pod subnet. By convention `network_id` is the node hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalNetwork {
    pub network_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub network_type: NetworkType,
    pub segment_id: u32,
    pub cidr: Ipv4Net,
    pub gateway_ip: Ipv4Addr,
    #[serde(default)]
    pub mtu: Option<u16>,
}

impl Resource for LogicalNetwork {
    type Transition = NoTransition;
    const KIND: &'static str = "networks";

    fn uid(&self) -> &str {
        &self.network_id
    }
}
