use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::net::{DeviceId, MacAddr};
use crate::resource::Resource;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PortState {
    #[default]
    Inactive,
    Active,
}

/// A pod's attachment to a logical network.
///
/// `port_number` stays `None` until the dataplane binding is observed, which
/// is also when `state` flips to `Active`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalPort {
    pub port_id: String,
    pub network_id: String,
    pub ip_address: Ipv4Addr,
    pub mac_address: MacAddr,
    pub device_id: DeviceId,
    #[serde(default)]
    pub port_number: Option<u32>,
    #[serde(default)]
    pub state: PortState,
}

impl LogicalPort {
    pub fn is_active(&self) -> bool {
        self.state == PortState::Active && self.port_number.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortTransition {
    Activated,
    Inactivated,
}

impl Resource for LogicalPort {
    type Transition = PortTransition;
    const KIND: &'static str = "ports";

    fn uid(&self) -> &str {
        &self.port_id
    }

    fn transitions(old: &Self, new: &Self) -> Vec<PortTransition> {
        match (old.state, new.state) {
            (PortState::Inactive, PortState::Active) => vec![PortTransition::Activated],
            (PortState::Active, PortState::Inactive) => vec![PortTransition::Inactivated],
            _ => Vec::new(),
        }
    }
}
