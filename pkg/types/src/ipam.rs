use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use crate::resource::{NoTransition, Resource};

/// One address of a network's pool. Lives in exactly one of the
/// available/allocated stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamEntry {
    pub ipam_id: String,
    pub ip_address: Ipv4Addr,
    pub network_id: String,
}

impl IpamEntry {
    pub fn new(network_id: &str, ip_address: Ipv4Addr) -> Self {
        Self {
            ipam_id: Self::id_for(network_id, ip_address),
            ip_address,
            network_id: network_id.to_string(),
        }
    }

    pub fn id_for(network_id: &str, ip: Ipv4Addr) -> String {
        format!("{}-{}", network_id, ip)
    }
}

impl Resource for IpamEntry {
    type Transition = NoTransition;
    const KIND: &'static str = "ipam";

    fn uid(&self) -> &str {
        &self.ipam_id
    }
}
