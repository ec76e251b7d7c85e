use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use pkg_constants::network::{ARP_OP_REPLY, ARP_OP_REQUEST, ETH_TYPE_ARP, ETH_TYPE_IPV4};
use pkg_constants::pipeline::TableId;
use pkg_types::net::{DeviceId, MacAddr, Protocol};

/// Header view of a packet, enough to drive the pipeline.
///
/// For ARP frames `ipv4_src`/`ipv4_dst` carry the sender and target
/// protocol addresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    pub in_port: u32,
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub eth_type: u16,
    pub ipv4_src: Ipv4Addr,
    pub ipv4_dst: Ipv4Addr,
    pub ip_proto: u8,
    pub l4_src: u16,
    pub l4_dst: u16,
    pub arp_op: u16,
    pub tunnel_id: Option<u32>,
    pub tunnel_dst: Option<Ipv4Addr>,
    pub ct_state: u32,
}

impl Packet {
    pub fn ipv4(
        protocol: Protocol,
        src: (Ipv4Addr, u16),
        dst: (Ipv4Addr, u16),
    ) -> Self {
        Self {
            in_port: 0,
            eth_src: MacAddr::ZERO,
            eth_dst: MacAddr::ZERO,
            eth_type: ETH_TYPE_IPV4,
            ipv4_src: src.0,
            ipv4_dst: dst.0,
            ip_proto: protocol.number(),
            l4_src: src.1,
            l4_dst: dst.1,
            arp_op: 0,
            tunnel_id: None,
            tunnel_dst: None,
            ct_state: 0,
        }
    }

    pub fn tcp(src: (Ipv4Addr, u16), dst: (Ipv4Addr, u16)) -> Self {
        Self::ipv4(Protocol::Tcp, src, dst)
    }

    pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            in_port: 0,
            eth_src: sender_mac,
            eth_dst: MacAddr::BROADCAST,
            eth_type: ETH_TYPE_ARP,
            ipv4_src: sender_ip,
            ipv4_dst: target_ip,
            ip_proto: 0,
            l4_src: 0,
            l4_dst: 0,
            arp_op: ARP_OP_REQUEST,
            tunnel_id: None,
            tunnel_dst: None,
            ct_state: 0,
        }
    }

    pub fn arp_reply(
        sender_mac: MacAddr,
        sender_ip: Ipv4Addr,
        target_mac: MacAddr,
        target_ip: Ipv4Addr,
    ) -> Self {
        Self {
            eth_dst: target_mac,
            arp_op: ARP_OP_REPLY,
            ..Self::arp_request(sender_mac, sender_ip, target_ip)
        }
    }

    pub fn from_port(mut self, port: u32) -> Self {
        self.in_port = port;
        self
    }

    pub fn is_arp(&self) -> bool {
        self.eth_type == ETH_TYPE_ARP
    }

    pub fn is_ipv4(&self) -> bool {
        self.eth_type == ETH_TYPE_IPV4
    }
}

/// A packet punted to the controller by a `Controller` action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    pub device: DeviceId,
    pub table: TableId,
    pub packet: Packet,
}

/// Where a packet-out is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutPort {
    Port(u32),
    /// Run the packet through the device pipeline from the first table.
    Table,
}
