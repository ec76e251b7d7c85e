//! Match/action rule model shared by every reconciler and driver.

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::mem::discriminant;
use std::net::Ipv4Addr;

use pkg_constants::network::{ETH_TYPE_ARP, ETH_TYPE_IPV4};
use pkg_constants::pipeline::TableId;
use pkg_types::net::{DeviceId, MacAddr, Protocol};

/// One field test of a match. At most one criterion per variant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Criterion {
    InPort(u32),
    EthType(u16),
    EthSrc(MacAddr),
    EthDst(MacAddr),
    TunnelId(u32),
    IpProto(u8),
    Ipv4Src(Ipv4Net),
    Ipv4Dst(Ipv4Net),
    /// Transport source port, compared under `mask`.
    L4Src { port: u16, mask: u16 },
    /// Transport destination port, compared under `mask`.
    L4Dst { port: u16, mask: u16 },
    /// Connection tracking state bits, compared under `mask`.
    CtState { state: u32, mask: u32 },
    ArpOp(u16),
    ArpSpa(Ipv4Addr),
    ArpTpa(Ipv4Addr),
}

/// A conjunction of criteria, kept sorted so equal matches compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Match(Vec<Criterion>);

impl Match {
    /// The empty match: every packet.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn ipv4() -> Self {
        Self::any().eth_type(ETH_TYPE_IPV4)
    }

    pub fn arp() -> Self {
        Self::any().eth_type(ETH_TYPE_ARP)
    }

    /// Add a criterion, replacing any existing one of the same kind.
    pub fn with(mut self, criterion: Criterion) -> Self {
        self.0
            .retain(|c| discriminant(c) != discriminant(&criterion));
        self.0.push(criterion);
        self.0.sort();
        self
    }

    pub fn in_port(self, port: u32) -> Self {
        self.with(Criterion::InPort(port))
    }

    pub fn eth_type(self, eth_type: u16) -> Self {
        self.with(Criterion::EthType(eth_type))
    }

    pub fn eth_dst(self, mac: MacAddr) -> Self {
        self.with(Criterion::EthDst(mac))
    }

    pub fn tunnel_id(self, id: u32) -> Self {
        self.with(Criterion::TunnelId(id))
    }

    pub fn ip_proto(self, proto: u8) -> Self {
        self.with(Criterion::IpProto(proto))
    }

    pub fn protocol(self, proto: Protocol) -> Self {
        self.ip_proto(proto.number())
    }

    pub fn ipv4_src(self, net: Ipv4Net) -> Self {
        self.with(Criterion::Ipv4Src(net))
    }

    pub fn ipv4_dst(self, net: Ipv4Net) -> Self {
        self.with(Criterion::Ipv4Dst(net))
    }

    pub fn ipv4_src_host(self, ip: Ipv4Addr) -> Self {
        self.ipv4_src(Ipv4Net::from(ip))
    }

    pub fn ipv4_dst_host(self, ip: Ipv4Addr) -> Self {
        self.ipv4_dst(Ipv4Net::from(ip))
    }

    pub fn l4_src(self, port: u16) -> Self {
        self.with(Criterion::L4Src { port, mask: u16::MAX })
    }

    pub fn l4_dst(self, port: u16) -> Self {
        self.with(Criterion::L4Dst { port, mask: u16::MAX })
    }

    pub fn l4_dst_masked(self, port: u16, mask: u16) -> Self {
        self.with(Criterion::L4Dst { port, mask })
    }

    pub fn ct_state(self, state: u32, mask: u32) -> Self {
        self.with(Criterion::CtState { state, mask })
    }

    pub fn arp_op(self, op: u16) -> Self {
        self.with(Criterion::ArpOp(op))
    }

    pub fn arp_tpa(self, ip: Ipv4Addr) -> Self {
        self.with(Criterion::ArpTpa(ip))
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtNat {
    Src { addr: Ipv4Addr, port: Option<u16> },
    Dst { addr: Ipv4Addr, port: Option<u16> },
    /// Apply whatever translation the tracked connection already carries.
    Restore,
}

/// Send the packet through connection tracking.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CtAction {
    pub commit: bool,
    pub nat: Option<CtNat>,
    /// Re-enter the pipeline at this table with the ct state populated;
    /// `None` continues with the next action.
    pub recirc_table: Option<TableId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    SetEthSrc(MacAddr),
    SetEthDst(MacAddr),
    SetIpv4Src(Ipv4Addr),
    SetIpv4Dst(Ipv4Addr),
    SetL4Src(u16),
    SetL4Dst(u16),
    /// Overwrite the upper 16 bits of the source address.
    LoadSrcPrefix([u8; 2]),
    /// Overwrite the upper 16 bits of the destination address.
    LoadDstPrefix([u8; 2]),
    SetTunnelId(u32),
    SetTunnelDst(Ipv4Addr),
    Conntrack(CtAction),
    Group(GroupId),
    /// Re-run the packet through `table`.
    Resubmit(TableId),
    /// Continue at `table`; must be the last action.
    Goto(TableId),
    Output(u32),
    /// Rewrite an ARP request into a reply from `mac` and send it back
    /// out of the ingress port.
    ArpReply(MacAddr),
    Flood,
    Controller,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Persistence {
    #[default]
    Permanent,
    IdleTimeout(u64),
}

/// A forwarding rule on one device table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowRule {
    pub app_id: String,
    pub device: DeviceId,
    pub table: TableId,
    pub priority: u16,
    pub selector: Match,
    pub actions: Vec<Action>,
    pub persistence: Persistence,
}

/// Identity of a rule on a switch: two rules with the same key replace
/// each other.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    pub device: DeviceId,
    pub table: TableId,
    pub priority: u16,
    pub selector: Match,
}

impl FlowRule {
    pub fn new(app_id: &str, device: &DeviceId, table: TableId, priority: u16) -> Self {
        Self {
            app_id: app_id.to_string(),
            device: device.clone(),
            table,
            priority,
            selector: Match::any(),
            actions: Vec::new(),
            persistence: Persistence::Permanent,
        }
    }

    pub fn matching(mut self, selector: Match) -> Self {
        self.selector = selector;
        self
    }

    pub fn actions(mut self, actions: Vec<Action>) -> Self {
        self.actions = actions;
        self
    }

    pub fn key(&self) -> FlowKey {
        FlowKey {
            device: self.device.clone(),
            table: self.table,
            priority: self.priority,
            selector: self.selector.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl GroupId {
    /// Stable id for a service's (ip, port, protocol) triple (FNV-1a).
    pub fn for_service(ip: Ipv4Addr, port: u16, protocol: Protocol) -> Self {
        let mut hash: u32 = 0x811c_9dc5;
        let bytes = ip
            .octets()
            .into_iter()
            .chain(port.to_be_bytes())
            .chain([protocol.number()]);
        for b in bytes {
            hash ^= u32::from(b);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        // 0 and the OpenFlow reserved range are not valid group ids.
        GroupId((hash & 0x7fff_ffff).max(1))
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// One equally weighted choice of a select group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupBucket {
    pub actions: Vec<Action>,
}

impl GroupBucket {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    Select,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescription {
    pub app_id: String,
    pub device: DeviceId,
    pub id: GroupId,
    pub group_type: GroupType,
    pub buckets: Vec<GroupBucket>,
}

impl GroupDescription {
    pub fn select(app_id: &str, device: &DeviceId, id: GroupId, buckets: Vec<GroupBucket>) -> Self {
        Self {
            app_id: app_id.to_string(),
            device: device.clone(),
            id,
            group_type: GroupType::Select,
            buckets,
        }
    }
}
