//! Pipeline table ids and rule priorities.
//!
//! The static skeleton is the linear chain in [`SKELETON_TABLES`]; every
//! other table is entered only through an explicit goto/resubmit.

pub type TableId = u8;

pub const STAT_INBOUND_TABLE: TableId = 0;
pub const VTAG_TABLE: TableId = 30;
pub const ARP_TABLE: TableId = 35;
pub const JUMP_TABLE: TableId = 40;
pub const NAMESPACE_TABLE: TableId = 49;
pub const GROUPING_TABLE: TableId = 50;
pub const NAT_TABLE: TableId = 51;
pub const SERVICE_TABLE: TableId = 52;
pub const POD_TABLE: TableId = 53;
pub const NODE_PORT_TABLE: TableId = 54;
/// Source-side policy: egress isolation of the sending pod.
pub const ACL_EGRESS_TABLE: TableId = 55;
/// Destination-side policy: ingress isolation of the receiving pod.
pub const ACL_INGRESS_TABLE: TableId = 56;
pub const ROUTING_TABLE: TableId = 60;
pub const STAT_OUTBOUND_TABLE: TableId = 70;
pub const FORWARDING_TABLE: TableId = 80;

/// Tables wired together with empty-match transitions when a node completes.
pub const SKELETON_TABLES: [TableId; 11] = [
    STAT_INBOUND_TABLE,
    VTAG_TABLE,
    ARP_TABLE,
    JUMP_TABLE,
    NAMESPACE_TABLE,
    GROUPING_TABLE,
    ACL_EGRESS_TABLE,
    ACL_INGRESS_TABLE,
    ROUTING_TABLE,
    STAT_OUTBOUND_TABLE,
    FORWARDING_TABLE,
];

pub const PRIORITY_TABLE_TRANSITION: u16 = 0;
pub const PRIORITY_TUNNEL_INGRESS_RULE: u16 = 35000;
pub const PRIORITY_TUNNEL_TAG_RULE: u16 = 30000;
pub const PRIORITY_SWITCHING_RULE: u16 = 30000;

pub const PRIORITY_ARP_FLOOD_RULE: u16 = 39000;
pub const PRIORITY_ARP_REPLY_RULE: u16 = 40000;
pub const PRIORITY_ARP_GATEWAY_RULE: u16 = 41000;
pub const PRIORITY_ARP_CONTROL_RULE: u16 = 42000;

pub const PRIORITY_NAT_RULE: u16 = 30000;
pub const PRIORITY_NODE_PORT_RULE: u16 = 31000;
pub const PRIORITY_CT_RULE: u16 = 32000;

/// Policy evaluation: default (0) < block < allow.
pub const PRIORITY_ACL_BLOCK_RULE: u16 = 20000;
pub const PRIORITY_ACL_ALLOW_RULE: u16 = 25000;

pub const PRIORITY_EXTERNAL_ROUTING_RULE: u16 = 25000;
pub const PRIORITY_INTERNAL_ROUTING_RULE: u16 = 26000;
pub const PRIORITY_NODE_PORT_RETURN_RULE: u16 = 28000;

/// Reserved priority: rules installed here get an idle timeout instead of
/// being permanent.
pub const PRIORITY_STATEFUL_SNAT_RULE: u16 = 41500;

/// Conntrack state bits, OVS layout.
pub const CT_STATE_NEW: u32 = 0x01;
pub const CT_STATE_ESTABLISHED: u32 = 0x02;
pub const CT_STATE_REPLY: u32 = 0x08;
pub const CT_STATE_TRACKED: u32 = 0x20;

// --- Application ids: every rule is tagged with its owner ---

pub const APP_SWITCHING: &str = "org.k8snet.switching";
pub const APP_SERVICE_NAT: &str = "org.k8snet.service-nat";
pub const APP_NETWORK_POLICY: &str = "org.k8snet.network-policy";
pub const APP_NODE_PORT: &str = "org.k8snet.node-port";
pub const APP_SNAT: &str = "org.k8snet.snat";
pub const APP_ARP: &str = "org.k8snet.arp";
