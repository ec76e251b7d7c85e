//! Network-related constants.

/// Default port for the controller HTTP API.
pub const DEFAULT_API_PORT: u16 = 6543;

/// Default Kubernetes service ClusterIP range.
pub const DEFAULT_SERVICE_CIDR: &str = "10.96.0.0/12";

/// Default cluster pod range. Every node network is carved out of this /16.
pub const DEFAULT_POD_CIDR: &str = "10.10.0.0/16";

/// Default shadow range used by stateless service NAT.
pub const DEFAULT_SHIFTED_CIDR: &str = "172.10.0.0/16";

/// MAC answered for network gateways and used when ARP learning fails.
pub const DEFAULT_GATEWAY_MAC: &str = "fe:00:00:00:00:20";

/// Idle timeout applied to rules installed at the stateful-NAT priority.
pub const DEFAULT_STATEFUL_NAT_IDLE_TIMEOUT_SECS: u64 = 60;

/// Fixed sleep between ARP requests while learning a gateway MAC.
pub const DEFAULT_ARP_RETRY_INTERVAL_MS: u64 = 1000;

/// Number of ARP requests sent before falling back to the default gateway MAC.
pub const DEFAULT_ARP_MAX_RETRIES: u32 = 5;

/// Cluster IP value Kubernetes uses for headless services.
pub const CLUSTER_IP_NONE: &str = "None";

/// EtherType for IPv4.
pub const ETH_TYPE_IPV4: u16 = 0x0800;

/// EtherType for ARP.
pub const ETH_TYPE_ARP: u16 = 0x0806;

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;
pub const IP_PROTO_SCTP: u8 = 132;
