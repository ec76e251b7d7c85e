use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::net::{IntOrString, Protocol};
use crate::resource::{NoTransition, Resource};
use crate::selector::LabelSelector;

/// Network policy controlling ingress/egress traffic for pods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkPolicy {
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// Pods in `namespace` this policy applies to
    #[serde(default)]
    pub pod_selector: LabelSelector,
    /// Which traffic directions this policy controls
    #[serde(default)]
    pub policy_types: Vec<PolicyType>,
    /// Allowed inbound traffic rules
    #[serde(default)]
    pub ingress: Vec<PolicyRule>,
    /// Allowed outbound traffic rules
    #[serde(default)]
    pub egress: Vec<PolicyRule>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NetworkPolicy {
    /// Kubernetes defaulting: with no explicit types, ingress is always
    /// isolated and egress only when egress rules are present.
    pub fn isolates(&self, direction: PolicyType) -> bool {
        if self.policy_types.is_empty() {
            return match direction {
                PolicyType::Ingress => true,
                PolicyType::Egress => !self.egress.is_empty(),
            };
        }
        self.policy_types.contains(&direction)
    }

    pub fn rules(&self, direction: PolicyType) -> &[PolicyRule] {
        match direction {
            PolicyType::Ingress => &self.ingress,
            PolicyType::Egress => &self.egress,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PolicyType {
    Ingress,
    Egress,
}

/// An allow rule. Ingress rules list sources, egress rules destinations.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyRule {
    /// Empty means every peer.
    #[serde(default, alias = "from", alias = "to")]
    pub peers: Vec<PolicyPeer>,
    /// Empty means every port.
    #[serde(default)]
    pub ports: Vec<PolicyPort>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpBlock {
    pub cidr: Ipv4Net,
    #[serde(default)]
    pub except: Vec<Ipv4Net>,
}

/// A peer in a network policy rule.
///
/// `ip_block` is exclusive with the selectors. With only `pod_selector` the
/// policy's own namespace is implied; with `namespace_selector` the pods of
/// every matching namespace are selected, narrowed by `pod_selector` if set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyPeer {
    #[serde(default)]
    pub pod_selector: Option<LabelSelector>,
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default)]
    pub ip_block: Option<IpBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyPort {
    #[serde(default)]
    pub protocol: Protocol,
    /// Missing means every port of `protocol`.
    #[serde(default)]
    pub port: Option<IntOrString>,
    /// Inclusive range end; only valid with a numeric `port`.
    #[serde(default)]
    pub end_port: Option<u16>,
}

impl Resource for NetworkPolicy {
    type Transition = NoTransition;
    const KIND: &'static str = "networkpolicies";

    fn uid(&self) -> &str {
        &self.id
    }
}
